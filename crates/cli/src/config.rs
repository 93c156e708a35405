//! Backend selection and pool settings, from flags or `KSTORE_*` env vars.

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};
use kstore_core::GroupResource;
use kstore_persist::{PgPool, PostgresConfig, PostgresStore};
use kstore_registry::DEFAULT_WATCH_BUFFER;
use kstore_store::{Backend, MemoryStore};
use rustc_hash::FxHashMap;
use tracing::{info, warn};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum BackendKind {
    Memory,
    Postgres,
}

#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Storage backend
    #[arg(long, value_enum, env = "KSTORE_BACKEND", default_value_t = BackendKind::Memory, global = true)]
    pub backend: BackendKind,

    /// Postgres connection URL (required with --backend postgres)
    #[arg(long = "database-url", env = "KSTORE_DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,

    #[arg(long = "pg-max-connections", env = "KSTORE_PG_MAX_CONNECTIONS", default_value_t = 10, global = true)]
    pub pg_max_connections: u32,

    #[arg(long = "pg-connect-timeout-ms", env = "KSTORE_PG_CONNECT_TIMEOUT_MS", default_value_t = 5_000, global = true)]
    pub pg_connect_timeout_ms: u64,

    #[arg(long = "pg-acquire-timeout-ms", env = "KSTORE_PG_ACQUIRE_TIMEOUT_MS", default_value_t = 5_000, global = true)]
    pub pg_acquire_timeout_ms: u64,

    /// Pending events a watcher may hold before it is evicted
    #[arg(long = "watch-buffer", env = "KSTORE_WATCH_BUFFER", default_value_t = DEFAULT_WATCH_BUFFER, global = true)]
    pub watch_buffer: usize,
}

impl StoreArgs {
    pub fn postgres_config(&self) -> Result<PostgresConfig> {
        let Some(url) = self.database_url.as_deref().filter(|u| !u.is_empty()) else {
            bail!("--backend postgres needs --database-url or KSTORE_DATABASE_URL");
        };
        Ok(PostgresConfig {
            url: url.to_string(),
            max_connections: self.pg_max_connections,
            connect_timeout_ms: self.pg_connect_timeout_ms,
            acquire_timeout_ms: self.pg_acquire_timeout_ms,
        })
    }
}

/// Opened backend; hands out one store per resource type. Memory stores are
/// cached so every registry for a type in this process shares one map.
pub enum Backends {
    Memory(Mutex<FxHashMap<GroupResource, Arc<dyn Backend>>>),
    Postgres(PgPool),
}

impl Backends {
    pub async fn open(args: &StoreArgs) -> Result<Self> {
        match args.backend {
            BackendKind::Memory => {
                warn!("memory backend keeps data only for the life of this process; chain commands with `script`");
                Ok(Self::memory())
            }
            BackendKind::Postgres => {
                let cfg = args.postgres_config()?;
                let pool = kstore_persist::connect(&cfg).await?;
                info!(backend = "postgres", "backend opened");
                Ok(Self::Postgres(pool))
            }
        }
    }

    pub fn memory() -> Self { Self::Memory(Mutex::new(FxHashMap::default())) }

    pub fn for_resource(&self, gr: &GroupResource) -> Arc<dyn Backend> {
        match self {
            Self::Memory(stores) => {
                let mut stores = stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                stores.entry(gr.clone()).or_insert_with(|| Arc::new(MemoryStore::new())).clone()
            }
            Self::Postgres(pool) => Arc::new(PostgresStore::new(pool.clone(), gr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(flatten)]
        store: StoreArgs,
    }

    #[test]
    fn defaults_to_memory() {
        let h = Harness::try_parse_from(["kstorectl"]).unwrap();
        assert_eq!(h.store.backend, BackendKind::Memory);
        assert_eq!(h.store.watch_buffer, DEFAULT_WATCH_BUFFER);
    }

    #[test]
    fn postgres_requires_a_url() {
        let h = Harness::try_parse_from(["kstorectl", "--backend", "postgres", "--database-url", ""]).unwrap();
        assert!(h.store.postgres_config().is_err());

        let h = Harness::try_parse_from([
            "kstorectl",
            "--backend",
            "postgres",
            "--database-url",
            "postgres://u:p@localhost/kstore",
            "--pg-max-connections",
            "3",
        ])
        .unwrap();
        let cfg = h.store.postgres_config().unwrap();
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.acquire_timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn memory_stores_are_shared_per_resource() {
        let backends = Backends::memory();
        let cms = GroupResource::core("v1", "configmaps");
        let first = backends.for_resource(&cms);
        first.write(&kstore_core::ObjectKey::namespaced("ns1", "a"), b"{}").await.unwrap();

        let again = backends.for_resource(&cms);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.list().await.unwrap().len(), 1);

        let secrets = backends.for_resource(&GroupResource::core("v1", "secrets"));
        assert!(secrets.list().await.unwrap().is_empty());
    }
}
