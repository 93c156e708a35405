//! kstore persistence: Postgres backend storing each resource type in its own
//! JSONB table. Keep code tiny and predictable.
//!
//! Table layout per resource type:
//!
//! ```sql
//! CREATE TABLE "<group>__<version>__<resource>" (
//!     name      TEXT  NOT NULL,
//!     namespace TEXT  NOT NULL,   -- '' for cluster-scoped types
//!     data      JSONB NOT NULL,
//!     PRIMARY KEY (name, namespace)
//! )
//! ```

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use kstore_core::{GroupResource, ObjectKey};
use kstore_store::{Backend, StoreError, StoreResult};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, info};

pub use sqlx::PgPool;

/// Pool settings. The URL may carry credentials; never log it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), max_connections: 10, connect_timeout_ms: 5_000, acquire_timeout_ms: 5_000 }
    }
}

/// Open a pool shared by every resource table.
pub async fn connect(cfg: &PostgresConfig) -> anyhow::Result<PgPool> {
    let started = Instant::now();
    let opts = PgConnectOptions::from_str(&cfg.url).context("parsing postgres url")?;
    let pool = tokio::time::timeout(
        Duration::from_millis(cfg.connect_timeout_ms),
        PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(Duration::from_millis(cfg.acquire_timeout_ms))
            .connect_with(opts),
    )
    .await
    .map_err(|_| anyhow!("connecting to postgres timed out after {}ms", cfg.connect_timeout_ms))?
    .context("connecting to postgres")?;
    info!(max_connections = cfg.max_connections, took_ms = %started.elapsed().as_millis(), "postgres pool ready");
    Ok(pool)
}

/// Postgres truncates identifiers beyond this many bytes.
const MAX_IDENT_LEN: usize = 63;

/// Deterministic table name: `group__version__resource`, the core group rendered
/// as `core`, every other non-alphanumeric character replaced by `_`. Names over
/// 63 bytes keep a prefix and end in a 16-hex-digit hash of the full name, so
/// distinct long names never collapse into one truncated table.
pub fn table_name(gr: &GroupResource) -> String {
    let group = if gr.group.is_empty() { "core" } else { gr.group.as_str() };
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    };
    let full = format!("{}__{}__{}", sanitize(group), sanitize(&gr.version), sanitize(&gr.resource));
    if full.len() <= MAX_IDENT_LEN {
        return full;
    }
    let digest = format!("{:016x}", fnv1a64(full.as_bytes()));
    // Sanitized names are ASCII, so any byte offset is a char boundary.
    let keep = MAX_IDENT_LEN - digest.len() - 1;
    format!("{}_{}", &full[..keep], digest)
}

/// FNV-1a; stable across platforms and releases, which table names must be.
fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3))
}

struct Statements {
    create: String,
    exists: String,
    select: String,
    upsert: String,
    insert: String,
    replace: String,
    delete: String,
    list: String,
    list_keyed: String,
}

impl Statements {
    fn for_table(t: &str) -> Self {
        Self {
            create: format!(
                r#"CREATE TABLE IF NOT EXISTS "{t}" (
                    name      TEXT  NOT NULL,
                    namespace TEXT  NOT NULL,
                    data      JSONB NOT NULL,
                    PRIMARY KEY (name, namespace)
                )"#
            ),
            exists: format!(r#"SELECT EXISTS(SELECT 1 FROM "{t}" WHERE name = $1 AND namespace = $2)"#),
            select: format!(r#"SELECT data::text FROM "{t}" WHERE name = $1 AND namespace = $2"#),
            upsert: format!(
                r#"INSERT INTO "{t}" (name, namespace, data) VALUES ($1, $2, $3::jsonb)
                   ON CONFLICT (name, namespace) DO UPDATE SET data = EXCLUDED.data"#
            ),
            insert: format!(
                r#"INSERT INTO "{t}" (name, namespace, data) VALUES ($1, $2, $3::jsonb)
                   ON CONFLICT (name, namespace) DO NOTHING"#
            ),
            replace: format!(r#"UPDATE "{t}" SET data = $3::jsonb WHERE name = $1 AND namespace = $2"#),
            delete: format!(r#"DELETE FROM "{t}" WHERE name = $1 AND namespace = $2"#),
            list: format!(r#"SELECT data::text FROM "{t}""#),
            list_keyed: format!(r#"SELECT name, namespace, data::text FROM "{t}""#),
        }
    }
}

/// One resource type's table. Cheap to construct; share the pool between tables.
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    sql: Statements,
}

impl PostgresStore {
    pub fn new(pool: PgPool, gr: &GroupResource) -> Self {
        let table = table_name(gr);
        let sql = Statements::for_table(&table);
        Self { pool, table, sql }
    }

    pub fn table(&self) -> &str { &self.table }

    fn observe(&self, op: &'static str, started: Instant) {
        histogram!("persist_query_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
    }
}

fn as_json_text(data: &[u8]) -> anyhow::Result<&str> {
    std::str::from_utf8(data).context("record is not utf-8 JSON")
}

fn key_from_row(name: String, namespace: String) -> ObjectKey {
    if namespace.is_empty() { ObjectKey::cluster(name) } else { ObjectKey::namespaced(namespace, name) }
}

#[async_trait]
impl Backend for PostgresStore {
    async fn exists(&self, key: &ObjectKey) -> StoreResult<bool> {
        let started = Instant::now();
        let found: bool = sqlx::query_scalar(&self.sql.exists)
            .bind(&key.name)
            .bind(key.namespace_str())
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("checking {} in {}", key, self.table))?;
        self.observe("exists", started);
        Ok(found)
    }

    async fn read(&self, key: &ObjectKey) -> StoreResult<Vec<u8>> {
        let started = Instant::now();
        let row: Option<String> = sqlx::query_scalar(&self.sql.select)
            .bind(&key.name)
            .bind(key.namespace_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("reading {} from {}", key, self.table))?;
        self.observe("read", started);
        row.map(String::into_bytes).ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()> {
        let started = Instant::now();
        sqlx::query(&self.sql.upsert)
            .bind(&key.name)
            .bind(key.namespace_str())
            .bind(as_json_text(data)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("writing {} to {}", key, self.table))?;
        self.observe("write", started);
        Ok(())
    }

    async fn insert(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()> {
        let started = Instant::now();
        let res = sqlx::query(&self.sql.insert)
            .bind(&key.name)
            .bind(key.namespace_str())
            .bind(as_json_text(data)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting {} into {}", key, self.table))?;
        self.observe("insert", started);
        if res.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        Ok(())
    }

    async fn replace(&self, key: &ObjectKey, data: &[u8]) -> StoreResult<()> {
        let started = Instant::now();
        let res = sqlx::query(&self.sql.replace)
            .bind(&key.name)
            .bind(key.namespace_str())
            .bind(as_json_text(data)?)
            .execute(&self.pool)
            .await
            .with_context(|| format!("replacing {} in {}", key, self.table))?;
        self.observe("replace", started);
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let started = Instant::now();
        let res = sqlx::query(&self.sql.delete)
            .bind(&key.name)
            .bind(key.namespace_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting {} from {}", key, self.table))?;
        self.observe("delete", started);
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn list(&self) -> StoreResult<Vec<Vec<u8>>> {
        let started = Instant::now();
        let rows: Vec<String> = sqlx::query_scalar(&self.sql.list)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("listing {}", self.table))?;
        self.observe("list", started);
        debug!(table = %self.table, count = rows.len(), "postgres list");
        Ok(rows.into_iter().map(String::into_bytes).collect())
    }

    async fn list_with_keys(&self) -> StoreResult<Vec<(ObjectKey, Vec<u8>)>> {
        let started = Instant::now();
        let rows: Vec<(String, String, String)> = sqlx::query_as(&self.sql.list_keyed)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("listing keys of {}", self.table))?;
        self.observe("list_with_keys", started);
        Ok(rows
            .into_iter()
            .map(|(name, ns, data)| (key_from_row(name, ns), data.into_bytes()))
            .collect())
    }

    async fn migrate(&self) -> StoreResult<()> {
        let started = Instant::now();
        sqlx::query(&self.sql.create)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating table {}", self.table))?;
        self.observe("migrate", started);
        info!(table = %self.table, "table ready");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_normalized() {
        assert_eq!(table_name(&GroupResource::core("v1", "configmaps")), "core__v1__configmaps");
        assert_eq!(
            table_name(&GroupResource::new("example.com", "v1alpha1", "widgets")),
            "example_com__v1alpha1__widgets"
        );
        assert_eq!(
            table_name(&GroupResource::new("Stable.Example-Org.io", "v1", "cron/tabs")),
            "stable_example_org_io__v1__cron_tabs"
        );
    }

    #[test]
    fn long_names_fit_postgres_identifiers() {
        let long = |resource: &str| GroupResource::new("very-long-group-name.platform.internal.example.com", "v1beta1", resource);
        let a = table_name(&long("widgetconfigurationsnapshots"));
        let b = table_name(&long("widgetconfigurationsnapshotsv2"));
        assert_eq!(a.len(), MAX_IDENT_LEN);
        assert_eq!(b.len(), MAX_IDENT_LEN);
        assert_ne!(a, b);
        assert!(a.starts_with("very_long_group_name_platform_internal"));
        // Same input, same table across runs.
        assert_eq!(a, table_name(&long("widgetconfigurationsnapshots")));
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn statements_quote_the_table() {
        let sql = Statements::for_table("core__v1__secrets");
        assert!(sql.upsert.contains(r#"INSERT INTO "core__v1__secrets""#));
        assert!(sql.upsert.contains("ON CONFLICT (name, namespace) DO UPDATE SET data = EXCLUDED.data"));
        assert!(sql.insert.contains("DO NOTHING"));
        assert!(sql.replace.starts_with(r#"UPDATE "core__v1__secrets""#));
        assert!(sql.create.contains("PRIMARY KEY (name, namespace)"));
    }

    #[test]
    fn empty_namespace_row_is_cluster_scoped() {
        assert_eq!(key_from_row("a".into(), String::new()), ObjectKey::cluster("a"));
        assert_eq!(key_from_row("a".into(), "ns".into()), ObjectKey::namespaced("ns", "a"));
    }
}
