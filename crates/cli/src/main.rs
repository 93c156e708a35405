//! kstorectl: run registry verbs against the memory or Postgres backend.

#![forbid(unsafe_code)]

use std::io::Read;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kstore_core::{empty_list, DynamicList, GroupResource, JsonCodec, Object, ObjectList, RequestContext, WatchEvent};
use kstore_registry::{Registry, ResourceConfig, Strategy};
use kube::core::{DynamicObject, Resource};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tokio::signal;
use tracing::{info, warn};

mod config;
mod resources;

use config::{Backends, StoreArgs};
use resources::{group_resource_of, ConfigMapStrategy, CustomResourceStrategy, NamespaceStrategy, ResourceSpec, SecretStrategy};

#[derive(Parser, Debug)]
#[command(name = "kstorectl", version, about = "kstore CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Request namespace; omit for cluster-scoped types or to span all namespaces
    #[arg(short = 'n', long = "namespace", global = true)]
    namespace: Option<String>,

    /// Kind of a custom resource given as group/version/plural
    #[arg(long = "kind", global = true)]
    kind: Option<String>,

    /// Treat the custom resource as cluster-scoped
    #[arg(long = "cluster-scoped", action = ArgAction::SetTrue, global = true)]
    cluster_scoped: bool,

    #[command(flatten)]
    store: StoreArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Create backend tables for the given resources (idempotent)
    Migrate {
        #[arg(required = true)]
        resources: Vec<String>,
    },
    /// Read one object
    Get { resource: String, name: String },
    /// List objects in the namespace (or everywhere without -n)
    Ls { resource: String },
    /// Create an object from a YAML or JSON file ("-" for stdin)
    Create {
        resource: String,
        #[arg(short = 'f', long = "filename")]
        file: String,
    },
    /// Replace an object from a YAML or JSON file
    Replace {
        resource: String,
        #[arg(short = 'f', long = "filename")]
        file: String,
        /// Create the object when it does not exist
        #[arg(long = "allow-create", action = ArgAction::SetTrue)]
        allow_create: bool,
    },
    /// Delete one object
    Delete { resource: String, name: String },
    /// Delete every object in scope
    DeleteAll { resource: String },
    /// Print events until Ctrl-C or until the watch is closed
    Watch { resource: String },
    /// Run one command per line from a file ("-" for stdin) against one opened
    /// backend; blank lines and `#` comments are skipped, the first failure stops
    Script { file: String },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Migrate { .. } => "migrate",
            Commands::Get { .. } => "get",
            Commands::Ls { .. } => "ls",
            Commands::Create { .. } => "create",
            Commands::Replace { .. } => "replace",
            Commands::Delete { .. } => "delete",
            Commands::DeleteAll { .. } => "delete-all",
            Commands::Watch { .. } => "watch",
            Commands::Script { .. } => "script",
        }
    }

    fn resource(&self) -> Option<&str> {
        match self {
            Commands::Migrate { .. } | Commands::Script { .. } => None,
            Commands::Get { resource, .. }
            | Commands::Ls { resource }
            | Commands::Create { resource, .. }
            | Commands::Replace { resource, .. }
            | Commands::Delete { resource, .. }
            | Commands::DeleteAll { resource }
            | Commands::Watch { resource } => Some(resource.as_str()),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KSTORE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KSTORE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KSTORE_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let backends = Backends::open(&cli.store).await?;
    match &cli.command {
        Commands::Script { file } => run_script(file, &backends).await,
        _ => execute(&cli, &backends).await,
    }
}

/// Parse every line before running any, so a typo cannot leave a half-applied script.
fn parse_script(raw: &str) -> Result<Vec<Cli>> {
    let mut out = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cli = Cli::try_parse_from(std::iter::once("kstorectl").chain(line.split_whitespace()))
            .with_context(|| format!("script line {}", idx + 1))?;
        match cli.command {
            Commands::Watch { .. } | Commands::Script { .. } => {
                bail!("script line {}: `{}` cannot run inside a script", idx + 1, cli.command.name())
            }
            _ => out.push(cli),
        }
    }
    Ok(out)
}

async fn run_script(file: &str, backends: &Backends) -> Result<()> {
    let steps = parse_script(&read_source(file)?)?;
    info!(file, steps = steps.len(), "running script");
    for (idx, cli) in steps.iter().enumerate() {
        execute(cli, backends).await.with_context(|| format!("script step {} ({})", idx + 1, cli.command.name()))?;
    }
    Ok(())
}

async fn execute(cli: &Cli, backends: &Backends) -> Result<()> {
    counter!("kstorectl_commands_total", 1, "command" => cli.command.name());
    let ctx = RequestContext::with_namespace(cli.namespace.clone());

    if let Commands::Migrate { resources } = &cli.command {
        for name in resources {
            let gr = group_resource_of(name)?;
            backends.for_resource(&gr).migrate().await.with_context(|| format!("migrating {gr}"))?;
            println!("{gr} migrated");
        }
        return Ok(());
    }

    let Some(name) = cli.command.resource() else { return Ok(()) };
    let spec = ResourceSpec::parse(name, cli.kind.as_deref(), cli.cluster_scoped)?;
    let gr = spec.group_resource();
    let backend = backends.for_resource(&gr);
    let buffer = cli.store.watch_buffer;
    info!(command = cli.command.name(), resource = %gr, ns = ?ctx.namespace(), "kstorectl invoked");

    match spec {
        ResourceSpec::ConfigMaps => {
            let cfg = ResourceConfig::new(gr, true, ConfigMap::default, empty_list::<ConfigMap>).with_watch_buffer(buffer);
            let reg = Registry::new(cfg, Arc::new(JsonCodec::new()), backend);
            run(cli, &ctx, &reg, &ConfigMapStrategy).await
        }
        ResourceSpec::Secrets => {
            let cfg = ResourceConfig::new(gr, true, Secret::default, empty_list::<Secret>).with_watch_buffer(buffer);
            let reg = Registry::new(cfg, Arc::new(JsonCodec::new()), backend);
            run(cli, &ctx, &reg, &SecretStrategy).await
        }
        ResourceSpec::Namespaces => {
            let cfg = ResourceConfig::new(gr, false, Namespace::default, empty_list::<Namespace>).with_watch_buffer(buffer);
            let reg = Registry::new(cfg, Arc::new(JsonCodec::new()), backend);
            run(cli, &ctx, &reg, &NamespaceStrategy).await
        }
        ResourceSpec::Custom { ar, namespaced } => {
            let (obj_ar, list_ar) = (ar.clone(), ar.clone());
            let cfg = ResourceConfig::new(
                gr,
                namespaced,
                move || DynamicObject::new("", &obj_ar),
                move || DynamicList::new(&list_ar),
            )
            .with_watch_buffer(buffer);
            let reg = Registry::new(cfg, Arc::new(JsonCodec::new()), backend);
            run(cli, &ctx, &reg, &CustomResourceStrategy { ar, namespaced }).await
        }
    }
}

async fn run<T, L>(cli: &Cli, ctx: &RequestContext, reg: &Registry<T, L>, strategy: &dyn Strategy<T>) -> Result<()>
where
    T: Object + Resource + Serialize + DeserializeOwned,
    L: ObjectList<T> + Serialize,
{
    let gr = reg.resource().clone();
    match &cli.command {
        Commands::Migrate { .. } | Commands::Script { .. } => {}
        Commands::Get { name, .. } => {
            let obj = reg.get(ctx, name).await?;
            match cli.output {
                Output::Human => print_table(std::slice::from_ref(&obj)),
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
            }
        }
        Commands::Ls { .. } => {
            let list = reg.list(ctx).await?;
            match cli.output {
                Output::Human => print_table(list.items()),
                Output::Json => println!("{}", serde_json::to_string_pretty(&list)?),
            }
        }
        Commands::Create { file, .. } => {
            let obj: T = read_manifest(file)?;
            let ctx = context_for(ctx, &obj, reg.namespace_scoped());
            let created = reg.create_with(&ctx, obj, strategy).await?;
            report(cli.output, &gr, &created, "created")?;
        }
        Commands::Replace { file, allow_create, .. } => {
            let obj: T = read_manifest(file)?;
            let ctx = context_for(ctx, &obj, reg.namespace_scoped());
            let name = obj.name().to_string();
            let (stored, created) = reg.replace_with(&ctx, &name, obj, strategy, *allow_create).await?;
            report(cli.output, &gr, &stored, if created { "created" } else { "replaced" })?;
        }
        Commands::Delete { name, .. } => {
            let (old, _) = reg.delete_with(ctx, name, strategy).await?;
            report(cli.output, &gr, &old, "deleted")?;
        }
        Commands::DeleteAll { .. } => {
            let removed = reg.delete_collection_with(ctx, strategy).await?;
            match cli.output {
                Output::Human => {
                    for obj in removed.items() {
                        println!("{}/{} deleted", gr, key_of(obj));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&removed)?),
            }
        }
        Commands::Watch { .. } => {
            let mut watcher = reg.watch(ctx).await?;
            loop {
                tokio::select! {
                    maybe = watcher.recv() => {
                        match maybe {
                            Some(ev) => print_event(cli.output, &ev)?,
                            None => {
                                warn!(resource = %gr, "watch closed by the registry; re-run to resume");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            watcher.stop();
        }
    }
    Ok(())
}

/// Without `-n`, a namespaced object is addressed by its own `metadata.namespace`.
fn context_for<T: Object>(ctx: &RequestContext, obj: &T, namespaced: bool) -> RequestContext {
    if !namespaced || ctx.namespace().is_some() {
        return ctx.clone();
    }
    RequestContext::with_namespace(obj.namespace().map(str::to_string))
}

/// File contents, or all of stdin for "-".
fn read_source(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {path}"))
}

/// YAML is a superset of JSON, so one parser covers both.
fn read_manifest<T: DeserializeOwned>(path: &str) -> Result<T> {
    serde_yaml::from_str(&read_source(path)?).with_context(|| format!("parsing {path}"))
}

fn report<T: Object + Serialize>(output: Output, gr: &GroupResource, obj: &T, verb: &str) -> Result<()> {
    match output {
        Output::Human => println!("{}/{} {}", gr, key_of(obj), verb),
        Output::Json => println!("{}", serde_json::to_string_pretty(obj)?),
    }
    Ok(())
}

fn print_event<T: Object + Serialize>(output: Output, ev: &WatchEvent<T>) -> Result<()> {
    match output {
        Output::Human => println!("{:<8} {}", ev.kind.to_string(), key_of(&ev.object)),
        Output::Json => println!("{}", serde_json::to_string(ev)?),
    }
    Ok(())
}

fn print_table<T: Object + Resource>(items: &[T]) {
    println!("NAMESPACE   NAME                 AGE");
    for item in items {
        let ns_col = item.namespace().unwrap_or("-");
        let created = item.meta().creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0);
        println!("{:<11} {:<20} {}", ns_col, item.name(), render_age(created));
    }
}

fn key_of<T: Object>(obj: &T) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name()),
        None => obj.name().to_string(),
    }
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = chrono::Utc::now().timestamp();
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
