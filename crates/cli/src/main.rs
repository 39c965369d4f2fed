use std::{collections::BTreeMap, path::Path, str::FromStr, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

use ranch_api::{RbacStore, ResourceStore, Store};
use ranch_core::{AccessListByVerb, ApiEvent, ApiObject, ApiRequest, ApiSchema, EventName, ProxyConfig, UserInfo, WatchRequest};
use ranch_kubehub::{discover_schemas, find_schema, KubeClientFactory};

#[derive(Parser, Debug)]
#[command(name = "ranchctl", version, about = "Access-enforcing Kubernetes proxy CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace to scope the request to
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// User to act as
    #[arg(long = "as", global = true, env = "RANCH_AS")]
    user: Option<String>,

    /// Groups of the user to act as (repeatable)
    #[arg(long = "as-group", global = true)]
    groups: Vec<String>,

    /// YAML/JSON file of grants keyed by schema id; without it every kind is fully granted
    #[arg(long = "grants", global = true)]
    grants: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover served resources (incl. CRDs)
    Discover,
    /// List objects of a kind
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        #[arg(long = "limit")]
        limit: Option<u32>,
        /// Continue token from a previous page
        #[arg(long = "continue")]
        continue_token: Option<String>,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Get one object by name
    Get { gvk: String, name: String },
    /// Watch a kind and print events until Ctrl-C
    Watch {
        gvk: String,
        /// Revision to start from; "-1" starts from now, empty starts after a fresh list
        #[arg(long = "revision", default_value = "")]
        revision: String,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
        #[arg(long = "bookmarks")]
        bookmarks: bool,
    },
    /// Delete one object by name
    Rm { gvk: String, name: String },
}

impl Commands {
    fn gvk(&self) -> Option<&str> {
        match self {
            Commands::Discover => None,
            Commands::Ls { gvk, .. } | Commands::Get { gvk, .. } | Commands::Watch { gvk, .. } | Commands::Rm { gvk, .. } => {
                Some(gvk)
            }
        }
    }
}

fn init_tracing() {
    let env = std::env::var("RANCH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RANCH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid RANCH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Grants for `schema_id` from a grants document; kinds the document omits get nothing.
fn grants_for(doc: &str, schema_id: &str) -> Result<AccessListByVerb> {
    let table: BTreeMap<String, AccessListByVerb> = serde_yaml::from_str(doc).context("parsing grants")?;
    Ok(table.get(schema_id).cloned().unwrap_or_default())
}

fn load_grants(path: Option<&str>, schema_id: &str) -> Result<AccessListByVerb> {
    match path {
        None => Ok(AccessListByVerb::new().grant_all("list").grant_all("watch")),
        Some(p) => {
            let doc = std::fs::read_to_string(Path::new(p)).with_context(|| format!("reading grants file {}", p))?;
            grants_for(&doc, schema_id)
        }
    }
}

fn build_request(cli: &Cli) -> ApiRequest {
    let mut req = ApiRequest::default();
    if let Some(user) = cli.user.as_deref() {
        req = req.with_user(UserInfo::new(user).with_groups(cli.groups.iter().cloned()));
    }
    if let Some(ns) = cli.namespace.as_deref() {
        req = req.with_namespace(ns);
    }
    req
}

fn print_objects(output: Output, objects: &[ApiObject]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "REVISION");
            for o in objects {
                println!(
                    "{:<20} {:<40} {}",
                    o.namespace().unwrap_or("-"),
                    o.name(),
                    o.resource_version().unwrap_or("-")
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(objects)?),
    }
    Ok(())
}

fn print_event(output: Output, ev: &ApiEvent) -> Result<()> {
    if output == Output::Json {
        println!("{}", serde_json::to_string(ev)?);
        return Ok(());
    }
    let id = ev.object.as_ref().map(|o| o.id.as_str()).unwrap_or_default();
    match ev.name {
        EventName::Create => println!("+ {}", id),
        EventName::Change => println!("~ {}", id),
        EventName::Remove => println!("- {}", id),
        EventName::Bookmark => println!("# {}", ev.revision),
        EventName::Error => println!("! {}", ev.error.as_ref().map(|e| e.to_string()).unwrap_or_default()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let config = ProxyConfig::from_env();
    let factory = KubeClientFactory::infer(config.impersonate).await?;
    let trusted = factory.trusted();

    if let Commands::Discover = cli.command {
        let schemas = discover_schemas(trusted).await?;
        match cli.output {
            Output::Human => {
                for s in &schemas {
                    let scope = if s.namespaced { "namespaced" } else { "cluster" };
                    println!("{} • {} • {} • {}", s.api_version(), s.kind, s.id, scope);
                }
            }
            Output::Json => println!("{}", serde_json::to_string_pretty(&schemas)?),
        }
        return Ok(());
    }

    let req = build_request(&cli);
    let cancel = req.cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; cancelling");
            cancel.cancel();
        }
    });
    let store = RbacStore::new(Store::new(Arc::new(factory), config));

    let Some(gvk) = cli.command.gvk() else {
        return Ok(());
    };
    let schema: ApiSchema = find_schema(trusted, gvk).await?;
    let grants = load_grants(cli.grants.as_deref(), &schema.id)?;
    let schema = schema.with_access(grants);

    match &cli.command {
        Commands::Ls { limit, continue_token, selector, .. } => {
            let mut req = req;
            if let Some(limit) = limit {
                req = req.with_param("limit", limit.to_string());
            }
            if let Some(token) = continue_token {
                req = req.with_param("continue", token.clone());
            }
            if let Some(selector) = selector {
                req = req.with_param("labelSelector", selector.clone());
            }
            info!(schema = %schema.id, ns = ?req.namespace, "ls invoked");
            let list = store.list(&req, &schema).await?;
            print_objects(cli.output, &list.objects)?;
            if !list.continue_token.is_empty() {
                eprintln!("continue: {}", list.continue_token);
            }
        }
        Commands::Get { name, .. } => {
            let obj = store.by_id(&req, &schema, name).await?;
            match cli.output {
                Output::Human => println!("{}", serde_yaml::to_string(&obj.object)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj.object)?),
            }
        }
        Commands::Watch { revision, selector, bookmarks, .. } => {
            let mut req = req;
            if *bookmarks {
                req = req.with_param("allowWatchBookmarks", "true");
            }
            let mut w = WatchRequest::at(revision.clone());
            if let Some(selector) = selector {
                w = w.with_selector(selector.clone());
            }
            info!(schema = %schema.id, ns = ?req.namespace, revision = %w.revision, "watch invoked");
            let mut rx = store.watch(&req, &schema, w).await?;
            while let Some(ev) = rx.recv().await {
                print_event(cli.output, &ev)?;
            }
            warn!("watch ended");
        }
        Commands::Rm { name, .. } => match store.delete(&req, &schema, name).await? {
            Some(obj) => println!("deleting {} (finalizers pending)", obj.id),
            None => println!("deleted {}", name),
        },
        Commands::Discover => {}
    }
    Ok(())
}
