use std::io::Read;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use opkit_apply::{create_or_update_from_template_with_outcome, update_status};
use opkit_core::{
    fingerprint, generate_name, generate_password, read_fingerprint, Object, ObjectKey, ObjectWriter,
};
use opkit_kubehub::KubeStore;
use opkit_reference::{ObjectReference, ParentContext, Resolved};
use opkit_schema::{gvk_key, Scheme};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{info, warn};

mod manifest;

use manifest::{parse_manifest, Manifest};

#[derive(Parser, Debug)]
#[command(name = "opkitctl", version, about = "opkit CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace override (default: manifest namespace, then "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the content fingerprint of a manifest (no cluster access)
    Hash {
        /// Manifest path, or "-" for stdin
        file: String,
    },
    /// Converge a live object to a manifest, writing only on fingerprint change
    Apply {
        /// Manifest path, or "-" for stdin
        file: String,
    },
    /// Write the manifest's `status` to the live object's status sub-resource
    Status {
        /// Manifest path, or "-" for stdin
        file: String,
    },
    /// Resolve a reference and report what it points at
    Resolve {
        /// Kind of the target, e.g. "Secret"
        kind: String,
        /// Name of the target
        name: String,
        /// Target apiVersion (default: --parent-api-version)
        #[arg(long = "api-version")]
        api_version: Option<String>,
        /// apiVersion of the referencing resource
        #[arg(long = "parent-api-version", default_value = "v1")]
        parent_api_version: String,
    },
    /// Generate names and passwords
    Gen {
        #[command(subcommand)]
        what: GenCommands,
    },
}

#[derive(Subcommand, Debug)]
enum GenCommands {
    /// "<prefix>-xxxxx"
    Name { prefix: String },
    /// Random password
    Password {
        #[arg(long = "length", default_value_t = 32)]
        length: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("OPKIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OPKIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid OPKIT_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(file: &str) -> Result<String> {
    if file == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file))
    }
}

fn load(file: &str, ns: Option<&str>) -> Result<Manifest> {
    parse_manifest(&read_input(file)?, ns)
}

/// Kinds the CLI can decode into concrete types.
fn scheme() -> Scheme {
    Scheme::new().with::<ConfigMap>().with::<Secret>().with::<Deployment>().with::<Service>()
}

#[derive(Debug, Serialize)]
struct Report {
    kind: String,
    key: String,
    outcome: &'static str,
    resource_version: String,
    fingerprint: String,
}

fn report<K: Object>(obj: &K, outcome: &'static str) -> Report {
    Report {
        kind: K::kind(&()).into_owned(),
        key: obj.key().to_string(),
        outcome,
        resource_version: obj.meta().resource_version.clone().unwrap_or_default(),
        fingerprint: read_fingerprint(obj),
    }
}

fn decode<K: Object>(m: &Manifest) -> Result<K> {
    serde_json::from_value(m.json.clone()).with_context(|| format!("decoding {} manifest", m.gvk.kind))
}

/// Fingerprint of the typed template, i.e. the value `apply` stamps.
fn hash_as<K: Object>(m: &Manifest) -> Result<String> {
    let template: K = decode(m)?;
    fingerprint(&template).context("computing fingerprint")
}

async fn apply_as<S: ObjectWriter, K: Object>(store: &S, m: &Manifest) -> Result<Report> {
    let template: K = decode(m)?;
    let (live, outcome) = create_or_update_from_template_with_outcome(store, &template).await?;
    Ok(report(&live, outcome.as_str()))
}

/// Replace `obj`'s status with `status`, going through JSON so any kind works.
fn set_status<K: Object>(obj: &mut K, status: &Json) -> Result<()> {
    let mut v = serde_json::to_value(&*obj)?;
    if let Some(root) = v.as_object_mut() {
        root.insert("status".into(), status.clone());
    }
    *obj = serde_json::from_value(v).context("applying status")?;
    Ok(())
}

async fn status_as<S: ObjectWriter, K: Object>(store: &S, m: &Manifest) -> Result<Report> {
    let status = m.json.get("status").cloned().ok_or_else(|| anyhow!("manifest has no status"))?;
    let live: K = update_status(store, &m.key, |obj: &mut K| set_status(obj, &status)).await?;
    Ok(report(&live, "status-written"))
}

fn unsupported(m: &Manifest) -> anyhow::Error {
    anyhow!("unsupported kind {} (supported: ConfigMap, Secret, Deployment, Service)", gvk_key(&m.gvk))
}

fn hash_manifest(m: &Manifest) -> Result<String> {
    match (m.gvk.api_version().as_str(), m.gvk.kind.as_str()) {
        ("v1", "ConfigMap") => hash_as::<ConfigMap>(m),
        ("v1", "Secret") => hash_as::<Secret>(m),
        ("v1", "Service") => hash_as::<Service>(m),
        ("apps/v1", "Deployment") => hash_as::<Deployment>(m),
        _ => Err(unsupported(m)),
    }
}

async fn apply_manifest<S: ObjectWriter>(store: &S, m: &Manifest) -> Result<Report> {
    match (m.gvk.api_version().as_str(), m.gvk.kind.as_str()) {
        ("v1", "ConfigMap") => apply_as::<_, ConfigMap>(store, m).await,
        ("v1", "Secret") => apply_as::<_, Secret>(store, m).await,
        ("v1", "Service") => apply_as::<_, Service>(store, m).await,
        ("apps/v1", "Deployment") => apply_as::<_, Deployment>(store, m).await,
        _ => Err(unsupported(m)),
    }
}

async fn status_manifest<S: ObjectWriter>(store: &S, m: &Manifest) -> Result<Report> {
    match (m.gvk.api_version().as_str(), m.gvk.kind.as_str()) {
        ("v1", "Service") => status_as::<_, Service>(store, m).await,
        ("apps/v1", "Deployment") => status_as::<_, Deployment>(store, m).await,
        _ => Err(unsupported(m)),
    }
}

fn print_report(output: Output, r: &Report) -> Result<()> {
    match output {
        Output::Human => println!("{} {} {} (rv {}, fingerprint {})", r.kind, r.key, r.outcome, r.resource_version, r.fingerprint),
        Output::Json => println!("{}", serde_json::to_string_pretty(r)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Hash { file } => {
            let m = load(&file, ns)?;
            let hash = hash_manifest(&m)?;
            match cli.output {
                Output::Human => println!("{}", hash),
                Output::Json => println!("{}", serde_json::json!({ "key": m.key.to_string(), "fingerprint": hash })),
            }
        }
        Commands::Apply { file } => {
            let m = load(&file, ns)?;
            info!(gvk = %gvk_key(&m.gvk), key = %m.key, "apply invoked");
            let store = KubeStore::try_default().await?;
            let r = apply_manifest(&store, &m).await?;
            print_report(cli.output, &r)?;
        }
        Commands::Status { file } => {
            let m = load(&file, ns)?;
            info!(gvk = %gvk_key(&m.gvk), key = %m.key, "status invoked");
            let store = KubeStore::try_default().await?;
            let r = status_manifest(&store, &m).await?;
            print_report(cli.output, &r)?;
        }
        Commands::Resolve { kind, name, api_version, parent_api_version } => {
            let namespace = ns.unwrap_or("default");
            info!(kind = %kind, name = %name, ns = %namespace, "resolve invoked");
            let store = KubeStore::try_default().await?;
            let mut reference = ObjectReference::new(kind, name);
            if let Some(v) = api_version {
                reference = reference.api_version(v);
            }
            let parent = ParentContext::new(namespace, parent_api_version);
            let scheme = scheme();
            let resolved = reference.resolve_in(&store, &scheme, &parent).await.map_err(|e| {
                if e.is_retryable() {
                    warn!(error = %e, "reference target does not exist yet");
                }
                e
            })?;
            let form = match resolved {
                Resolved::Typed(_) => "typed",
                Resolved::Dynamic(_) => "generic",
            };
            let gvk = resolved.gvk().map(|g| gvk_key(&g)).unwrap_or_default();
            let meta = resolved.meta();
            let key = ObjectKey::new(
                meta.namespace.clone().unwrap_or_default(),
                meta.name.clone().unwrap_or_default(),
            );
            match cli.output {
                Output::Human => println!("{} {} ({})", gvk, key, form),
                Output::Json => println!(
                    "{}",
                    serde_json::json!({ "gvk": gvk, "key": key.to_string(), "form": form, "uid": meta.uid })
                ),
            }
        }
        Commands::Gen { what } => match what {
            GenCommands::Name { prefix } => println!("{}", generate_name(&prefix)),
            GenCommands::Password { length } => println!("{}", generate_password(length)?),
        },
    }

    Ok(())
}
