use std::io::Read;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use konverge_apply::{apply_manifest, EngineOptions};
use konverge_catalog::{discover, KubeRouter};

#[derive(Parser, Debug)]
#[command(name = "konvergectl", version, about = "Konverge CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace for namespaced objects whose manifest omits one
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

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
    /// Converge live state to match a manifest of desired objects
    Apply {
        /// Manifest path; pass - to read from standard input
        #[arg(short = 'f', long = "file")]
        file: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_manifest(path: &str) -> Result<Vec<u8>> {
    if path == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("reading manifest from stdin")?;
        Ok(buf)
    } else {
        std::fs::read(path).with_context(|| format!("reading manifest file {}", path))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { file } => {
            let manifest = read_manifest(&file)?;
            let client = kube::Client::try_default()
                .await
                .context("building kube client")?;
            let catalog = discover(client.clone())
                .await
                .context("snapshotting resource catalog")?;

            let options = EngineOptions {
                ns_override: cli.namespace.clone(),
                ..EngineOptions::default()
            };
            let router = KubeRouter::new(client, options.field_manager.clone());
            let outcomes = apply_manifest(&manifest, &catalog, &router, &options).await?;

            match cli.output {
                Output::Human => {
                    for outcome in &outcomes {
                        println!("{}", outcome.report());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcomes)?),
            }

            let failed = outcomes.iter().filter(|o| !o.is_success()).count();
            if failed > 0 {
                error!(failed, total = outcomes.len(), "apply finished with failures");
                std::process::exit(1);
            }
            info!(total = outcomes.len(), "apply finished");
        }
    }

    Ok(())
}
