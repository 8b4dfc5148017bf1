use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crisscross_controller::Registration;
use crisscross_engine::Engine;
use kube::{Client, CustomResourceExt};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "crisscross", version, about = "Runs managed resource controllers declared by Registrations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch Registrations and run one managed resource controller per Registration
    Run {
        /// Concurrent reconciles within each managed resource controller
        #[arg(long = "managed-concurrency", env = "CRISSCROSS_MANAGED_CONCURRENCY", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        managed_concurrency: u16,
        /// Seconds between observations of an up to date managed resource
        #[arg(long = "poll-interval-secs", env = "CRISSCROSS_POLL_INTERVAL_SECS", default_value_t = 60)]
        poll_interval_secs: u64,
    },
    /// Print the Registration CustomResourceDefinition as YAML
    Crd,
}

fn init_tracing() {
    let env = std::env::var("CRISSCROSS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CRISSCROSS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CRISSCROSS_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => {
            let yaml = serde_yaml::to_string(&Registration::crd()).context("rendering CRD")?;
            print!("{}", yaml);
        }
        Commands::Run { managed_concurrency, poll_interval_secs } => {
            init_tracing();
            init_metrics();
            let client = Client::try_default().await.context("building Kubernetes client")?;
            let engine = Engine::kube(client.clone());
            let config = crisscross_controller::Config {
                managed_concurrency,
                poll_interval: Duration::from_secs(poll_interval_secs),
            };
            info!(managed_concurrency, poll_interval_secs, "crisscross starting");
            crisscross_controller::run(client, engine, config).await?;
            info!("crisscross stopped");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from(["crisscross", "run", "--managed-concurrency", "4", "--poll-interval-secs", "15"]).unwrap();
        match cli.command {
            Commands::Run { managed_concurrency, poll_interval_secs } => {
                assert_eq!(managed_concurrency, 4);
                assert_eq!(poll_interval_secs, 15);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(Cli::try_parse_from(["crisscross", "run", "--managed-concurrency", "0"]).is_err());
    }

    #[test]
    fn crd_renders_as_yaml() {
        let yaml = serde_yaml::to_string(&Registration::crd()).unwrap();
        assert!(yaml.contains("registrations.crisscross.crossplane.io"));
        assert!(yaml.contains("typeRef"));
    }
}
