//! Carbridge sync CLI

use carbridge_core::BridgeConfig;
use carbridge_sync::Bridge;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "carbridge-sync")]
#[command(about = "Keeps the car search index in sync with MongoDB")]
#[command(version)]
struct Args {
    /// Optional configuration file (toml, yaml or json)
    #[arg(long, short, env = "CARBRIDGE_CONFIG")]
    config: Option<String>,

    #[arg(long, env = "AMQP_URL")]
    amqp_url: Option<String>,

    #[arg(long, env = "MONGO_DB")]
    mongo_host: Option<String>,

    #[arg(long, env = "ELASTIC_URL")]
    elastic_url: Option<String>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut BridgeConfig) {
        if let Some(url) = self.amqp_url {
            config.queue.url = url;
        }
        if let Some(host) = self.mongo_host {
            config.store.host = Some(host);
        }
        if let Some(url) = self.elastic_url {
            config.index.url = Some(url);
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
    }
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        "pretty" => tracing_subscriber::registry()
            .with(fmt::layer().pretty())
            .with(filter)
            .init(),
        _ => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}

fn init_metrics(endpoint: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = endpoint.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    init_tracing(&config.observability.log_level, &config.observability.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting carbridge-sync");

    if config.observability.metrics.enabled {
        if let Err(e) = init_metrics(&config.observability.metrics.endpoint) {
            warn!(error = %e, "Metrics exporter disabled");
        }
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "Missing connection settings, set MONGO_DB and ELASTIC_URL");
        return Err(e.into());
    }

    let bridge = Bridge::build(config).await?;

    if let Err(e) = bridge.run().await {
        error!(error = %e, "Bridge failed");
        return Err(e.into());
    }

    info!("Bridge stopped gracefully");
    Ok(())
}
