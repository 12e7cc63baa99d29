use std::{process::exit, time::Duration};

use clap::Parser;
use tokio::{net::TcpListener, task::spawn};
use tracing_subscriber::EnvFilter;
use validator_watch_service::{
    Error, Result,
    error::ResultExt,
    input::{
        rpc::client::{HttpNodeClient, RpcOptions},
        snapshot::SnapshotFetcher,
    },
    metrics::PrometheusMetrics,
    notify::telegram::{TelegramOptions, TelegramSender},
    persistence::sql::{Persistence, PersistenceOptions},
    scheduler::Service,
};

/// Watches validators on a chain and alerts subscribers when their state or commission changes.
#[derive(Debug, Parser)]
struct Options {
    /// Chain node options.
    #[clap(flatten)]
    rpc: RpcOptions,

    /// Storage options.
    #[clap(flatten)]
    persistence: PersistenceOptions,

    /// Message delivery options.
    #[clap(flatten)]
    telegram: TelegramOptions,

    /// How often to snapshot the validator set and record changes.
    #[clap(
        long,
        env = "VALIDATOR_WATCH_UPDATE_INTERVAL",
        default_value = "5m",
        value_parser = humantime::parse_duration,
    )]
    update_interval: Duration,

    /// How often to deliver unsent change records.
    #[clap(
        long,
        env = "VALIDATOR_WATCH_NOTIFY_INTERVAL",
        default_value = "5m",
        value_parser = humantime::parse_duration,
    )]
    notify_interval: Duration,

    /// Port on which to serve Prometheus metrics at `/metrics`.
    ///
    /// Metrics are not served if this is not set.
    #[clap(long, env = "VALIDATOR_WATCH_METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl Options {
    async fn run(self) -> Result<()> {
        let pool = Persistence::connect(&self.persistence).await?;
        let storage = Persistence::new(pool, self.persistence.subscription_limit).await?;

        let client = HttpNodeClient::new(&self.rpc)?;
        let fetcher = SnapshotFetcher::new(client, &self.rpc);
        let sender = TelegramSender::new(&self.telegram)?;

        let metrics = PrometheusMetrics::default();
        if let Some(port) = self.metrics_port {
            let listener = TcpListener::bind(("0.0.0.0", port))
                .await
                .context(|| Error::internal().context(format!("binding metrics port {port}")))?;
            spawn(metrics.clone().serve(listener));
        }

        let service = Service::new(
            fetcher,
            storage,
            sender,
            self.telegram.delivery_policy(),
            metrics,
        );
        service
            .run(self.update_interval, self.notify_interval)
            .await;
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Options::parse();
    if let Err(err) = opt.run().await {
        tracing::error!("service failed: {err:#}");
        exit(1);
    }
}
