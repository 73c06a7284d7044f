use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use pulse::{
    Plexer,
    config::{ServerConfig, read_config_file},
    server::{Server, ServerOptions},
    sinks::{BroadcastObserver, MemoryStore},
    util::get_listen,
};
use tokio::sync::oneshot;
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Listen address, overrides the config file
    #[arg(long)]
    listen: Option<String>,
}

fn init(level: &str) {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::INFO);
    let filter = filter::Targets::new()
        .with_targets(vec![("pulse", level), ("pulse_server", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let config: ServerConfig = read_config_file(&args.file)?;
    init(&config.log_level);
    trace!("started with args: {args:?}");

    let plexer = Arc::new(plexer(&config)?);

    let listen = args.listen.unwrap_or_else(|| get_listen(&config.listen));
    let options =
        ServerOptions::new(listen).heartbeat(Duration::from_secs(config.heartbeat));
    let server = Server::listen_with(options, plexer)
        .await
        .context("failed to start server")?;

    let (done_tx, done_rx) = oneshot::channel();
    let scheduler = server.start_polling(
        config.poll.ids.clone(),
        config.poll.names.clone(),
        Duration::from_secs(config.poll.interval.max(1)),
        done_rx,
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    let _ = done_tx.send(());
    server.close();
    let _ = scheduler.await;

    Ok(())
}

/// Storage, a log of every sample and the configured webhooks.
fn plexer(config: &ServerConfig) -> anyhow::Result<Plexer> {
    let plexer = Plexer::new();
    plexer.add_batcher("memory", Arc::new(MemoryStore::new(config.store_capacity)));

    let live = Arc::new(BroadcastObserver::new(256));
    let mut samples = live.subscribe();
    tokio::spawn(async move {
        loop {
            match samples.recv().await {
                Ok(sample) => trace!("{:?} = {}", sample.tags, sample.data),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("sample log lagged, skipped {skipped}")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    plexer.add_observer("log", live);

    add_webhooks(&plexer, config)?;
    Ok(plexer)
}

#[cfg(feature = "webhook")]
fn add_webhooks(plexer: &Plexer, config: &ServerConfig) -> anyhow::Result<()> {
    for webhook in &config.observers {
        let observer = pulse::sinks::WebhookObserver::new(&webhook.url)?;
        info!("forwarding samples to '{}' at {}", webhook.name, observer.url());
        plexer.add_observer(webhook.name.clone(), Arc::new(observer));
    }
    Ok(())
}

#[cfg(not(feature = "webhook"))]
fn add_webhooks(_plexer: &Plexer, config: &ServerConfig) -> anyhow::Result<()> {
    if !config.observers.is_empty() {
        warn!("webhook observers configured but the webhook feature is disabled");
    }
    Ok(())
}
