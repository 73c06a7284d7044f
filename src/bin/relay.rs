use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use pulse::{
    Relay,
    config::{RelayConfig, read_config_file},
    relay::RelayOptions,
    util::{get_relay_id, get_server},
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Server address, overrides the config file
    #[arg(long)]
    server: Option<String>,

    /// Relay id, overrides the config file
    #[arg(long)]
    id: Option<String>,
}

fn init(level: &str) {
    let level = LevelFilter::from_str(level).unwrap_or(LevelFilter::INFO);
    let filter = filter::Targets::new()
        .with_targets(vec![("pulse", level), ("pulse_relay", level)]);
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

    let config: RelayConfig = read_config_file(&args.file)?;
    config.validate()?;
    init(&config.log_level);
    trace!("started with args: {args:?}");

    let server = args.server.unwrap_or_else(|| get_server(&config.server));
    let id = args.id.unwrap_or_else(|| get_relay_id(config.id.as_deref()));

    let options = RelayOptions::new(server, id)
        .reconnect_delay(Duration::from_secs(config.reconnect_delay));
    let relay = Relay::connect_with(options)
        .await
        .context("failed to connect to the server")?;
    info!("connected as '{}'", relay.id());

    for collector in config.collectors {
        relay
            .add_collector(
                collector.name.clone(),
                collector.tags,
                collector.source.collector(collector.smoothing),
            )
            .await
            .with_context(|| format!("failed to register collector '{}'", collector.name))?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    relay.close().await?;
    Ok(())
}
