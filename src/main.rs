/// Binary entrypoint: wires the paper broker, a momentum strategy and the
/// trading controller together and runs until interrupted.

use std::sync::Arc;

use anyhow::Result;
use rand::{Rng, SeedableRng};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use osprey::{Config, MomentumStrategy, PaperBroker, TradingController};

fn init_tracing() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "osprey.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,osprey=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false),
        )
        .init();
    guard
}

fn load_config() -> Result<Config> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    if std::path::Path::new(&path).exists() {
        info!(path = %path, "Loading configuration");
        Config::load_from_file(&path)
    } else {
        warn!(path = %path, "No config file found, using demo defaults");
        let mut config = Config::default();
        config.symbols = vec!["ACME".into(), "BETA".into()];
        config.cycle_interval_secs = 5;
        Ok(config)
    }
}

/// Random-walk price feed for the paper broker. Stands in for a live
/// market-data connection.
fn spawn_price_feed(broker: Arc<PaperBroker>, symbols: Vec<String>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let mut prices: Vec<(String, f64)> =
            symbols.into_iter().map(|s| (s, 100.0)).collect();
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            for (symbol, price) in prices.iter_mut() {
                let step: f64 = rng.gen_range(-0.01..0.011);
                *price *= 1.0 + step;
                broker.push_price(symbol, *price);
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_tracing();
    info!("🦅 Osprey trade execution core starting");

    let config = load_config()?;

    let broker = Arc::new(PaperBroker::new(100_000.0));
    for symbol in &config.symbols {
        broker.push_price(symbol, 100.0);
    }
    spawn_price_feed(broker.clone(), config.symbols.clone(), config.cycle_interval_secs);

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    let mut controller = TradingController::new(config, broker);
    controller.add_strategy(Box::new(MomentumStrategy::new(0.005)));

    if let Err(e) = controller.start().await {
        error!(error = %e, "Failed to start trading session");
        return Err(e.into());
    }
    controller.run(shutdown_rx).await;

    let status = controller.status();
    info!(
        equity = status.account.equity,
        trades = controller.trade_history(None).len(),
        summary = %serde_json::to_string(&status).unwrap_or_default(),
        "Osprey stopped"
    );
    Ok(())
}
