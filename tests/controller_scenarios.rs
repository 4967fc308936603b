/// End-to-end controller scenarios against the paper broker.

use std::sync::Arc;

use osprey::types::ControllerState;
use osprey::{Config, MomentumStrategy, PaperBroker, StopReason, TradingController};

fn test_config(symbols: &[&str]) -> Config {
    let mut config = Config::default();
    config.symbols = symbols.iter().map(|s| s.to_string()).collect();
    config.cycle_interval_secs = 1;
    config.stop_drain_timeout_secs = 0;
    config.execution.retry_base_delay_ms = 1;
    config.execution.poll_interval_ms = 5;
    config.execution.order_timeout_secs = 1;
    config.execution.broker_call_timeout_secs = 2;
    config
}

async fn started(config: Config, broker: Arc<PaperBroker>, threshold: f64) -> TradingController {
    let mut controller = TradingController::new(config, broker);
    controller.add_strategy(Box::new(MomentumStrategy::new(threshold)));
    controller.start().await.unwrap();
    controller
}

#[tokio::test]
async fn daily_trade_limit_caps_entries_within_one_cycle() {
    let mut config = test_config(&["ACME", "BETA", "CORE"]);
    config.risk.max_trades_per_day = 2;

    let broker = Arc::new(PaperBroker::new(100_000.0));
    for symbol in &config.symbols {
        broker.push_price(symbol, 100.0);
    }
    let mut controller = started(config, broker.clone(), 0.01).await;

    // Strong up-moves on all three symbols; only two entries may land.
    for symbol in ["ACME", "BETA", "CORE"] {
        broker.push_price(symbol, 105.0);
    }
    controller.run_cycle().await.unwrap();

    let status = controller.status();
    assert_eq!(status.positions.len(), 2);
    assert_eq!(status.account.daily_trade_count, 2);
    assert_eq!(status.state, ControllerState::Running);
}

#[tokio::test]
async fn stop_loss_exit_fires_before_new_entries() {
    let config = test_config(&["ACME"]);
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.push_price("ACME", 100.0);

    // High threshold so the later small drop emits no fresh signal.
    let mut controller = started(config, broker.clone(), 0.05).await;

    broker.push_price("ACME", 107.0);
    controller.run_cycle().await.unwrap();
    let entry = controller.status();
    assert_eq!(entry.positions.len(), 1);
    let entry_price = entry.positions[0].average_entry_price;
    assert!((entry_price - 107.0).abs() < 1e-9);

    // Just under the 2% stop at 104.86.
    broker.push_price("ACME", 104.8);
    controller.run_cycle().await.unwrap();

    let status = controller.status();
    assert!(status.positions.is_empty(), "stop-loss should have closed the position");
    assert_eq!(status.state, ControllerState::Running);

    let trades = controller.trade_history(None);
    assert_eq!(trades.len(), 2);
    assert!(trades[1].realized_pnl < 0.0);
}

#[tokio::test]
async fn risk_parameters_swap_atomically() {
    let config = test_config(&["ACME", "BETA"]);
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.push_price("ACME", 100.0);
    broker.push_price("BETA", 100.0);
    let mut controller = started(config, broker.clone(), 0.01).await;

    // Invalid set is rejected outright and changes nothing.
    let mut bad = osprey::RiskParameters::default();
    bad.stop_loss_pct = 0.0;
    assert!(controller.update_risk_parameters(bad).is_err());

    let mut tight = osprey::RiskParameters::default();
    tight.max_trades_per_day = 1;
    controller.update_risk_parameters(tight).unwrap();

    broker.push_price("ACME", 105.0);
    broker.push_price("BETA", 105.0);
    controller.run_cycle().await.unwrap();

    assert_eq!(controller.status().positions.len(), 1);
}

#[tokio::test]
async fn drawdown_breach_triggers_emergency_stop_and_flattens() {
    let mut config = test_config(&["ACME"]);
    // A tiny drawdown limit so a modest drop breaches it.
    config.risk.max_drawdown_pct = 0.002;

    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.push_price("ACME", 100.0);
    let mut controller = started(config, broker.clone(), 0.01).await;

    broker.push_price("ACME", 105.0);
    controller.run_cycle().await.unwrap();
    assert_eq!(controller.status().positions.len(), 1);

    broker.push_price("ACME", 101.0);
    controller.run_cycle().await.unwrap();

    let status = controller.status();
    assert_eq!(status.state, ControllerState::EmergencyStopped);
    assert_eq!(controller.stop_reason(), Some(StopReason::DrawdownBreached));
    // Closing orders landed within the same cycle.
    assert!(status.positions.is_empty());

    // Cycles after an emergency stop are no-ops.
    controller.run_cycle().await.unwrap();
    assert_eq!(controller.state(), ControllerState::EmergencyStopped);
}

#[tokio::test]
async fn daily_loss_breach_reported_with_its_own_reason() {
    let mut config = test_config(&["ACME"]);
    config.risk.max_daily_loss = 100.0;

    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.push_price("ACME", 100.0);
    let mut controller = started(config, broker.clone(), 0.01).await;

    broker.push_price("ACME", 105.0);
    controller.run_cycle().await.unwrap();

    broker.push_price("ACME", 101.0);
    controller.run_cycle().await.unwrap();

    assert_eq!(controller.state(), ControllerState::EmergencyStopped);
    assert_eq!(controller.stop_reason(), Some(StopReason::DailyLossBreached));
}

#[tokio::test]
async fn graceful_stop_flattens_and_lands_in_stopped() {
    let config = test_config(&["ACME"]);
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.push_price("ACME", 100.0);
    let mut controller = started(config, broker.clone(), 0.01).await;

    broker.push_price("ACME", 105.0);
    controller.run_cycle().await.unwrap();
    assert_eq!(controller.status().positions.len(), 1);

    controller.stop(true).await;

    let status = controller.status();
    assert_eq!(status.state, ControllerState::Stopped);
    assert!(status.positions.is_empty());
    assert_eq!(status.open_orders, 0);
}

#[tokio::test]
async fn start_requires_idle() {
    let config = test_config(&["ACME"]);
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.push_price("ACME", 100.0);
    let mut controller = started(config, broker, 0.01).await;

    assert!(controller.start().await.is_err());
    assert_eq!(controller.state(), ControllerState::Running);
}

#[tokio::test]
async fn transport_failures_during_entry_are_contained() {
    let config = test_config(&["ACME"]);
    let broker = Arc::new(PaperBroker::new(100_000.0));
    broker.push_price("ACME", 100.0);
    let mut controller = started(config, broker.clone(), 0.01).await;

    // Fewer failures than the retry budget: the entry still lands.
    broker.fail_next_placements(2);
    broker.push_price("ACME", 105.0);
    controller.run_cycle().await.unwrap();

    let status = controller.status();
    assert_eq!(status.positions.len(), 1);
    assert_eq!(status.state, ControllerState::Running);
    assert_eq!(broker.order_count(), 1);
}
