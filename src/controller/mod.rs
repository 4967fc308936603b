/// Autonomous trading controller
///
/// Top-level state machine tying signal -> risk -> execution -> tracking
/// together. The controller is the sole owner of account state, open
/// positions and the session state; everything else sees read-only
/// snapshots published after each cycle.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::BrokerAdapter;
use crate::config::Config;
use crate::error::CoreError;
use crate::execution::{ExecutionConfig, OrderCoordinator};
use crate::portfolio::PortfolioTracker;
use crate::risk::{self, FeeSchedule, RiskParameters, SessionWindow};
use crate::signal::SignalSource;
use crate::types::{
    AccountInfo, ControllerState, ExecutionEvent, MarketSnapshot, OrderRequest, Position, Quote,
    Side, Signal, Trade,
};

/// Why a session left `Running` for `EmergencyStopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StopReason {
    Requested,
    ErrorThreshold,
    DailyLossBreached,
    DrawdownBreached,
}

/// Read-only view handed to external reporting/admin layers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub state: ControllerState,
    pub stop_reason: Option<StopReason>,
    pub account: crate::types::AccountState,
    pub positions: Vec<Position>,
    pub open_orders: usize,
    pub generated_at: DateTime<Utc>,
}

/// Rolling error counter. Crossing the threshold within the window forces
/// an emergency stop; any clean cycle resets it.
struct ErrorWindow {
    events: VecDeque<Instant>,
    window: Duration,
    threshold: usize,
}

impl ErrorWindow {
    fn new(window: Duration, threshold: usize) -> Self {
        Self {
            events: VecDeque::new(),
            window,
            threshold,
        }
    }

    /// Records one error, returning true when the threshold is crossed.
    fn record(&mut self) -> bool {
        let now = Instant::now();
        self.events.push_back(now);
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() >= self.threshold
    }

    fn clear(&mut self) {
        self.events.clear();
    }
}

pub struct TradingController {
    config: Config,
    state: ControllerState,
    stop_reason: Option<StopReason>,
    broker: Arc<dyn BrokerAdapter>,
    coordinator: OrderCoordinator,
    tracker: PortfolioTracker,
    risk: RiskParameters,
    fees: FeeSchedule,
    session: SessionWindow,
    strategies: Vec<Box<dyn SignalSource>>,
    fills: broadcast::Receiver<ExecutionEvent>,
    errors: ErrorWindow,
    /// Symbols with a closing order in flight, keyed to that order.
    pending_exits: HashMap<String, Uuid>,
    status_tx: watch::Sender<StatusSnapshot>,
    call_timeout: Duration,
}

impl TradingController {
    pub fn new(config: Config, broker: Arc<dyn BrokerAdapter>) -> Self {
        let coordinator =
            OrderCoordinator::new(broker.clone(), ExecutionConfig::from(&config.execution));
        let fills = coordinator.subscribe();
        let tracker = PortfolioTracker::new(0.0, Utc::now().date_naive());
        let errors = ErrorWindow::new(
            Duration::from_secs(config.error_window_secs),
            config.max_consecutive_errors,
        );
        let initial = StatusSnapshot {
            state: ControllerState::Idle,
            stop_reason: None,
            account: tracker.account(),
            positions: Vec::new(),
            open_orders: 0,
            generated_at: Utc::now(),
        };
        let (status_tx, _) = watch::channel(initial);
        let call_timeout = Duration::from_secs(config.execution.broker_call_timeout_secs);
        Self {
            risk: config.risk.clone(),
            fees: config.fees.clone(),
            session: config.session,
            config,
            state: ControllerState::Idle,
            stop_reason: None,
            broker,
            coordinator,
            tracker,
            strategies: Vec::new(),
            fills,
            errors,
            pending_exits: HashMap::new(),
            status_tx,
            call_timeout,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn add_strategy(&mut self, strategy: Box<dyn SignalSource>) {
        info!(strategy = strategy.name(), "Strategy registered");
        self.strategies.push(strategy);
    }

    /// Validates the new parameter set, then swaps it atomically. A running
    /// evaluation never observes a half-updated set.
    pub fn update_risk_parameters(&mut self, params: RiskParameters) -> Result<(), CoreError> {
        params.validate().map_err(CoreError::Validation)?;
        info!("Risk parameters updated");
        self.risk = params;
        Ok(())
    }

    /// Current read-only snapshot; also published on the watch channel.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            stop_reason: self.stop_reason,
            account: self.tracker.account(),
            positions: self.tracker.positions(),
            open_orders: self.coordinator.open_order_ids().len(),
            generated_at: Utc::now(),
        }
    }

    pub fn watch_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn trade_history(
        &self,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Vec<Trade> {
        match range {
            None => self.tracker.trades().to_vec(),
            Some((from, to)) => self
                .tracker
                .trades()
                .iter()
                .filter(|t| t.timestamp >= from && t.timestamp <= to)
                .cloned()
                .collect(),
        }
    }

    /// Idle -> Starting -> Running. Falls back to Idle when the broker
    /// connection fails.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<(), CoreError> {
        if self.state != ControllerState::Idle {
            return Err(CoreError::Validation(format!(
                "cannot start from {:?}",
                self.state
            )));
        }
        self.set_state(ControllerState::Starting);
        info!("🚀 Starting trading session");

        let connect = timeout(self.call_timeout, self.broker.connect())
            .await
            .map_err(|_| CoreError::Timeout { call: "connect" })
            .and_then(|r| r);
        if let Err(e) = connect {
            error!(error = %e, "Broker connection failed, returning to Idle");
            self.set_state(ControllerState::Idle);
            return Err(e);
        }

        let (info, positions) = match self.load_session_state().await {
            Ok(loaded) => loaded,
            Err(e) => {
                // Same fallback as a failed connect: do not leave the
                // session wedged in Starting with a live connection.
                error!(error = %e, "Account load failed, returning to Idle");
                let _ = timeout(self.call_timeout, self.broker.disconnect()).await;
                self.set_state(ControllerState::Idle);
                return Err(e);
            }
        };

        self.tracker = PortfolioTracker::new(info.balance, Utc::now().date_naive());
        self.tracker.seed_positions(positions);

        self.set_state(ControllerState::Running);
        info!(
            balance = info.balance,
            symbols = self.config.symbols.len(),
            "Session running"
        );
        Ok(())
    }

    async fn load_session_state(&self) -> Result<(AccountInfo, Vec<Position>), CoreError> {
        let info = timeout(self.call_timeout, self.broker.account_info())
            .await
            .map_err(|_| CoreError::Timeout {
                call: "account_info",
            })
            .and_then(|r| r)?;
        let positions = timeout(self.call_timeout, self.broker.positions())
            .await
            .map_err(|_| CoreError::Timeout { call: "positions" })
            .and_then(|r| r)?;
        Ok((info, positions))
    }

    /// Drives the session until it reaches `Stopped`. Cycle errors are
    /// counted against the rolling window; a shutdown signal triggers a
    /// graceful stop.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.config.cycle_interval_secs));
        loop {
            match self.state {
                ControllerState::Running => {}
                ControllerState::EmergencyStopped => {
                    self.finalize().await;
                    break;
                }
                ControllerState::Stopped => break,
                _ => break,
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        self.record_cycle_error(e).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("🛑 Shutdown signal received");
                    self.stop(true).await;
                }
            }
        }
        info!(state = ?self.state, "Control loop exited");
    }

    /// One cycle while `Running`: snapshot, apply fills, mark to market,
    /// breach checks, exit rules, then new signals through the risk gate.
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) -> Result<(), CoreError> {
        if self.state != ControllerState::Running {
            return Ok(());
        }

        let snapshot = self.market_snapshot().await?;
        let prices = snapshot.prices();

        self.drain_fills();
        self.tracker.roll_day(snapshot.at.date_naive());
        let account = self.tracker.mark_to_market(&prices);

        if account.daily_pnl <= -self.risk.max_daily_loss {
            warn!(daily_pnl = account.daily_pnl, "Daily loss limit breached");
            self.emergency_stop(StopReason::DailyLossBreached).await;
            return Ok(());
        }
        if account.drawdown() >= self.risk.max_drawdown_pct {
            warn!(drawdown = account.drawdown(), "Max drawdown breached");
            self.emergency_stop(StopReason::DrawdownBreached).await;
            return Ok(());
        }

        // Exit conditions come before any new entry is considered.
        if self.evaluate_exits().await {
            self.emergency_stop(StopReason::ErrorThreshold).await;
            return Ok(());
        }
        self.drain_fills();

        let mut signals: Vec<Signal> = Vec::new();
        for strategy in &self.strategies {
            match strategy.signals(&snapshot).await {
                Ok(batch) => signals.extend(batch),
                Err(e) => {
                    // Malformed signal batches are contained, not fatal.
                    warn!(strategy = strategy.name(), error = %e, "Signal source failed");
                }
            }
        }

        for signal in signals {
            if self.process_signal(&signal).await {
                self.emergency_stop(StopReason::ErrorThreshold).await;
                return Ok(());
            }
        }

        self.drain_fills();
        self.tracker.mark_to_market(&prices);
        self.errors.clear();
        self.publish_status();
        Ok(())
    }

    /// Evaluates and, if approved, submits one entry. Returns true when a
    /// submission failure crossed the error threshold.
    async fn process_signal(&mut self, signal: &Signal) -> bool {
        // Fresh snapshot per evaluation: earlier fills in this cycle count.
        let account = self.tracker.account();
        let positions = self.tracker.positions();
        let decision = risk::evaluate(
            signal,
            &account,
            &self.risk,
            &positions,
            &self.fees,
            &self.session,
            Utc::now(),
        );
        if !decision.approved {
            let reason = decision.reason.map(|r| r.code()).unwrap_or("unknown");
            debug!(symbol = %signal.symbol, reason, "Signal rejected");
            return false;
        }
        let Some(side) = signal.side.as_side() else {
            return false;
        };
        info!(
            symbol = %signal.symbol,
            side = ?side,
            quantity = decision.quantity,
            stop = decision.stop_loss,
            target = decision.take_profit,
            "⚡ Submitting entry order"
        );
        match self
            .coordinator
            .submit(OrderRequest::market(
                signal.symbol.clone(),
                side,
                decision.quantity,
            ))
            .await
        {
            Ok(_) => {
                self.drain_fills();
                false
            }
            Err(e) => {
                warn!(symbol = %signal.symbol, error = %e, "Entry submission failed");
                self.errors.record()
            }
        }
    }

    /// Generates a closing order for every open position whose exit rule
    /// fired. One closing order per symbol at a time. Returns true when
    /// failures crossed the error threshold.
    async fn evaluate_exits(&mut self) -> bool {
        let mut breached = false;
        for position in self.tracker.positions() {
            if self.pending_exits.contains_key(&position.symbol) {
                continue;
            }
            let Some(reason) = risk::exit_signal(&position, &self.risk) else {
                continue;
            };
            info!(
                symbol = %position.symbol,
                ?reason,
                pnl_pct = position.pnl_pct(),
                "Exit rule fired, closing position"
            );
            breached |= self.close_position(&position).await;
        }
        breached
    }

    /// Submits a closing market order. Returns true when a failure crossed
    /// the error threshold; escalation is the caller's job.
    async fn close_position(&mut self, position: &Position) -> bool {
        let side = if position.is_long() {
            Side::Sell
        } else {
            Side::Buy
        };
        let request = OrderRequest::market(position.symbol.clone(), side, position.quantity.abs());
        match self.coordinator.submit(request).await {
            Ok(id) => {
                self.pending_exits.insert(position.symbol.clone(), id);
                false
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "Closing order failed");
                self.errors.record()
            }
        }
    }

    /// Applies every buffered execution event. Fills for one symbol arrive
    /// in coordinator order; cross-symbol ordering is not assumed anywhere.
    fn drain_fills(&mut self) {
        loop {
            match self.fills.try_recv() {
                Ok(ExecutionEvent::Fill(fill)) => {
                    let fees = self.fees.leg_fees(fill.quantity * fill.price);
                    self.tracker.apply_fill(&fill, fees);
                }
                Ok(ExecutionEvent::StateChange { order_id, state }) => {
                    if state.is_terminal() {
                        self.pending_exits.retain(|_, id| *id != order_id);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    // Ledger consistency survives a lag because equity is
                    // recomputed, but log it loudly.
                    error!(missed = n, "Execution event stream lagged");
                }
                Err(_) => break,
            }
        }
    }

    /// Graceful stop waits (bounded) for exits to close positions
    /// naturally, then forces closure. Non-graceful goes straight to the
    /// emergency path.
    #[instrument(skip(self))]
    pub async fn stop(&mut self, graceful: bool) {
        match self.state {
            ControllerState::Running | ControllerState::Starting => {}
            _ => return,
        }
        if !graceful {
            self.emergency_stop(StopReason::Requested).await;
            self.finalize().await;
            return;
        }

        self.set_state(ControllerState::Stopping);
        info!("Stopping session, draining positions");
        let deadline = Instant::now() + Duration::from_secs(self.config.stop_drain_timeout_secs);
        let pause = Duration::from_secs(self.config.cycle_interval_secs.min(2));

        while Instant::now() < deadline && !self.tracker.positions().is_empty() {
            if let Ok(snapshot) = self.market_snapshot().await {
                let prices = snapshot.prices();
                self.drain_fills();
                self.tracker.mark_to_market(&prices);
                let _ = self.evaluate_exits().await;
                self.drain_fills();
            }
            if self.tracker.positions().is_empty() {
                break;
            }
            sleep(pause).await;
        }

        // Whatever survived the drain window is closed by force.
        for position in self.tracker.positions() {
            let _ = self.close_position(&position).await;
        }
        self.coordinator.cancel_all().await;
        self.drain_fills();
        self.finalize().await;
    }

    /// Closes everything immediately: cancel all working orders, fire a
    /// closing order per open position, do not wait for natural exits.
    #[instrument(skip(self))]
    pub async fn emergency_stop(&mut self, reason: StopReason) {
        if self.state == ControllerState::EmergencyStopped
            || self.state == ControllerState::Stopped
        {
            return;
        }
        error!(?reason, "🚨 EMERGENCY STOP");
        self.stop_reason = Some(reason);
        self.set_state(ControllerState::EmergencyStopped);

        self.coordinator.cancel_all().await;
        for position in self.tracker.positions() {
            let _ = self.close_position(&position).await;
        }
        self.drain_fills();
        self.publish_status();
    }

    /// Cleanup shared by both stop paths: disconnect and park in `Stopped`.
    /// `Stopped` is terminal for the session; a new session starts from a
    /// fresh controller.
    async fn finalize(&mut self) {
        if let Err(e) = timeout(self.call_timeout, self.broker.disconnect())
            .await
            .map_err(|_| CoreError::Timeout { call: "disconnect" })
            .and_then(|r| r)
        {
            warn!(error = %e, "Broker disconnect failed");
        }
        self.set_state(ControllerState::Stopped);
        info!("Session stopped");
    }

    async fn record_cycle_error(&mut self, e: CoreError) {
        if e.is_fatal() {
            error!(error = %e, "Fatal cycle error");
            self.emergency_stop(StopReason::ErrorThreshold).await;
            return;
        }
        warn!(error = %e, "Cycle error");
        if self.errors.record() {
            self.emergency_stop(StopReason::ErrorThreshold).await;
        }
    }

    /// Builds the cycle's market view from the latest two bars per symbol.
    async fn market_snapshot(&self) -> Result<MarketSnapshot, CoreError> {
        let mut quotes = std::collections::BTreeMap::new();
        for symbol in &self.config.symbols {
            let bars = timeout(self.call_timeout, self.broker.market_data(symbol, 2))
                .await
                .map_err(|_| CoreError::Timeout {
                    call: "market_data",
                })??;
            let Some(last) = bars.last() else {
                continue;
            };
            let prev = if bars.len() >= 2 {
                bars[bars.len() - 2].close
            } else {
                last.open
            };
            quotes.insert(
                symbol.clone(),
                Quote {
                    last: last.close,
                    prev,
                },
            );
        }
        if quotes.is_empty() {
            return Err(CoreError::Validation(
                "no market data for any configured symbol".into(),
            ));
        }
        Ok(MarketSnapshot {
            at: Utc::now(),
            quotes,
        })
    }

    fn set_state(&mut self, state: ControllerState) {
        debug!(from = ?self.state, to = ?state, "Controller state transition");
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send(self.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerAdapter;

    #[test]
    fn error_window_thresholds() {
        let mut window = ErrorWindow::new(Duration::from_secs(3600), 3);
        assert!(!window.record());
        assert!(!window.record());
        assert!(window.record());
        window.clear();
        assert!(!window.record());
    }

    #[tokio::test]
    async fn failed_account_load_falls_back_to_idle() {
        let mut mock = MockBrokerAdapter::new();
        mock.expect_connect().returning(|| Ok(()));
        mock.expect_account_info()
            .returning(|| Err(CoreError::transport("account query failed", 1)));
        // The half-open connection must be torn down on the way back,
        // once per failed attempt.
        mock.expect_disconnect().times(2).returning(|| Ok(()));

        let mut config = Config::default();
        config.symbols = vec!["ACME".into()];
        let mut controller = TradingController::new(config, Arc::new(mock));

        assert!(controller.start().await.is_err());
        assert_eq!(controller.state(), ControllerState::Idle);

        // Idle means a retry is possible; it must reach Starting again.
        let result = controller.start().await;
        assert!(result.is_err());
        assert_eq!(controller.state(), ControllerState::Idle);
    }
}
