/// Backtest engine
///
/// Replays aligned historical bars through the same risk, sizing and exit
/// code the live controller uses. Decisions made on bar t fill at the open
/// of bar t+1 with seeded adverse slippage, so a run is reproducible from
/// its seed.

pub mod metrics;

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BacktestSettings;
use crate::error::CoreError;
use crate::portfolio::PortfolioTracker;
use crate::risk::{self, FeeSchedule, RiskParameters, SessionWindow};
use crate::signal::SignalSource;
use crate::types::{Bar, FillEvent, MarketSnapshot, Position, Quote, Side, Trade};

pub use metrics::{EquityPoint, Metrics};

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub metrics: Metrics,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    /// Set when a drawdown breach liquidated the book before the data ended.
    pub halted_early: bool,
}

struct PendingOrder {
    symbol: String,
    side: Side,
    quantity: f64,
}

pub struct BacktestEngine {
    settings: BacktestSettings,
    risk: RiskParameters,
    fees: FeeSchedule,
    session: SessionWindow,
}

impl BacktestEngine {
    pub fn new(settings: BacktestSettings, risk: RiskParameters, fees: FeeSchedule) -> Self {
        Self {
            settings,
            risk,
            fees,
            session: SessionWindow::all_day(),
        }
    }

    /// Replays the series bar by bar. All series must be index-aligned and
    /// of equal length.
    pub async fn run(
        &self,
        series: &BTreeMap<String, Vec<Bar>>,
        strategy: &dyn SignalSource,
    ) -> Result<BacktestReport, CoreError> {
        let len = validate_series(series)?;
        info!(
            symbols = series.len(),
            bars = len,
            seed = self.settings.seed,
            "Backtest starting"
        );

        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        // Timestamps come from the first series; validation guaranteed one.
        let reference = series
            .values()
            .next()
            .ok_or_else(|| CoreError::Validation("no symbols in backtest series".into()))?;
        let mut tracker =
            PortfolioTracker::new(self.settings.initial_capital, reference[0].at.date_naive());
        let mut pending: Vec<PendingOrder> = Vec::new();
        let mut curve: Vec<EquityPoint> = Vec::new();
        let mut halted = false;

        for t in 0..len {
            let at = reference[t].at;
            tracker.roll_day(at.date_naive());

            // Fill everything queued on the previous bar at this bar's open.
            for order in pending.drain(..) {
                let Some(bar) = series.get(&order.symbol).map(|bars| &bars[t]) else {
                    continue;
                };
                let slip = self.settings.slippage_pct * rng.gen_range(0.0..1.0);
                let price = bar.open * (1.0 + order.side.sign() * slip);
                let fill = FillEvent {
                    order_id: Uuid::new_v4(),
                    symbol: order.symbol.clone(),
                    side: order.side,
                    quantity: order.quantity,
                    price,
                    at: bar.at,
                };
                let fees = self.fees.leg_fees(order.quantity * price);
                tracker.apply_fill(&fill, fees);
            }

            let closes: BTreeMap<String, f64> = series
                .iter()
                .map(|(symbol, bars)| (symbol.clone(), bars[t].close))
                .collect();
            let account = tracker.mark_to_market(&closes);
            curve.push(EquityPoint {
                at,
                equity: account.equity,
            });

            if !halted && account.drawdown() >= self.risk.max_drawdown_pct {
                warn!(
                    bar = t,
                    drawdown = account.drawdown(),
                    "Drawdown breach, liquidating book"
                );
                halted = true;
                for position in sorted_positions(&tracker) {
                    queue_exit(&mut pending, &position);
                }
                continue;
            }
            if halted {
                continue;
            }

            let queued: HashSet<String> = pending.iter().map(|p| p.symbol.clone()).collect();

            // Exit rules fire before any new entry is considered.
            for position in sorted_positions(&tracker) {
                if queued.contains(&position.symbol) {
                    continue;
                }
                if let Some(reason) = risk::exit_signal(&position, &self.risk) {
                    debug!(bar = t, symbol = %position.symbol, ?reason, "Queueing exit");
                    queue_exit(&mut pending, &position);
                }
            }

            // Entries need a next bar to fill on.
            if t + 1 >= len {
                continue;
            }
            let snapshot = snapshot_at(series, t, at);
            let signals = strategy.signals(&snapshot).await?;
            for signal in signals {
                if pending.iter().any(|p| p.symbol == signal.symbol) {
                    continue;
                }
                let account = tracker.account();
                let positions = tracker.positions();
                let decision = risk::evaluate(
                    &signal,
                    &account,
                    &self.risk,
                    &positions,
                    &self.fees,
                    &self.session,
                    signal.generated_at,
                );
                if !decision.approved {
                    continue;
                }
                let Some(side) = signal.side.as_side() else {
                    continue;
                };
                pending.push(PendingOrder {
                    symbol: signal.symbol.clone(),
                    side,
                    quantity: decision.quantity,
                });
            }
        }

        let final_equity = curve.last().map(|p| p.equity).unwrap_or(0.0);
        let trades = tracker.trades().to_vec();
        let metrics = Metrics::compute(&curve, &trades);
        info!(
            final_equity,
            trades = trades.len(),
            return_pct = metrics.total_return_pct,
            "Backtest finished"
        );
        Ok(BacktestReport {
            initial_capital: self.settings.initial_capital,
            final_equity,
            metrics,
            trades,
            equity_curve: curve,
            halted_early: halted,
        })
    }
}

fn queue_exit(pending: &mut Vec<PendingOrder>, position: &Position) {
    let side = if position.is_long() {
        Side::Sell
    } else {
        Side::Buy
    };
    pending.push(PendingOrder {
        symbol: position.symbol.clone(),
        side,
        quantity: position.quantity.abs(),
    });
}

/// Positions in symbol order so replays consume the RNG identically.
fn sorted_positions(tracker: &PortfolioTracker) -> Vec<Position> {
    let mut positions = tracker.positions();
    positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    positions
}

fn snapshot_at(
    series: &BTreeMap<String, Vec<Bar>>,
    t: usize,
    at: chrono::DateTime<Utc>,
) -> MarketSnapshot {
    let quotes: BTreeMap<String, Quote> = series
        .iter()
        .map(|(symbol, bars)| {
            let last = bars[t].close;
            let prev = if t > 0 { bars[t - 1].close } else { bars[t].open };
            (symbol.clone(), Quote { last, prev })
        })
        .collect();
    MarketSnapshot { at, quotes }
}

fn validate_series(series: &BTreeMap<String, Vec<Bar>>) -> Result<usize, CoreError> {
    let mut len: Option<usize> = None;
    for (symbol, bars) in series {
        if bars.is_empty() {
            return Err(CoreError::Validation(format!("{} has no bars", symbol)));
        }
        match len {
            None => len = Some(bars.len()),
            Some(expected) if bars.len() != expected => {
                return Err(CoreError::Validation(format!(
                    "{} has {} bars, expected {}",
                    symbol,
                    bars.len(),
                    expected
                )));
            }
            Some(_) => {}
        }
    }
    len.ok_or_else(|| CoreError::Validation("no symbols in backtest series".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::MomentumStrategy;
    use chrono::{Duration, TimeZone};

    /// Builds daily bars from a close series; each open is the prior close.
    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i > 0 { closes[i - 1] } else { close };
                Bar {
                    at: start + Duration::days(i as i64),
                    open,
                    high: open.max(close),
                    low: open.min(close),
                    close,
                    volume: 10_000.0,
                }
            })
            .collect()
    }

    fn engine(seed: u64) -> BacktestEngine {
        BacktestEngine::new(
            BacktestSettings {
                initial_capital: 100_000.0,
                slippage_pct: 0.0005,
                seed,
            },
            RiskParameters::default(),
            FeeSchedule::default(),
        )
    }

    fn trending_series() -> BTreeMap<String, Vec<Bar>> {
        // Strong up-moves to trigger entries, then a fall to trigger exits.
        let closes = vec![
            100.0, 102.5, 105.1, 107.7, 110.4, 113.2, 110.0, 107.0, 104.0, 104.0,
        ];
        let mut series = BTreeMap::new();
        series.insert("ACME".to_string(), bars_from_closes(&closes));
        series
    }

    #[tokio::test]
    async fn identical_seeds_reproduce_exactly() {
        let strategy = MomentumStrategy::new(0.01);
        let a = engine(7).run(&trending_series(), &strategy).await.unwrap();
        let b = engine(7).run(&trending_series(), &strategy).await.unwrap();
        assert_eq!(a.trades.len(), b.trades.len());
        assert!((a.final_equity - b.final_equity).abs() < f64::EPSILON);
        for (x, y) in a.trades.iter().zip(&b.trades) {
            assert_eq!(x.symbol, y.symbol);
            assert!((x.price - y.price).abs() < f64::EPSILON);
            assert!((x.quantity - y.quantity).abs() < f64::EPSILON);
        }
    }

    #[tokio::test]
    async fn momentum_run_trades_and_reports() {
        let strategy = MomentumStrategy::new(0.01);
        let report = engine(7).run(&trending_series(), &strategy).await.unwrap();
        assert!(!report.trades.is_empty());
        assert_eq!(report.equity_curve.len(), 10);
        assert!((report.initial_capital - 100_000.0).abs() < f64::EPSILON);
        assert!(report.final_equity > 0.0);
    }

    #[tokio::test]
    async fn mismatched_series_lengths_rejected() {
        let mut series = trending_series();
        series.insert("BETA".to_string(), bars_from_closes(&[100.0, 101.0]));
        let strategy = MomentumStrategy::new(0.01);
        let err = engine(7).run(&series, &strategy).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn empty_series_rejected() {
        let strategy = MomentumStrategy::new(0.01);
        let err = engine(7).run(&BTreeMap::new(), &strategy).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn drawdown_breach_liquidates_and_halts() {
        // Rally, entry, then a crash far past the 10% drawdown limit.
        let closes = vec![100.0, 103.0, 106.0, 109.0, 60.0, 58.0, 57.0, 56.0];
        let mut series = BTreeMap::new();
        series.insert("ACME".to_string(), bars_from_closes(&closes));
        let strategy = MomentumStrategy::new(0.01);
        let report = engine(7).run(&series, &strategy).await.unwrap();
        assert!(report.halted_early);
        // The liquidation fill closed the book.
        let last_exit = report.trades.iter().filter(|t| t.realized_pnl != 0.0).count();
        assert!(last_exit >= 1);
    }
}
