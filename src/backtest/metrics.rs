/// Performance metrics computed from an equity curve and the closed-trade
/// ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Trade;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub at: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub average_win: f64,
    pub average_loss: f64,
    pub fees_paid: f64,
}

impl Metrics {
    pub fn compute(curve: &[EquityPoint], trades: &[Trade]) -> Self {
        let initial = curve.first().map(|p| p.equity).unwrap_or(0.0);
        let last = curve.last().map(|p| p.equity).unwrap_or(0.0);
        let total_return_pct = if initial > 0.0 {
            (last - initial) / initial * 100.0
        } else {
            0.0
        };

        let returns: Vec<f64> = curve
            .windows(2)
            .filter(|w| w[0].equity > 0.0)
            .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
            .collect();

        let annualized_return_pct = if !returns.is_empty() && initial > 0.0 {
            let periods = returns.len() as f64;
            let growth = last / initial;
            (growth.powf(TRADING_DAYS_PER_YEAR / periods) - 1.0) * 100.0
        } else {
            0.0
        };

        let sharpe_ratio = sharpe(&returns);
        let max_drawdown_pct = compute_drawdown(curve) * 100.0;

        // Round trips are the trades that realized P&L.
        let closed: Vec<&Trade> = trades.iter().filter(|t| t.realized_pnl != 0.0).collect();
        let winners: Vec<f64> = closed
            .iter()
            .filter(|t| t.realized_pnl > 0.0)
            .map(|t| t.realized_pnl)
            .collect();
        let losers: Vec<f64> = closed
            .iter()
            .filter(|t| t.realized_pnl < 0.0)
            .map(|t| t.realized_pnl)
            .collect();

        let gross_profit: f64 = winners.iter().sum();
        let gross_loss: f64 = losers.iter().map(|p| p.abs()).sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let win_rate = if closed.is_empty() {
            0.0
        } else {
            winners.len() as f64 / closed.len() as f64
        };
        let average_win = if winners.is_empty() {
            0.0
        } else {
            gross_profit / winners.len() as f64
        };
        let average_loss = if losers.is_empty() {
            0.0
        } else {
            -gross_loss / losers.len() as f64
        };

        Self {
            total_return_pct,
            annualized_return_pct,
            sharpe_ratio,
            max_drawdown_pct,
            win_rate,
            profit_factor,
            total_trades: trades.len(),
            winning_trades: winners.len(),
            losing_trades: losers.len(),
            average_win,
            average_loss,
            fees_paid: trades.iter().map(|t| t.fees).sum(),
        }
    }
}

fn sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return 0.0;
    }
    mean / std_dev * TRADING_DAYS_PER_YEAR.sqrt()
}

/// Largest peak-to-trough fall over the curve, as a fraction of the peak.
fn compute_drawdown(curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut worst: f64 = 0.0;
    for point in curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > 0.0 {
            worst = worst.max((peak - point.equity) / peak);
        }
    }
    worst
}
