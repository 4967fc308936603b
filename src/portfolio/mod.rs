/// Position and portfolio tracking
///
/// The tracker is the authoritative in-memory view of open positions and
/// account statistics. Equity is recomputed from cash plus market values on
/// every mark-to-market pass; nothing is incrementally drifted.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{AccountState, FillEvent, Position, Trade};

pub struct PortfolioTracker {
    cash: f64,
    positions: HashMap<String, Position>,
    trades: Vec<Trade>,
    peak_equity: f64,
    equity: f64,
    day: NaiveDate,
    day_open_equity: f64,
    daily_trade_count: u32,
    consecutive_losses: u32,
}

impl PortfolioTracker {
    pub fn new(starting_cash: f64, day: NaiveDate) -> Self {
        Self {
            cash: starting_cash,
            positions: HashMap::new(),
            trades: Vec::new(),
            peak_equity: starting_cash,
            equity: starting_cash,
            day,
            day_open_equity: starting_cash,
            daily_trade_count: 0,
            consecutive_losses: 0,
        }
    }

    /// Seeds positions reported by the broker at session start.
    pub fn seed_positions(&mut self, positions: Vec<Position>) {
        for position in positions {
            self.positions.insert(position.symbol.clone(), position);
        }
    }

    /// Applies one confirmed fill, returning the ledger record.
    ///
    /// Same-direction fills extend the weighted-average entry; reducing
    /// fills realize P&L against the average entry. A fill that flips the
    /// position through zero is split into a close and a fresh open so the
    /// realized leg never mixes entry bases.
    pub fn apply_fill(&mut self, fill: &FillEvent, fees: f64) -> Trade {
        let signed = fill.side.sign() * fill.quantity;
        let mut realized = 0.0;
        let mut reduced = false;

        match self.positions.remove(&fill.symbol) {
            None => {
                let mut position = Position::new(fill.symbol.clone(), signed, fill.price);
                position.opened_at = fill.at;
                self.positions.insert(fill.symbol.clone(), position);
            }
            Some(mut position) => {
                let same_direction = position.quantity.signum() == signed.signum();
                if same_direction {
                    let total = position.quantity.abs() + fill.quantity;
                    position.average_entry_price = (position.quantity.abs()
                        * position.average_entry_price
                        + fill.quantity * fill.price)
                        / total;
                    position.quantity += signed;
                    self.positions.insert(fill.symbol.clone(), position);
                } else {
                    let closing = fill.quantity.min(position.quantity.abs());
                    let direction = position.quantity.signum();
                    realized = (fill.price - position.average_entry_price) * closing * direction;
                    reduced = true;
                    position.quantity += signed;

                    if position.quantity.abs() < 1e-9 {
                        // Quantity zero deletes the position.
                    } else if position.quantity.signum() != direction {
                        // Flip: remainder opens a fresh position at the fill price.
                        let mut fresh =
                            Position::new(fill.symbol.clone(), position.quantity, fill.price);
                        fresh.opened_at = fill.at;
                        self.positions.insert(fill.symbol.clone(), fresh);
                    } else {
                        self.positions.insert(fill.symbol.clone(), position);
                    }
                }
            }
        }

        // Fees always come out of cash, but they only count against realized
        // P&L when the fill closed something. An opening fill realizes
        // nothing and never extends the loss streak.
        if reduced {
            realized -= fees;
            if realized < 0.0 {
                self.consecutive_losses += 1;
            } else if realized > 0.0 {
                self.consecutive_losses = 0;
            }
        }
        self.cash -= signed * fill.price + fees;
        self.daily_trade_count += 1;

        let trade = Trade {
            id: Uuid::new_v4(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            quantity: fill.quantity,
            price: fill.price,
            fees,
            realized_pnl: realized,
            timestamp: fill.at,
        };
        debug!(
            symbol = %trade.symbol,
            side = ?trade.side,
            quantity = trade.quantity,
            price = trade.price,
            realized = trade.realized_pnl,
            "Fill applied"
        );
        self.trades.push(trade.clone());
        trade
    }

    /// Recomputes unrealized P&L and equity from the latest snapshot. This
    /// pass, not incremental patching, is the source of truth.
    pub fn mark_to_market(&mut self, prices: &BTreeMap<String, f64>) -> AccountState {
        for position in self.positions.values_mut() {
            if let Some(&price) = prices.get(&position.symbol) {
                position.update_price(price);
            }
        }
        let market_value: f64 = self
            .positions
            .values()
            .map(|p| p.quantity * p.current_price)
            .sum();
        self.equity = self.cash + market_value;
        if self.equity > self.peak_equity {
            self.peak_equity = self.equity;
        }
        self.account()
    }

    /// Total absolute exposure across open positions.
    pub fn exposure(&self) -> f64 {
        self.positions.values().map(Position::market_value).sum()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn account(&self) -> AccountState {
        AccountState {
            cash_balance: self.cash,
            equity: self.equity,
            peak_equity: self.peak_equity,
            daily_pnl: self.equity - self.day_open_equity,
            daily_trade_count: self.daily_trade_count,
            consecutive_losses: self.consecutive_losses,
            day: self.day,
        }
    }

    /// Resets daily statistics when the session crosses a day boundary.
    pub fn roll_day(&mut self, date: NaiveDate) {
        if date != self.day {
            info!(from = %self.day, to = %date, "Rolling daily statistics");
            self.day = date;
            self.day_open_equity = self.equity;
            self.daily_trade_count = 0;
        }
    }

    /// Recomputes per-symbol net quantities from the trade ledger. Used by
    /// consistency checks against the incrementally tracked positions.
    pub fn quantities_from_ledger(&self) -> HashMap<String, f64> {
        let mut out: HashMap<String, f64> = HashMap::new();
        for trade in &self.trades {
            *out.entry(trade.symbol.clone()).or_insert(0.0) += trade.side.sign() * trade.quantity;
        }
        out.retain(|_, qty| qty.abs() > 1e-9);
        out
    }
}
