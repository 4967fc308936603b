/// Risk validation, position sizing and exit rules
///
/// Every function in this module is a pure function of its inputs so the
/// live controller and the backtest engine share it unchanged.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::types::{AccountState, Position, Signal};

/// Limits applied to every proposed trade. Owned by the controller and
/// replaced atomically, never partially mutated mid-evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    pub max_position_value: f64,
    pub max_trade_value: f64,
    pub max_trades_per_day: u32,
    pub max_daily_loss: f64,
    pub max_portfolio_exposure: f64,
    pub max_drawdown_pct: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_stop_pct: f64,
    /// Capital at risk per trade before throttling.
    pub risk_per_trade: f64,
    pub min_confidence: f64,
    /// Minimum expected profit after fees for a trade to be worth taking.
    pub min_net_profit: f64,
    /// Shrink the risk budget after this many consecutive losing trades.
    pub loss_throttle_after: u32,
    pub loss_throttle_factor: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_position_value: 50_000.0,
            max_trade_value: 10_000.0,
            max_trades_per_day: 20,
            max_daily_loss: 2_000.0,
            max_portfolio_exposure: 100_000.0,
            max_drawdown_pct: 0.10,
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            trailing_stop_pct: 0.015,
            risk_per_trade: 500.0,
            min_confidence: 0.6,
            min_net_profit: 0.0,
            loss_throttle_after: 5,
            loss_throttle_factor: 0.75,
        }
    }
}

impl RiskParameters {
    /// Validates internal consistency before the controller swaps a new set in.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.max_position_value > 0.0) {
            return Err("max_position_value must be positive".into());
        }
        if !(self.stop_loss_pct > 0.0 && self.stop_loss_pct < 1.0) {
            return Err(format!("stop_loss_pct out of range: {}", self.stop_loss_pct));
        }
        if !(self.take_profit_pct > 0.0) {
            return Err(format!(
                "take_profit_pct must be positive: {}",
                self.take_profit_pct
            ));
        }
        if !(self.trailing_stop_pct > 0.0 && self.trailing_stop_pct < 1.0) {
            return Err(format!(
                "trailing_stop_pct out of range: {}",
                self.trailing_stop_pct
            ));
        }
        if self.max_trades_per_day == 0 {
            return Err("max_trades_per_day must be at least 1".into());
        }
        if !(self.max_daily_loss > 0.0) {
            return Err("max_daily_loss must be positive".into());
        }
        if !(self.max_portfolio_exposure > 0.0) {
            return Err("max_portfolio_exposure must be positive".into());
        }
        if !(self.max_drawdown_pct > 0.0 && self.max_drawdown_pct <= 1.0) {
            return Err(format!(
                "max_drawdown_pct out of range: {}",
                self.max_drawdown_pct
            ));
        }
        if !(self.risk_per_trade > 0.0) {
            return Err("risk_per_trade must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(format!(
                "min_confidence out of range: {}",
                self.min_confidence
            ));
        }
        if self.loss_throttle_after == 0 {
            return Err("loss_throttle_after must be at least 1".into());
        }
        if !(self.loss_throttle_factor > 0.0 && self.loss_throttle_factor <= 1.0) {
            return Err(format!(
                "loss_throttle_factor out of range: {}",
                self.loss_throttle_factor
            ));
        }
        Ok(())
    }
}

/// Injectable fee/tax schedule. The exact rates are policy data supplied by
/// configuration, not constants baked into the logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub brokerage_pct: f64,
    pub transaction_tax_pct: f64,
    pub regulatory_pct: f64,
    pub service_tax_pct: f64,
    /// Flat floor and cap applied to the brokerage component per leg.
    pub min_brokerage: f64,
    pub max_brokerage: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            brokerage_pct: 0.0003,
            transaction_tax_pct: 0.00025,
            regulatory_pct: 0.0001,
            service_tax_pct: 0.00005,
            min_brokerage: 0.0,
            max_brokerage: 20.0,
        }
    }
}

impl FeeSchedule {
    /// Total fees for one leg of the given notional value.
    pub fn leg_fees(&self, notional: f64) -> f64 {
        let brokerage = (notional * self.brokerage_pct)
            .max(self.min_brokerage)
            .min(self.max_brokerage);
        brokerage
            + notional * (self.transaction_tax_pct + self.regulatory_pct + self.service_tax_pct)
    }

    /// Fees across both legs of a round trip.
    pub fn round_trip(&self, entry_notional: f64, exit_notional: f64) -> f64 {
        self.leg_fees(entry_notional) + self.leg_fees(exit_notional)
    }

    pub fn zero() -> Self {
        Self {
            brokerage_pct: 0.0,
            transaction_tax_pct: 0.0,
            regulatory_pct: 0.0,
            service_tax_pct: 0.0,
            min_brokerage: 0.0,
            max_brokerage: 0.0,
        }
    }
}

/// Configured trading session, e.g. 09:15 to 15:30.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionWindow {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl SessionWindow {
    pub fn all_day() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            close: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        t >= self.open && t <= self.close
    }
}

impl Default for SessionWindow {
    fn default() -> Self {
        Self::all_day()
    }
}

/// Why a signal was turned away. Serialized as a stable snake_case code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    OutsideTradingHours,
    LowConfidence,
    DailyTradeLimit,
    DailyLossLimit,
    ExposureLimit,
    PositionLimit,
    PositionTooSmall,
    NotProfitable,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        match self {
            RejectReason::OutsideTradingHours => "outside_trading_hours",
            RejectReason::LowConfidence => "low_confidence",
            RejectReason::DailyTradeLimit => "daily_trade_limit",
            RejectReason::DailyLossLimit => "daily_loss_limit",
            RejectReason::ExposureLimit => "exposure_limit",
            RejectReason::PositionLimit => "position_limit",
            RejectReason::PositionTooSmall => "position_too_small",
            RejectReason::NotProfitable => "not_profitable",
        }
    }
}

/// Outcome of one risk evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub approved: bool,
    pub reason: Option<RejectReason>,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
}

impl Decision {
    fn approve(quantity: f64, stop_loss: f64, take_profit: f64) -> Self {
        Self {
            approved: true,
            reason: None,
            quantity,
            stop_loss,
            take_profit,
        }
    }

    fn reject(reason: RejectReason) -> Self {
        Self {
            approved: false,
            reason: Some(reason),
            quantity: 0.0,
            stop_loss: 0.0,
            take_profit: 0.0,
        }
    }
}

/// Risk budget per trade, shrunk after runs of consecutive losses.
pub fn throttled_risk_budget(params: &RiskParameters, consecutive_losses: u32) -> f64 {
    let steps = consecutive_losses / params.loss_throttle_after;
    params.risk_per_trade * params.loss_throttle_factor.powi(steps as i32)
}

/// Total absolute exposure across open positions at current prices.
pub fn total_exposure(positions: &[Position]) -> f64 {
    positions.iter().map(Position::market_value).sum()
}

/// Evaluates one signal against a consistent account snapshot and the
/// configured limits. Gates run in order and short-circuit on the first
/// failure; each failure carries a distinct reason code.
pub fn evaluate(
    signal: &Signal,
    account: &AccountState,
    params: &RiskParameters,
    positions: &[Position],
    fees: &FeeSchedule,
    session: &SessionWindow,
    now: chrono::DateTime<chrono::Utc>,
) -> Decision {
    if !session.contains(now.time()) {
        return Decision::reject(RejectReason::OutsideTradingHours);
    }
    if signal.confidence < params.min_confidence {
        return Decision::reject(RejectReason::LowConfidence);
    }
    if account.daily_trade_count >= params.max_trades_per_day {
        return Decision::reject(RejectReason::DailyTradeLimit);
    }
    if account.daily_pnl <= -params.max_daily_loss {
        return Decision::reject(RejectReason::DailyLossLimit);
    }

    let price = signal.suggested_price;
    if !(price > 0.0) {
        return Decision::reject(RejectReason::PositionTooSmall);
    }

    let remaining_exposure = params.max_portfolio_exposure - total_exposure(positions);
    if remaining_exposure <= 0.0 {
        return Decision::reject(RejectReason::ExposureLimit);
    }

    // Per-symbol cap: what is already held in this symbol counts against it.
    let held_value: f64 = positions
        .iter()
        .filter(|p| p.symbol == signal.symbol)
        .map(Position::market_value)
        .sum();
    let remaining_position_value = params.max_position_value - held_value;
    if remaining_position_value <= 0.0 {
        return Decision::reject(RejectReason::PositionLimit);
    }

    let quantity = position_size(
        params,
        account.consecutive_losses,
        price,
        remaining_exposure,
        remaining_position_value,
    );
    if quantity < 1.0 {
        return Decision::reject(RejectReason::PositionTooSmall);
    }

    // Net-profitability gate: expected move to target minus round-trip fees.
    let direction = match signal.side.as_side() {
        Some(side) => side.sign(),
        None => return Decision::reject(RejectReason::PositionTooSmall),
    };
    let target = price * (1.0 + direction * params.take_profit_pct);
    let expected_gross = (target - price).abs() * quantity;
    let fee_estimate = fees.round_trip(price * quantity, target * quantity);
    if expected_gross - fee_estimate <= params.min_net_profit {
        return Decision::reject(RejectReason::NotProfitable);
    }

    let stop = price * (1.0 - direction * params.stop_loss_pct);
    Decision::approve(quantity, stop, target)
}

/// Sizing formula: capped by the throttled risk budget over the stop
/// distance, the per-trade value limit, the remaining exposure headroom and
/// the per-symbol position value headroom. Quantities are floored to whole
/// units.
pub fn position_size(
    params: &RiskParameters,
    consecutive_losses: u32,
    price: f64,
    remaining_exposure: f64,
    remaining_position_value: f64,
) -> f64 {
    let budget = throttled_risk_budget(params, consecutive_losses);
    let stop_distance = price * params.stop_loss_pct;
    if stop_distance <= 0.0 {
        return 0.0;
    }
    let by_risk = budget / stop_distance;
    let by_value = params.max_trade_value / price;
    let by_exposure = remaining_exposure / price;
    let by_position = remaining_position_value / price;
    by_risk.min(by_value).min(by_exposure).min(by_position).floor()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

/// Pure exit rule shared by the live cycle and the backtest: stop-loss,
/// take-profit, then trailing stop measured from the favorable peak.
pub fn exit_signal(position: &Position, params: &RiskParameters) -> Option<ExitReason> {
    let entry = position.average_entry_price;
    let price = position.current_price;
    if entry <= 0.0 || position.quantity == 0.0 {
        return None;
    }

    if position.is_long() {
        if price <= entry * (1.0 - params.stop_loss_pct) {
            return Some(ExitReason::StopLoss);
        }
        if price >= entry * (1.0 + params.take_profit_pct) {
            return Some(ExitReason::TakeProfit);
        }
        if position.peak_price > entry
            && price <= position.peak_price * (1.0 - params.trailing_stop_pct)
        {
            return Some(ExitReason::TrailingStop);
        }
    } else {
        if price >= entry * (1.0 + params.stop_loss_pct) {
            return Some(ExitReason::StopLoss);
        }
        if price <= entry * (1.0 - params.take_profit_pct) {
            return Some(ExitReason::TakeProfit);
        }
        if position.peak_price < entry
            && price >= position.peak_price * (1.0 + params.trailing_stop_pct)
        {
            return Some(ExitReason::TrailingStop);
        }
    }
    None
}
