/// Core domain records shared across the trading core

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn flip(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1.0 for buys, -1.0 for sells.
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// Direction suggested by a signal source. `None` means "no action".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSide {
    Buy,
    Sell,
    None,
}

impl SignalSide {
    pub fn as_side(self) -> Option<Side> {
        match self {
            SignalSide::Buy => Some(Side::Buy),
            SignalSide::Sell => Some(Side::Sell),
            SignalSide::None => None,
        }
    }
}

/// A directional trade suggestion from a prediction source. Immutable once
/// created and consumed by exactly one controller cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: SignalSide,
    /// Confidence score in [0, 1].
    pub confidence: f64,
    pub suggested_price: f64,
    pub size_hint: Option<f64>,
    pub source: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    ImmediateOrCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        )
    }
}

/// Caller-facing order intent, before the coordinator stamps identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Limit,
            price: Some(price),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.symbol.is_empty() {
            return Err(CoreError::Validation("order symbol is empty".into()));
        }
        if !(self.quantity > 0.0) {
            return Err(CoreError::Validation(format!(
                "order quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.order_type != OrderType::Market && self.price.is_none() {
            return Err(CoreError::Validation(
                "limit/IOC order requires a price".into(),
            ));
        }
        Ok(())
    }
}

/// A single order lifecycle. Never reused; terminal states are final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    /// Client-generated idempotency key, stable across submission retries.
    pub client_key: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub requested_price: Option<f64>,
    pub order_type: OrderType,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub filled_quantity: f64,
    pub average_fill_price: f64,
    pub broker_order_id: Option<String>,
}

impl Order {
    pub fn new(request: &OrderRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_key: Uuid::new_v4(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            requested_price: request.price,
            order_type: request.order_type,
            state: OrderState::Pending,
            created_at: Utc::now(),
            filled_quantity: 0.0,
            average_fill_price: 0.0,
            broker_order_id: None,
        }
    }

    /// Moves the order to `next`, rejecting any transition out of a terminal
    /// state or backwards through the lifecycle.
    pub fn transition(&mut self, next: OrderState) -> Result<(), CoreError> {
        let legal = match self.state {
            OrderState::Pending => matches!(next, OrderState::Submitted | OrderState::Rejected),
            OrderState::Submitted => matches!(
                next,
                OrderState::PartiallyFilled
                    | OrderState::Filled
                    | OrderState::Cancelled
                    | OrderState::Rejected
                    | OrderState::Expired
            ),
            OrderState::PartiallyFilled => matches!(
                next,
                OrderState::PartiallyFilled
                    | OrderState::Filled
                    | OrderState::Cancelled
                    | OrderState::Expired
            ),
            s if s.is_terminal() => false,
            _ => false,
        };
        if !legal {
            return Err(CoreError::Fatal(format!(
                "illegal order transition {:?} -> {:?} for {}",
                self.state, next, self.id
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Confirmation that some quantity of an order executed at a price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub at: DateTime<Utc>,
}

/// Event published by the execution coordinator on every atomic transition.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Fill(FillEvent),
    StateChange { order_id: Uuid, state: OrderState },
}

/// One open position per symbol. Quantity is signed; zero deletes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub average_entry_price: f64,
    pub current_price: f64,
    /// Most favorable price seen since entry; drives trailing stops.
    pub peak_price: f64,
    pub unrealized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn new(symbol: impl Into<String>, quantity: f64, entry_price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            average_entry_price: entry_price,
            current_price: entry_price,
            peak_price: entry_price,
            unrealized_pnl: 0.0,
            opened_at: Utc::now(),
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }

    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        let better = if self.is_long() {
            price > self.peak_price
        } else {
            price < self.peak_price
        };
        if better {
            self.peak_price = price;
        }
        self.unrealized_pnl = (price - self.average_entry_price) * self.quantity;
    }

    /// Absolute market value at the current price.
    pub fn market_value(&self) -> f64 {
        self.quantity.abs() * self.current_price
    }

    pub fn pnl_pct(&self) -> f64 {
        if self.average_entry_price > 0.0 {
            let raw = (self.current_price - self.average_entry_price) / self.average_entry_price;
            if self.is_long() {
                raw
            } else {
                -raw
            }
        } else {
            0.0
        }
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        now.signed_duration_since(self.opened_at).num_seconds() as f64 / 3600.0
    }
}

/// Append-only fill/round-trip record for the audit ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub fees: f64,
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

/// Consistent account snapshot; every risk decision reads a fresh clone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub cash_balance: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub daily_pnl: f64,
    pub daily_trade_count: u32,
    pub consecutive_losses: u32,
    pub day: chrono::NaiveDate,
}

impl AccountState {
    pub fn new(cash: f64, day: chrono::NaiveDate) -> Self {
        Self {
            cash_balance: cash,
            equity: cash,
            peak_equity: cash,
            daily_pnl: 0.0,
            daily_trade_count: 0,
            consecutive_losses: 0,
            day,
        }
    }

    /// Percentage decline of equity from its historical peak.
    pub fn drawdown(&self) -> f64 {
        if self.peak_equity > 0.0 {
            (self.peak_equity - self.equity) / self.peak_equity
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub at: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Latest and previous price for one symbol within a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub last: f64,
    pub prev: f64,
}

/// Point-in-time market view consumed by one controller cycle.
///
/// Quotes are kept in a BTreeMap so iteration order is stable; backtests
/// depend on that for determinism.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub at: DateTime<Utc>,
    pub quotes: BTreeMap<String, Quote>,
}

impl MarketSnapshot {
    pub fn prices(&self) -> BTreeMap<String, f64> {
        self.quotes
            .iter()
            .map(|(s, q)| (s.clone(), q.last))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub price: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub margin: f64,
}

/// Top-level state of a trading session. Exactly one per session;
/// transitions are serialized by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    EmergencyStopped,
}
