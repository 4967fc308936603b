/// In-memory paper broker
///
/// Fills market orders at the latest pushed price and working limit orders
/// when price crosses. Tests use the failure-injection knobs to exercise
/// the coordinator's retry and reconciliation paths.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{AccountInfo, Bar, MarketTick, OrderState, OrderType, Position, Side};

use super::{BrokerAdapter, BrokerOrderRequest, BrokerOrderStatus};

#[derive(Debug, Clone)]
struct PaperOrder {
    broker_order_id: String,
    symbol: String,
    side: Side,
    quantity: f64,
    order_type: OrderType,
    limit_price: Option<f64>,
    state: OrderState,
    filled_quantity: f64,
    average_fill_price: f64,
}

impl PaperOrder {
    fn status(&self) -> BrokerOrderStatus {
        BrokerOrderStatus {
            broker_order_id: self.broker_order_id.clone(),
            state: self.state,
            filled_quantity: self.filled_quantity,
            average_fill_price: self.average_fill_price,
        }
    }
}

pub struct PaperBroker {
    connected: AtomicBool,
    balance: Mutex<f64>,
    bars: DashMap<String, Vec<Bar>>,
    orders: DashMap<String, PaperOrder>,
    by_client_key: DashMap<Uuid, String>,
    net_quantities: DashMap<String, (f64, f64)>, // (signed qty, avg entry)
    next_id: AtomicU64,
    /// Next N place_order calls fail before the order reaches the book.
    reject_placements: AtomicU32,
    /// Next N place_order calls register the order but lose the ack.
    drop_acks: AtomicU32,
    tick_tx: broadcast::Sender<MarketTick>,
}

impl PaperBroker {
    pub fn new(starting_balance: f64) -> Self {
        let (tick_tx, _) = broadcast::channel(4096);
        Self {
            connected: AtomicBool::new(false),
            balance: Mutex::new(starting_balance),
            bars: DashMap::new(),
            orders: DashMap::new(),
            by_client_key: DashMap::new(),
            net_quantities: DashMap::new(),
            next_id: AtomicU64::new(1),
            reject_placements: AtomicU32::new(0),
            drop_acks: AtomicU32::new(0),
            tick_tx,
        }
    }

    /// Fail the next `n` placements with a transport error before the order
    /// reaches the book.
    pub fn fail_next_placements(&self, n: u32) {
        self.reject_placements.store(n, Ordering::SeqCst);
    }

    /// Accept the next `n` placements but lose the acknowledgement.
    pub fn drop_next_acks(&self, n: u32) {
        self.drop_acks.store(n, Ordering::SeqCst);
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// Pushes a new price for a symbol, appending a bar, crossing any
    /// working limit orders and publishing a tick.
    pub fn push_price(&self, symbol: &str, price: f64) {
        let at = Utc::now();
        let mut entry = self.bars.entry(symbol.to_string()).or_default();
        let open = entry.last().map(|b| b.close).unwrap_or(price);
        entry.push(Bar {
            at,
            open,
            high: open.max(price),
            low: open.min(price),
            close: price,
            volume: 0.0,
        });
        drop(entry);

        self.cross_working_orders(symbol, price);

        let _ = self.tick_tx.send(MarketTick {
            symbol: symbol.to_string(),
            price,
            at,
        });
    }

    fn last_price(&self, symbol: &str) -> Option<f64> {
        self.bars.get(symbol).and_then(|b| b.last().map(|b| b.close))
    }

    fn cross_working_orders(&self, symbol: &str, price: f64) {
        let crossed: Vec<String> = self
            .orders
            .iter()
            .filter(|o| o.symbol == symbol && o.state == OrderState::Submitted)
            .filter(|o| match (o.side, o.limit_price) {
                (Side::Buy, Some(limit)) => price <= limit,
                (Side::Sell, Some(limit)) => price >= limit,
                _ => false,
            })
            .map(|o| o.broker_order_id.clone())
            .collect();

        for id in crossed {
            let settle = match self.orders.get_mut(&id) {
                Some(mut order) => {
                    let fill_price = order.limit_price.unwrap_or(price);
                    order.state = OrderState::Filled;
                    order.filled_quantity = order.quantity;
                    order.average_fill_price = fill_price;
                    Some((order.symbol.clone(), order.side, order.quantity, fill_price))
                }
                None => None,
            };
            if let Some((sym, side, quantity, fill_price)) = settle {
                self.settle_fill(&sym, side, quantity, fill_price);
            }
        }
    }

    fn settle_fill(&self, symbol: &str, side: Side, quantity: f64, price: f64) {
        let notional = quantity * price;
        if let Ok(mut balance) = self.balance.lock() {
            *balance -= side.sign() * notional;
        }
        let mut entry = self.net_quantities.entry(symbol.to_string()).or_insert((0.0, price));
        let (qty, avg) = *entry;
        let signed = side.sign() * quantity;
        let new_qty = qty + signed;
        let new_avg = if qty.signum() == signed.signum() || qty == 0.0 {
            let total = qty.abs() + quantity;
            if total > 0.0 {
                (qty.abs() * avg + quantity * price) / total
            } else {
                price
            }
        } else if new_qty.abs() > f64::EPSILON && new_qty.signum() != qty.signum() {
            // Flipped through zero: the remainder is a fresh position at
            // this fill's price.
            price
        } else {
            avg
        };
        *entry = (new_qty, new_avg);
        debug!(symbol, ?side, quantity, price, "Paper fill settled");
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn connect(&self) -> Result<(), CoreError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn place_order(
        &self,
        request: &BrokerOrderRequest,
    ) -> Result<BrokerOrderStatus, CoreError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CoreError::transport("paper broker not connected", 1));
        }
        if self.reject_placements.load(Ordering::SeqCst) > 0 {
            self.reject_placements.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::transport("injected placement failure", 1));
        }

        // Idempotency: a key the book already knows is the same order.
        if let Some(existing) = self.by_client_key.get(&request.client_key) {
            if let Some(order) = self.orders.get(existing.value()) {
                return Ok(order.status());
            }
        }

        let broker_order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let last = self.last_price(&request.symbol);
        let mut order = PaperOrder {
            broker_order_id: broker_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            limit_price: request.price,
            state: OrderState::Submitted,
            filled_quantity: 0.0,
            average_fill_price: 0.0,
        };

        match request.order_type {
            OrderType::Market => {
                let price = last.ok_or_else(|| {
                    CoreError::Validation(format!("no market price for {}", request.symbol))
                })?;
                order.state = OrderState::Filled;
                order.filled_quantity = order.quantity;
                order.average_fill_price = price;
                self.settle_fill(&order.symbol, order.side, order.quantity, price);
            }
            OrderType::Limit | OrderType::ImmediateOrCancel => {
                let limit = order.limit_price.ok_or_else(|| {
                    CoreError::Validation("limit order without a price".into())
                })?;
                let crossable = last
                    .map(|p| match order.side {
                        Side::Buy => p <= limit,
                        Side::Sell => p >= limit,
                    })
                    .unwrap_or(false);
                if crossable {
                    order.state = OrderState::Filled;
                    order.filled_quantity = order.quantity;
                    order.average_fill_price = limit;
                    self.settle_fill(&order.symbol, order.side, order.quantity, limit);
                } else if order.order_type == OrderType::ImmediateOrCancel {
                    order.state = OrderState::Cancelled;
                }
            }
        }

        let status = order.status();
        self.by_client_key
            .insert(request.client_key, broker_order_id.clone());
        self.orders.insert(broker_order_id, order);

        if self.drop_acks.load(Ordering::SeqCst) > 0 {
            self.drop_acks.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::transport("injected lost acknowledgement", 1));
        }
        Ok(status)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, CoreError> {
        match self.orders.get_mut(broker_order_id) {
            Some(mut order) if !order.state.is_terminal() => {
                order.state = OrderState::Cancelled;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn order_status(&self, broker_order_id: &str) -> Result<BrokerOrderStatus, CoreError> {
        self.orders
            .get(broker_order_id)
            .map(|o| o.status())
            .ok_or_else(|| CoreError::Validation(format!("unknown order {}", broker_order_id)))
    }

    async fn find_order(&self, client_key: Uuid) -> Result<Option<BrokerOrderStatus>, CoreError> {
        Ok(self
            .by_client_key
            .get(&client_key)
            .and_then(|id| self.orders.get(id.value()).map(|o| o.status())))
    }

    async fn positions(&self) -> Result<Vec<Position>, CoreError> {
        let mut out = Vec::new();
        for entry in self.net_quantities.iter() {
            let (qty, avg) = *entry.value();
            if qty.abs() > f64::EPSILON {
                let mut position = Position::new(entry.key().clone(), qty, avg);
                if let Some(price) = self.last_price(entry.key()) {
                    position.update_price(price);
                }
                out.push(position);
            }
        }
        Ok(out)
    }

    async fn account_info(&self) -> Result<AccountInfo, CoreError> {
        let balance = self
            .balance
            .lock()
            .map(|b| *b)
            .map_err(|_| CoreError::Fatal("paper broker balance lock poisoned".into()))?;
        Ok(AccountInfo {
            balance,
            margin: 0.0,
        })
    }

    async fn market_data(&self, symbol: &str, bars: usize) -> Result<Vec<Bar>, CoreError> {
        let history = self
            .bars
            .get(symbol)
            .ok_or_else(|| CoreError::Validation(format!("no market data for {}", symbol)))?;
        let start = history.len().saturating_sub(bars);
        Ok(history[start..].to_vec())
    }

    fn subscribe(&self) -> broadcast::Receiver<MarketTick> {
        self.tick_tx.subscribe()
    }
}
