/// Broker adapter capability set
///
/// The core depends only on this trait; one concrete adapter exists per
/// broker. Wire protocols live behind the implementations.

pub mod paper;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::{AccountInfo, Bar, MarketTick, OrderState, OrderType, Position, Side};

pub use paper::PaperBroker;

/// Order intent as handed to a broker, carrying the client idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderRequest {
    pub client_key: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub order_type: OrderType,
    pub price: Option<f64>,
}

/// Broker-side view of an order, returned by acks and status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderStatus {
    pub broker_order_id: String,
    pub state: OrderState,
    pub filled_quantity: f64,
    pub average_fill_price: f64,
}

/// Uniform capability set every broker adapter provides. All methods that
/// cross the network may suspend; the coordinator wraps each call in a
/// timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), CoreError>;

    async fn disconnect(&self) -> Result<(), CoreError>;

    async fn place_order(
        &self,
        request: &BrokerOrderRequest,
    ) -> Result<BrokerOrderStatus, CoreError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<bool, CoreError>;

    async fn order_status(&self, broker_order_id: &str) -> Result<BrokerOrderStatus, CoreError>;

    /// Looks an order up by its client idempotency key. Used to reconcile
    /// submissions whose acknowledgement was lost.
    async fn find_order(&self, client_key: Uuid) -> Result<Option<BrokerOrderStatus>, CoreError>;

    async fn positions(&self) -> Result<Vec<Position>, CoreError>;

    async fn account_info(&self) -> Result<AccountInfo, CoreError>;

    /// Most recent bars for a symbol, oldest first.
    async fn market_data(&self, symbol: &str, bars: usize) -> Result<Vec<Bar>, CoreError>;

    fn subscribe(&self) -> broadcast::Receiver<MarketTick>;
}
