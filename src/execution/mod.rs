/// Order execution coordination
///
/// Owns the lifecycle of every order: submission with bounded retry,
/// status polling, fill application and cancellation. Unknown outcomes are
/// reconciled through the broker's client-key lookup, never assumed.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{BrokerAdapter, BrokerOrderRequest, BrokerOrderStatus};
use crate::bus::ExecutionBus;
use crate::config::ExecutionSettings;
use crate::error::CoreError;
use crate::types::{ExecutionEvent, FillEvent, Order, OrderRequest, OrderState};

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub poll_interval: Duration,
    pub order_timeout: Duration,
    pub call_timeout: Duration,
}

impl From<&ExecutionSettings> for ExecutionConfig {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            max_retry_attempts: settings.max_retry_attempts,
            retry_base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            order_timeout: Duration::from_secs(settings.order_timeout_secs),
            call_timeout: Duration::from_secs(settings.broker_call_timeout_secs),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        (&ExecutionSettings::default()).into()
    }
}

/// Coordinator for order submission, polling and cancellation. Cheap to
/// clone; all clones share the same in-flight order table and event bus.
#[derive(Clone)]
pub struct OrderCoordinator {
    broker: Arc<dyn BrokerAdapter>,
    config: ExecutionConfig,
    orders: Arc<DashMap<Uuid, Order>>,
    bus: ExecutionBus,
}

impl OrderCoordinator {
    pub fn new(broker: Arc<dyn BrokerAdapter>, config: ExecutionConfig) -> Self {
        Self {
            broker,
            config,
            orders: Arc::new(DashMap::new()),
            bus: ExecutionBus::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.bus.subscribe()
    }

    pub fn order(&self, id: Uuid) -> Option<Order> {
        self.orders.get(&id).map(|o| o.clone())
    }

    /// Ids of orders that have not reached a terminal state.
    pub fn open_order_ids(&self) -> Vec<Uuid> {
        self.orders
            .iter()
            .filter(|o| !o.state.is_terminal())
            .map(|o| o.id)
            .collect()
    }

    /// Submits an order, retrying transport failures with exponential
    /// backoff. A timed-out or failed attempt is reconciled by client key
    /// before any retry so a lost acknowledgement cannot duplicate the
    /// order. After the retry budget the order is marked `Rejected` and the
    /// failure surfaced; a trade intent is never silently dropped.
    #[instrument(skip(self, request), fields(symbol = %request.symbol, side = ?request.side))]
    pub async fn submit(&self, request: OrderRequest) -> Result<Uuid, CoreError> {
        request.validate()?;
        let order = Order::new(&request);
        let id = order.id;
        let client_key = order.client_key;
        self.orders.insert(id, order);

        let broker_request = BrokerOrderRequest {
            client_key,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            price: request.price,
        };

        let mut last_error: Option<CoreError> = None;
        let mut ack: Option<BrokerOrderStatus> = None;

        for attempt in 1..=self.config.max_retry_attempts {
            match timeout(
                self.config.call_timeout,
                self.broker.place_order(&broker_request),
            )
            .await
            {
                Ok(Ok(status)) => {
                    ack = Some(status);
                    break;
                }
                Ok(Err(e)) => {
                    warn!(order_id = %id, attempt, error = %e, "Order placement failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(order_id = %id, attempt, "Order placement timed out, outcome unknown");
                    last_error = Some(CoreError::Timeout {
                        call: "place_order",
                    });
                }
            }

            // The attempt may have reached the broker even though the
            // acknowledgement was lost; check before re-placing.
            match self.reconcile(client_key).await {
                Ok(Some(status)) => {
                    info!(order_id = %id, broker_order_id = %status.broker_order_id,
                        "Reconciled order after lost acknowledgement");
                    ack = Some(status);
                    break;
                }
                Ok(None) => {}
                Err(e) => debug!(order_id = %id, error = %e, "Reconciliation query failed"),
            }

            if attempt < self.config.max_retry_attempts {
                let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                sleep(delay).await;
            }
        }

        let Some(status) = ack else {
            self.mark_rejected(id);
            let e = last_error.unwrap_or_else(|| {
                CoreError::transport("order placement failed", self.config.max_retry_attempts)
            });
            error!(order_id = %id, error = %e, "Order rejected after retry budget");
            return Err(e);
        };

        self.adopt_ack(id, &status)?;

        // Non-terminal orders are driven to completion by a background
        // poll; market orders normally arrive already filled.
        if !status.state.is_terminal() {
            let coordinator = self.clone();
            tokio::spawn(async move {
                if let Err(e) = coordinator.poll_until_terminal(id).await {
                    error!(order_id = %id, error = %e, "Order polling failed");
                }
            });
        }
        Ok(id)
    }

    /// Single status poll; updates local state and returns it.
    pub async fn poll(&self, id: Uuid) -> Result<OrderState, CoreError> {
        let broker_order_id = {
            let order = self
                .orders
                .get(&id)
                .ok_or_else(|| CoreError::Validation(format!("unknown order {}", id)))?;
            if order.state.is_terminal() {
                return Ok(order.state);
            }
            order
                .broker_order_id
                .clone()
                .ok_or(CoreError::Reconciliation { order_id: id })?
        };
        let status = timeout(
            self.config.call_timeout,
            self.broker.order_status(&broker_order_id),
        )
        .await
        .map_err(|_| CoreError::Timeout {
            call: "order_status",
        })??;
        self.apply_status(id, &status)?;
        Ok(status.state)
    }

    /// Cancels a working order. Returns whether the broker honored it.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<bool, CoreError> {
        let broker_order_id = {
            let order = self
                .orders
                .get(&id)
                .ok_or_else(|| CoreError::Validation(format!("unknown order {}", id)))?;
            if order.state.is_terminal() {
                return Ok(false);
            }
            match order.broker_order_id.clone() {
                Some(bid) => bid,
                None => {
                    // Still awaiting its first acknowledgement; there is
                    // nothing broker-side to cancel. Reconciliation by
                    // client key owns the outcome.
                    return Ok(false);
                }
            }
        };
        let cancelled = timeout(
            self.config.call_timeout,
            self.broker.cancel_order(&broker_order_id),
        )
        .await
        .map_err(|_| CoreError::Timeout {
            call: "cancel_order",
        })??;
        if cancelled {
            self.transition(id, OrderState::Cancelled)?;
        } else {
            // Refused cancels usually mean the order just filled; re-sync.
            let _ = self.poll(id).await;
        }
        Ok(cancelled)
    }

    /// Cancels every order still working. Best effort: failures are logged
    /// and do not stop the sweep.
    pub async fn cancel_all(&self) {
        for id in self.open_order_ids() {
            if let Err(e) = self.cancel(id).await {
                warn!(order_id = %id, error = %e, "Cancel failed during sweep");
            }
        }
    }

    async fn reconcile(&self, client_key: Uuid) -> Result<Option<BrokerOrderStatus>, CoreError> {
        timeout(self.config.call_timeout, self.broker.find_order(client_key))
            .await
            .map_err(|_| CoreError::Timeout { call: "find_order" })?
    }

    /// Polls a working order at a fixed interval until it reaches a
    /// terminal state or the order timeout elapses, then cancels it and
    /// marks it `Expired`.
    async fn poll_until_terminal(&self, id: Uuid) -> Result<(), CoreError> {
        let deadline = Instant::now() + self.config.order_timeout;
        loop {
            sleep(self.config.poll_interval).await;
            match self.poll(id).await {
                Ok(state) if state.is_terminal() => return Ok(()),
                Ok(_) => {}
                Err(e) => warn!(order_id = %id, error = %e, "Status poll failed"),
            }
            if Instant::now() >= deadline {
                warn!(order_id = %id, "Order timed out, cancelling");
                let _ = self.cancel(id).await;
                // If the cancel did not land a terminal state, expire locally.
                if let Some(order) = self.orders.get(&id) {
                    if !order.state.is_terminal() {
                        drop(order);
                        self.transition(id, OrderState::Expired)?;
                    }
                }
                return Ok(());
            }
        }
    }

    fn adopt_ack(&self, id: Uuid, status: &BrokerOrderStatus) -> Result<(), CoreError> {
        {
            let mut order = self
                .orders
                .get_mut(&id)
                .ok_or_else(|| CoreError::Fatal(format!("order {} vanished", id)))?;
            order.broker_order_id = Some(status.broker_order_id.clone());
            order.transition(OrderState::Submitted)?;
        }
        self.bus.publish(ExecutionEvent::StateChange {
            order_id: id,
            state: OrderState::Submitted,
        });
        self.apply_status(id, status)
    }

    /// Applies a broker-side status atomically: one entry update, then the
    /// fill delta and the state change are published in that order.
    fn apply_status(&self, id: Uuid, status: &BrokerOrderStatus) -> Result<(), CoreError> {
        let mut fill: Option<FillEvent> = None;
        let mut changed: Option<OrderState> = None;
        {
            let mut order = self
                .orders
                .get_mut(&id)
                .ok_or_else(|| CoreError::Fatal(format!("order {} vanished", id)))?;
            if order.state.is_terminal() {
                return Ok(());
            }
            let delta = status.filled_quantity - order.filled_quantity;
            if delta > 1e-9 {
                // The broker reports a cumulative average; back out this
                // leg's own price from the notional delta.
                let leg_price = (status.average_fill_price * status.filled_quantity
                    - order.average_fill_price * order.filled_quantity)
                    / delta;
                fill = Some(FillEvent {
                    order_id: id,
                    symbol: order.symbol.clone(),
                    side: order.side,
                    quantity: delta,
                    price: leg_price,
                    at: chrono::Utc::now(),
                });
                order.filled_quantity = status.filled_quantity;
                order.average_fill_price = status.average_fill_price;
            }
            if status.state != order.state {
                order.transition(status.state)?;
                changed = Some(status.state);
            }
        }
        if let Some(fill) = fill {
            self.bus.publish(ExecutionEvent::Fill(fill));
        }
        if let Some(state) = changed {
            self.bus.publish(ExecutionEvent::StateChange {
                order_id: id,
                state,
            });
        }
        Ok(())
    }

    fn transition(&self, id: Uuid, state: OrderState) -> Result<(), CoreError> {
        if let Some(mut order) = self.orders.get_mut(&id) {
            order.transition(state)?;
        }
        self.bus.publish(ExecutionEvent::StateChange {
            order_id: id,
            state,
        });
        Ok(())
    }

    fn mark_rejected(&self, id: Uuid) {
        if let Some(mut order) = self.orders.get_mut(&id) {
            // Pending -> Rejected and Submitted -> Rejected are both legal;
            // anything else means the order already resolved.
            if order.transition(OrderState::Rejected).is_err() {
                return;
            }
        }
        self.bus.publish(ExecutionEvent::StateChange {
            order_id: id,
            state: OrderState::Rejected,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MockBrokerAdapter, PaperBroker};
    use crate::types::Side;
    use mockall::predicate::always;

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            max_retry_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            order_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_secs(1),
        }
    }

    async fn paper_coordinator() -> (Arc<PaperBroker>, OrderCoordinator) {
        let broker = Arc::new(PaperBroker::new(1_000_000.0));
        broker.connect().await.unwrap();
        broker.push_price("ACME", 100.0);
        let coordinator = OrderCoordinator::new(broker.clone(), fast_config());
        (broker, coordinator)
    }

    #[tokio::test]
    async fn market_order_fills_and_publishes_events() {
        let (_broker, coordinator) = paper_coordinator().await;
        let mut events = coordinator.subscribe();

        let id = coordinator
            .submit(OrderRequest::market("ACME", Side::Buy, 10.0))
            .await
            .unwrap();

        let order = coordinator.order(id).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert!((order.filled_quantity - 10.0).abs() < f64::EPSILON);

        // Submitted state change, then the fill, then Filled.
        let mut saw_fill = false;
        let mut saw_filled = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ExecutionEvent::Fill(fill) => {
                    assert_eq!(fill.order_id, id);
                    assert!((fill.quantity - 10.0).abs() < f64::EPSILON);
                    saw_fill = true;
                }
                ExecutionEvent::StateChange { state, .. } => {
                    if state == OrderState::Filled {
                        saw_filled = true;
                    }
                }
            }
        }
        assert!(saw_fill && saw_filled);
    }

    #[tokio::test]
    async fn transient_transport_failure_is_retried() {
        let (broker, coordinator) = paper_coordinator().await;
        broker.fail_next_placements(2);

        let id = coordinator
            .submit(OrderRequest::market("ACME", Side::Buy, 5.0))
            .await
            .unwrap();
        assert_eq!(coordinator.order(id).unwrap().state, OrderState::Filled);
        assert_eq!(broker.order_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_reject_and_surface() {
        let (broker, coordinator) = paper_coordinator().await;
        broker.fail_next_placements(10);

        let err = coordinator
            .submit(OrderRequest::market("ACME", Side::Buy, 5.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Transport { .. }));
        assert_eq!(broker.order_count(), 0);

        // The local order is rejected, not dropped.
        let rejected = coordinator
            .orders
            .iter()
            .any(|o| o.state == OrderState::Rejected);
        assert!(rejected);
    }

    #[tokio::test]
    async fn lost_ack_reconciles_without_duplicate() {
        let (broker, coordinator) = paper_coordinator().await;
        broker.drop_next_acks(1);

        let id = coordinator
            .submit(OrderRequest::market("ACME", Side::Buy, 5.0))
            .await
            .unwrap();
        assert_eq!(coordinator.order(id).unwrap().state, OrderState::Filled);
        // Exactly one broker order despite the lost acknowledgement.
        assert_eq!(broker.order_count(), 1);
    }

    #[tokio::test]
    async fn working_limit_order_expires_after_timeout() {
        let (_broker, coordinator) = paper_coordinator().await;

        let id = coordinator
            .submit(OrderRequest::limit("ACME", Side::Buy, 5.0, 90.0))
            .await
            .unwrap();
        assert_eq!(coordinator.order(id).unwrap().state, OrderState::Submitted);

        // Wait past the order timeout for the poll task to cancel it.
        sleep(Duration::from_millis(300)).await;
        let state = coordinator.order(id).unwrap().state;
        assert!(
            state == OrderState::Cancelled || state == OrderState::Expired,
            "unexpected state {:?}",
            state
        );
    }

    #[tokio::test]
    async fn limit_order_fills_when_price_crosses() {
        let (broker, coordinator) = paper_coordinator().await;

        let id = coordinator
            .submit(OrderRequest::limit("ACME", Side::Buy, 5.0, 95.0))
            .await
            .unwrap();
        broker.push_price("ACME", 94.0);

        sleep(Duration::from_millis(50)).await;
        let order = coordinator.order(id).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert!((order.average_fill_price - 95.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cancel_working_order() {
        let (_broker, coordinator) = paper_coordinator().await;
        let id = coordinator
            .submit(OrderRequest::limit("ACME", Side::Buy, 5.0, 90.0))
            .await
            .unwrap();
        assert!(coordinator.cancel(id).await.unwrap());
        assert_eq!(coordinator.order(id).unwrap().state, OrderState::Cancelled);
    }

    #[tokio::test]
    async fn partial_fill_legs_priced_from_notional_delta() {
        let mut mock = MockBrokerAdapter::new();
        mock.expect_place_order().returning(|_| {
            Ok(BrokerOrderStatus {
                broker_order_id: "b-1".into(),
                state: OrderState::PartiallyFilled,
                filled_quantity: 5.0,
                average_fill_price: 100.0,
            })
        });
        mock.expect_order_status().returning(|_| {
            Ok(BrokerOrderStatus {
                broker_order_id: "b-1".into(),
                state: OrderState::Filled,
                filled_quantity: 10.0,
                average_fill_price: 101.0,
            })
        });

        // Slow background poll so this test drives the status updates.
        let config = ExecutionConfig {
            poll_interval: Duration::from_secs(60),
            order_timeout: Duration::from_secs(120),
            ..fast_config()
        };
        let coordinator = OrderCoordinator::new(Arc::new(mock), config);
        let mut events = coordinator.subscribe();

        let id = coordinator
            .submit(OrderRequest::limit("ACME", Side::Buy, 10.0, 101.0))
            .await
            .unwrap();
        coordinator.poll(id).await.unwrap();

        let mut fills = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::Fill(fill) = event {
                fills.push(fill);
            }
        }
        assert_eq!(fills.len(), 2);
        assert!((fills[0].price - 100.0).abs() < 1e-9);
        // Cumulative average moved 100 -> 101 over 5 + 5, so the second
        // leg itself traded at 102.
        assert!((fills[1].price - 102.0).abs() < 1e-9);
        assert_eq!(coordinator.order(id).unwrap().state, OrderState::Filled);
    }

    #[tokio::test]
    async fn cancel_before_acknowledgement_is_refused() {
        let mock = MockBrokerAdapter::new();
        let coordinator = OrderCoordinator::new(Arc::new(mock), fast_config());

        // An order that never got its first acknowledgement.
        let order = Order::new(&OrderRequest::market("ACME", Side::Buy, 1.0));
        let id = order.id;
        coordinator.orders.insert(id, order);

        assert!(!coordinator.cancel(id).await.unwrap());
        assert_eq!(coordinator.order(id).unwrap().state, OrderState::Pending);
    }

    #[tokio::test]
    async fn invalid_request_rejected_before_broker() {
        let mut mock = MockBrokerAdapter::new();
        mock.expect_place_order().with(always()).never();
        let coordinator = OrderCoordinator::new(Arc::new(mock), fast_config());
        let err = coordinator
            .submit(OrderRequest::market("ACME", Side::Buy, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
