/// Signal sources
///
/// External prediction models plug in through `SignalSource`; the built-in
/// momentum strategy gives the controller and the backtests something real
/// to run.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::CoreError;
use crate::types::{MarketSnapshot, Signal, SignalSide};

/// Supplies candidate signals for one market snapshot. Implementations
/// must not mutate shared state; the controller consumes each batch once.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    async fn signals(&self, snapshot: &MarketSnapshot) -> Result<Vec<Signal>, CoreError>;
}

/// Bar-over-bar momentum: emits a signal when the return exceeds the
/// threshold, with confidence scaled by the size of the move.
pub struct MomentumStrategy {
    threshold: f64,
}

impl MomentumStrategy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl SignalSource for MomentumStrategy {
    fn name(&self) -> &str {
        "momentum"
    }

    async fn signals(&self, snapshot: &MarketSnapshot) -> Result<Vec<Signal>, CoreError> {
        if !(self.threshold > 0.0) {
            return Err(CoreError::Validation(format!(
                "momentum threshold must be positive, got {}",
                self.threshold
            )));
        }
        let mut out = Vec::new();
        for (symbol, quote) in &snapshot.quotes {
            if quote.prev <= 0.0 {
                continue;
            }
            let ret = (quote.last - quote.prev) / quote.prev;
            if ret.abs() < self.threshold {
                continue;
            }
            let side = if ret > 0.0 {
                SignalSide::Buy
            } else {
                SignalSide::Sell
            };
            // Saturates at 2x the threshold.
            let confidence = (ret.abs() / (2.0 * self.threshold)).min(1.0);
            out.push(Signal {
                symbol: symbol.clone(),
                side,
                confidence,
                suggested_price: quote.last,
                size_hint: None,
                source: self.name().to_string(),
                generated_at: Utc::now(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Quote;
    use std::collections::BTreeMap;

    fn snapshot(pairs: &[(&str, f64, f64)]) -> MarketSnapshot {
        let quotes: BTreeMap<String, Quote> = pairs
            .iter()
            .map(|(s, prev, last)| {
                (
                    s.to_string(),
                    Quote {
                        last: *last,
                        prev: *prev,
                    },
                )
            })
            .collect();
        MarketSnapshot {
            at: Utc::now(),
            quotes,
        }
    }

    #[tokio::test]
    async fn emits_buy_on_upward_move() {
        let strategy = MomentumStrategy::new(0.01);
        let signals = strategy
            .signals(&snapshot(&[("ACME", 100.0, 103.0)]))
            .await
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].side, SignalSide::Buy);
        assert!(signals[0].confidence > 0.9);
    }

    #[tokio::test]
    async fn emits_sell_on_downward_move() {
        let strategy = MomentumStrategy::new(0.01);
        let signals = strategy
            .signals(&snapshot(&[("ACME", 100.0, 97.0)]))
            .await
            .unwrap();
        assert_eq!(signals[0].side, SignalSide::Sell);
    }

    #[tokio::test]
    async fn quiet_market_produces_nothing() {
        let strategy = MomentumStrategy::new(0.01);
        let signals = strategy
            .signals(&snapshot(&[("ACME", 100.0, 100.2)]))
            .await
            .unwrap();
        assert!(signals.is_empty());
    }

    #[tokio::test]
    async fn symbols_emitted_in_stable_order() {
        let strategy = MomentumStrategy::new(0.01);
        let signals = strategy
            .signals(&snapshot(&[
                ("ZULU", 100.0, 105.0),
                ("ACME", 100.0, 105.0),
            ]))
            .await
            .unwrap();
        assert_eq!(signals[0].symbol, "ACME");
        assert_eq!(signals[1].symbol, "ZULU");
    }
}
