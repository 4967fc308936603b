/// Error taxonomy for the trading core

use uuid::Uuid;

/// Failures surfaced by the trading core.
///
/// Risk rejections are deliberately absent: a rejected signal is a normal
/// `Decision` outcome, not an error.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Broker or network unreachable after the bounded retry budget.
    #[error("transport failure after {attempts} attempt(s): {message}")]
    Transport { message: String, attempts: u32 },

    /// Malformed signal, order request or configuration.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A broker call exceeded its deadline.
    #[error("broker call timed out: {call}")]
    Timeout { call: &'static str },

    /// Order outcome unknown after a timed-out submission; must be resolved
    /// by a status query, never assumed.
    #[error("order {order_id} outcome unknown, reconciliation required")]
    Reconciliation { order_id: Uuid },

    /// Internal invariant violation. Forces an emergency stop.
    #[error("invariant violation: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn transport(message: impl Into<String>, attempts: u32) -> Self {
        Self::Transport {
            message: message.into(),
            attempts,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
