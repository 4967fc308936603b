/// Trade execution core
///
/// Risk validation, order execution, portfolio tracking and the autonomous
/// session controller, plus a backtest engine that replays history through
/// the same decision code.

pub mod backtest;
pub mod broker;
pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod portfolio;
pub mod risk;
pub mod signal;
pub mod types;

pub use broker::{BrokerAdapter, PaperBroker};
pub use config::Config;
pub use controller::{StatusSnapshot, StopReason, TradingController};
pub use error::{CoreError, CoreResult};
pub use execution::{ExecutionConfig, OrderCoordinator};
pub use portfolio::PortfolioTracker;
pub use risk::{Decision, FeeSchedule, RejectReason, RiskParameters};
pub use signal::{MomentumStrategy, SignalSource};
