/// Session configuration structures and TOML loading

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::risk::{FeeSchedule, RiskParameters, SessionWindow};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub symbols: Vec<String>,
    pub cycle_interval_secs: u64,
    /// Emergency-stop once this many cycle errors land inside the window.
    pub max_consecutive_errors: usize,
    pub error_window_secs: u64,
    /// How long a graceful stop waits for exits before forcing closure.
    pub stop_drain_timeout_secs: u64,
    #[serde(default)]
    pub session: SessionWindow,
    #[serde(default)]
    pub risk: RiskParameters,
    #[serde(default)]
    pub fees: FeeSchedule,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub backtest: BacktestSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub max_retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub order_timeout_secs: u64,
    pub broker_call_timeout_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_base_delay_ms: 250,
            poll_interval_ms: 500,
            order_timeout_secs: 60,
            broker_call_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSettings {
    pub initial_capital: f64,
    pub slippage_pct: f64,
    pub seed: u64,
}

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            slippage_pct: 0.0005,
            seed: 42,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            cycle_interval_secs: 30,
            session: SessionWindow::all_day(),
            max_consecutive_errors: 5,
            error_window_secs: 3_600,
            stop_drain_timeout_secs: 120,
            risk: RiskParameters::default(),
            fees: FeeSchedule::default(),
            execution: ExecutionSettings::default(),
            backtest: BacktestSettings::default(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.symbols.is_empty() {
            return Err(CoreError::Validation("symbols list is empty".into()));
        }
        if self.cycle_interval_secs == 0 {
            return Err(CoreError::Validation(
                "cycle_interval_secs must be at least 1".into(),
            ));
        }
        if self.max_consecutive_errors == 0 {
            return Err(CoreError::Validation(
                "max_consecutive_errors must be at least 1".into(),
            ));
        }
        if self.session.open > self.session.close {
            return Err(CoreError::Validation(
                "session open is after session close".into(),
            ));
        }
        if self.execution.max_retry_attempts == 0 {
            return Err(CoreError::Validation(
                "max_retry_attempts must be at least 1".into(),
            ));
        }
        self.risk.validate().map_err(CoreError::Validation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal() -> Config {
        Config {
            symbols: vec!["ACME".into()],
            ..Default::default()
        }
    }

    #[test]
    fn default_config_with_symbols_validates() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn empty_symbols_rejected() {
        let err = Config::default().validate().unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn roundtrip_through_toml_file() {
        let config = minimal();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml::to_string(&config).unwrap().as_bytes())
            .unwrap();
        let loaded = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.symbols, vec!["ACME".to_string()]);
        assert_eq!(loaded.cycle_interval_secs, config.cycle_interval_secs);
        assert!((loaded.risk.stop_loss_pct - config.risk.stop_loss_pct).abs() < f64::EPSILON);
    }

    #[test]
    fn inverted_session_rejected() {
        let mut config = minimal();
        config.session = crate::risk::SessionWindow {
            open: chrono::NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
            close: chrono::NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        };
        assert!(config.validate().is_err());
    }
}
