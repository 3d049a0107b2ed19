use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use thiserror::Error;

use crate::circuit_breaker::BreakerConfig;
use crate::rate_limiter::WindowSpec;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub backends: HashMap<String, BackendConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    #[serde(alias = "queueCapacityPerClass", default = "default_queue_capacity")]
    pub queue_capacity_per_class: usize,
    #[serde(alias = "maxRetries", default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(alias = "backoffBaseMs", default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(alias = "backoffMaxMs", default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Half-life, in samples, of the execution-quality averages
    #[serde(alias = "qualityHalfLife", default = "default_quality_half_life")]
    pub quality_half_life: f64,
    #[serde(alias = "balanceRefreshMs", default = "default_balance_refresh_ms")]
    pub balance_refresh_ms: u64,
    #[serde(alias = "outcomeChannelCapacity", default = "default_outcome_capacity")]
    pub outcome_channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity_per_class: default_queue_capacity(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            quality_half_life: default_quality_half_life(),
            balance_refresh_ms: default_balance_refresh_ms(),
            outcome_channel_capacity: default_outcome_capacity(),
        }
    }
}

/// Well-known venue budgets.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreset {
    /// KIS-style REST: 20 req/s peak stacked with 1000 req/min sustained
    Kis,
    /// 60 requests per 15 seconds
    Window15s60,
    /// 20 requests per second
    Window1s20,
}

impl BackendPreset {
    pub fn windows(self) -> Vec<WindowSpec> {
        match self {
            BackendPreset::Kis => vec![WindowSpec::new(1_000, 20), WindowSpec::new(60_000, 1_000)],
            BackendPreset::Window15s60 => vec![WindowSpec::new(15_000, 60)],
            BackendPreset::Window1s20 => vec![WindowSpec::new(1_000, 20)],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default)]
    pub preset: Option<BackendPreset>,
    /// Explicit windows; override the preset when non-empty
    #[serde(default)]
    pub windows: Vec<WindowSpec>,
    #[serde(alias = "failureThreshold", default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(alias = "cooldownMs", default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(alias = "callTimeoutMs", default)]
    pub call_timeout_ms: Option<u64>,
    /// Market-data symbols auto-sharded across the accounts
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

impl BackendConfig {
    pub fn effective_windows(&self) -> Vec<WindowSpec> {
        if !self.windows.is_empty() {
            return self.windows.clone();
        }
        self.preset.map(BackendPreset::windows).unwrap_or_default()
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown_ms: self.cooldown_ms,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            preset: None,
            windows: Vec::new(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            call_timeout_ms: None,
            symbols: Vec::new(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccountConfig {
    #[serde(alias = "adapterId")]
    pub adapter_id: String,
    #[serde(alias = "accountId")]
    pub account_id: String,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AccountConfig {
    pub fn new(adapter_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            account_id: account_id.into(),
            symbols: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = symbols.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("backend '{0}' has no rate windows (set `windows` or `preset`)")]
    NoWindows(String),
    #[error("backend '{backend}' has an invalid window ({window_ms} ms / {capacity})")]
    InvalidWindow {
        backend: String,
        window_ms: u64,
        capacity: u32,
    },
    #[error("backend '{0}' has failure_threshold 0")]
    ZeroThreshold(String),
    #[error("backend '{0}' has no accounts")]
    NoAccounts(String),
    #[error("adapter id '{0}' is configured more than once")]
    DuplicateAdapter(String),
    #[error("symbol '{symbol}' is explicitly assigned to more than one account of '{backend}'")]
    DuplicateSymbol { backend: String, symbol: String },
    #[error("dispatcher.{0} must be positive")]
    NonPositive(&'static str),
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.titan/gateway.{toml,json,ini}
            .add_source(File::with_name(&format!("{}/.titan/gateway", home)).required(false))
            // 2. Project config
            .add_source(File::with_name("config/gateway").required(false))
            // 3. Run-mode config, e.g. config/gateway.production
            .add_source(File::with_name(&format!("config/gateway.{}", run_mode)).required(false))
            // 4. Local overrides (not checked in)
            .add_source(File::with_name("config/gateway.local").required(false))
            // 5. Environment overrides, e.g. TITAN_DISPATCHER__MAX_RETRIES=5
            .add_source(
                Environment::with_prefix("TITAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(document, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let d = &self.dispatcher;
        if d.queue_capacity_per_class == 0 {
            return Err(ConfigValidationError::NonPositive("queue_capacity_per_class"));
        }
        if d.backoff_base_ms == 0 {
            return Err(ConfigValidationError::NonPositive("backoff_base_ms"));
        }
        if d.outcome_channel_capacity == 0 {
            return Err(ConfigValidationError::NonPositive("outcome_channel_capacity"));
        }

        let mut adapter_ids = HashSet::new();
        for (name, backend) in &self.backends {
            let windows = backend.effective_windows();
            if windows.is_empty() {
                return Err(ConfigValidationError::NoWindows(name.clone()));
            }
            if let Some(w) = windows.iter().find(|w| w.window_ms == 0 || w.capacity == 0) {
                return Err(ConfigValidationError::InvalidWindow {
                    backend: name.clone(),
                    window_ms: w.window_ms,
                    capacity: w.capacity,
                });
            }
            if backend.failure_threshold == 0 {
                return Err(ConfigValidationError::ZeroThreshold(name.clone()));
            }
            if backend.accounts.is_empty() {
                return Err(ConfigValidationError::NoAccounts(name.clone()));
            }

            let mut symbols = HashSet::new();
            for account in &backend.accounts {
                if !adapter_ids.insert(account.adapter_id.clone()) {
                    return Err(ConfigValidationError::DuplicateAdapter(
                        account.adapter_id.clone(),
                    ));
                }
                for symbol in &account.symbols {
                    if !symbols.insert(symbol.trim().to_uppercase()) {
                        return Err(ConfigValidationError::DuplicateSymbol {
                            backend: name.clone(),
                            symbol: symbol.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    3100
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_quality_half_life() -> f64 {
    crate::quality::DEFAULT_HALF_LIFE_SAMPLES
}

fn default_balance_refresh_ms() -> u64 {
    30_000
}

fn default_outcome_capacity() -> usize {
    1024
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        port = 3200

        [dispatcher]
        max_retries = 4
        backoff_base_ms = 50

        [backends.kis]
        preset = "kis"
        failure_threshold = 3
        cooldown_ms = 10000
        symbols = ["005930", "000660", "035420"]

        [[backends.kis.accounts]]
        adapter_id = "kis-main"
        account_id = "5001-01"
        symbols = ["005930"]

        [[backends.kis.accounts]]
        adapter_id = "kis-sub"
        account_id = "5001-02"

        [backends.upbit]
        windows = [{ window_ms = 15000, capacity = 60 }]
        call_timeout_ms = 2500

        [[backends.upbit.accounts]]
        adapter_id = "upbit-1"
        account_id = "u-1"
        enabled = false
    "#;

    #[test]
    fn test_parse_and_defaults() {
        let settings = Settings::from_toml_str(SAMPLE).unwrap();
        assert_eq!(settings.server.port, 3200);
        assert_eq!(settings.dispatcher.max_retries, 4);
        assert_eq!(settings.dispatcher.backoff_base_ms, 50);
        assert_eq!(settings.dispatcher.backoff_max_ms, 2_000);
        assert_eq!(settings.dispatcher.queue_capacity_per_class, 1024);

        let kis = &settings.backends["kis"];
        assert_eq!(kis.effective_windows().len(), 2);
        assert_eq!(kis.breaker().failure_threshold, 3);
        assert_eq!(kis.accounts.len(), 2);
        assert!(kis.accounts[1].enabled);
        assert_eq!(kis.accounts[0].symbols, vec!["005930".to_string()]);

        let upbit = &settings.backends["upbit"];
        assert_eq!(upbit.effective_windows(), vec![WindowSpec::new(15_000, 60)]);
        assert_eq!(upbit.call_timeout_ms, Some(2500));
        assert_eq!(upbit.failure_threshold, 5);
        assert!(!upbit.accounts[0].enabled);

        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_windows() {
        let mut settings = Settings::default();
        let mut backend = BackendConfig::default();
        backend.accounts.push(AccountConfig::new("a", "1"));
        settings.backends.insert("x".into(), backend);
        assert_eq!(
            settings.validate(),
            Err(ConfigValidationError::NoWindows("x".into()))
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_symbol_assignment() {
        let mut settings = Settings::default();
        let mut backend = BackendConfig {
            preset: Some(BackendPreset::Window1s20),
            ..BackendConfig::default()
        };
        backend
            .accounts
            .push(AccountConfig::new("a", "1").with_symbols(["AAPL"]));
        backend
            .accounts
            .push(AccountConfig::new("b", "2").with_symbols(["aapl"]));
        settings.backends.insert("alpaca".into(), backend);
        assert!(matches!(
            settings.validate(),
            Err(ConfigValidationError::DuplicateSymbol { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_adapter_ids_across_backends() {
        let mut settings = Settings::default();
        for name in ["one", "two"] {
            let mut backend = BackendConfig {
                preset: Some(BackendPreset::Window1s20),
                ..BackendConfig::default()
            };
            backend.accounts.push(AccountConfig::new("shared", name));
            settings.backends.insert(name.into(), backend);
        }
        assert_eq!(
            settings.validate(),
            Err(ConfigValidationError::DuplicateAdapter("shared".into()))
        );
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut settings = Settings::default();
        let mut backend = BackendConfig {
            windows: vec![WindowSpec::new(1000, 0)],
            ..BackendConfig::default()
        };
        backend.accounts.push(AccountConfig::new("a", "1"));
        settings.backends.insert("x".into(), backend);
        assert!(matches!(
            settings.validate(),
            Err(ConfigValidationError::InvalidWindow { capacity: 0, .. })
        ));
    }
}
