use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub type RequestId = String;

/// Identifies one broker family (one venue API surface).
///
/// Names are normalised to trimmed lowercase so `"Binance"` and `"binance"`
/// address the same pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct BackendType(String);

impl BackendType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for BackendType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for BackendType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<BackendType> for String {
    fn from(value: BackendType) -> Self {
        value.0
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strict precedence: High is always drained before Medium, Medium before Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Order execution and risk checks
    High,
    /// Real-time market data
    Medium,
    /// Historical / background polling
    Low,
}

impl Priority {
    /// In dequeue precedence order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    PlaceOrder,
    CancelOrder,
    AmendOrder,
    Quote,
    OrderBook,
    HistoricalBars,
    Balance,
    Positions,
    OpenOrders,
    Custom(String),
}

impl Operation {
    /// Market-data reads are sharded by symbol across the accounts of a pool.
    pub fn is_symbol_scoped(&self) -> bool {
        matches!(
            self,
            Operation::Quote | Operation::OrderBook | Operation::HistoricalBars
        )
    }

    pub fn is_order_operation(&self) -> bool {
        matches!(
            self,
            Operation::PlaceOrder | Operation::CancelOrder | Operation::AmendOrder
        )
    }

    /// Priority used when the caller leaves it unset.
    pub fn default_priority(&self) -> Priority {
        if self.is_order_operation() {
            return Priority::High;
        }
        match self {
            Operation::HistoricalBars => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::PlaceOrder => "place_order",
            Operation::CancelOrder => "cancel_order",
            Operation::AmendOrder => "amend_order",
            Operation::Quote => "quote",
            Operation::OrderBook => "order_book",
            Operation::HistoricalBars => "historical_bars",
            Operation::Balance => "balance",
            Operation::Positions => "positions",
            Operation::OpenOrders => "open_orders",
            Operation::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What an upstream producer hands to the gateway. The gateway mints the
/// `request_id` and `submitted_at` when it accepts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub correlation_id: String,
    pub backend: BackendType,
    pub operation: Operation,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SubmitRequest {
    pub fn new(
        correlation_id: impl Into<String>,
        backend: impl Into<BackendType>,
        operation: Operation,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            backend: backend.into(),
            operation,
            parameters: Map::new(),
            priority: None,
            symbol: None,
            timeout_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Shape checks that do not need gateway state.
    pub fn validate(&self) -> Result<(), String> {
        if self.correlation_id.trim().is_empty() {
            return Err("correlation_id must not be empty".to_string());
        }
        if self.backend.as_str().is_empty() {
            return Err("backend must not be empty".to_string());
        }
        if let Operation::Custom(name) = &self.operation {
            if name.trim().is_empty() {
                return Err("custom operation name must not be empty".to_string());
            }
        }
        if let Some(symbol) = &self.symbol {
            if symbol.trim().is_empty() {
                return Err("symbol must not be blank when present".to_string());
            }
        }
        if self.operation.is_symbol_scoped() && self.symbol.is_none() {
            return Err(format!("operation '{}' requires a symbol", self.operation));
        }
        if self.timeout_ms == Some(0) {
            return Err("timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// An accepted request. Immutable once minted; a retry is a new `Request`
/// with a fresh id and the same correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: RequestId,
    pub correlation_id: String,
    pub backend: BackendType,
    pub operation: Operation,
    pub parameters: Map<String, Value>,
    pub priority: Priority,
    pub symbol: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub timeout_ms: Option<u64>,
}

impl Request {
    pub fn mint(submit: SubmitRequest, request_id: RequestId, submitted_at: DateTime<Utc>) -> Self {
        let priority = submit
            .priority
            .unwrap_or_else(|| submit.operation.default_priority());
        Self {
            request_id,
            correlation_id: submit.correlation_id,
            backend: submit.backend,
            operation: submit.operation,
            parameters: submit.parameters,
            priority,
            symbol: submit.symbol.map(|s| s.trim().to_uppercase()),
            submitted_at,
            timeout_ms: submit.timeout_ms,
        }
    }

    /// Same payload, correlation and priority under a new identity.
    pub fn retry(&self, request_id: RequestId, submitted_at: DateTime<Utc>) -> Self {
        Self {
            request_id,
            submitted_at,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    QueueFull,
    RateLimited,
    CircuitOpen,
    BackendTransient,
    BackendPermanent,
    TimedOut,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::BackendTransient => "backend_transient",
            ErrorKind::BackendPermanent => "backend_permanent",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ResponseError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after_ms: Option<u64>) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }
}

/// Terminal outcome of a request, delivered exactly once to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the attempt that produced this outcome.
    pub request_id: RequestId,
    pub correlation_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    pub attempts: u32,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
}

impl Response {
    pub fn completed(
        request: &Request,
        adapter_id: &str,
        data: Value,
        attempts: u32,
        dispatched_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request.request_id.clone(),
            correlation_id: request.correlation_id.clone(),
            success: true,
            data: Some(data),
            error: None,
            adapter_id: Some(adapter_id.to_string()),
            attempts,
            dispatched_at: Some(dispatched_at),
            completed_at,
        }
    }

    pub fn failed(
        request_id: &str,
        correlation_id: &str,
        error: ResponseError,
        attempts: u32,
        dispatched_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            correlation_id: correlation_id.to_string(),
            success: false,
            data: None,
            error: Some(error),
            adapter_id: None,
            attempts,
            dispatched_at,
            completed_at,
        }
    }

    pub fn with_adapter(mut self, adapter_id: Option<&str>) -> Self {
        self.adapter_id = adapter_id.map(str::to_string);
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
