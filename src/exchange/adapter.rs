use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{BackendType, ErrorKind, Operation, ResponseError};

/// Broker-agnostic failure taxonomy. Concrete clients translate their wire
/// errors into one of these so retry and breaker policy never branch on the
/// broker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("Throttled by venue")]
    Throttled { retry_after_ms: Option<u64> },
    #[error("Call timed out after {0} ms")]
    Timeout(u64),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Authentication error: {0}")]
    Auth(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Transient errors are retried and count against the circuit breaker.
    /// Permanent ones (validation, auth) point at the caller, not the venue.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Network(_)
                | BackendError::Server { .. }
                | BackendError::Throttled { .. }
                | BackendError::Timeout(_)
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BackendError::Throttled { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::Timeout(_) => ErrorKind::TimedOut,
            e if e.is_transient() => ErrorKind::BackendTransient,
            _ => ErrorKind::BackendPermanent,
        }
    }

    pub fn to_response_error(&self) -> ResponseError {
        ResponseError::new(self.kind(), self.to_string()).with_retry_after(self.retry_after_ms())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub currency: String,
    pub available: Decimal,
}

impl Balance {
    pub fn new(currency: impl Into<String>, available: Decimal) -> Self {
        Self {
            currency: currency.into(),
            available,
        }
    }
}

/// Identity of the attempt being executed. Clients may forward
/// `request_id` as an idempotency / client-order key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub request_id: String,
    pub correlation_id: String,
    pub attempt: u32,
}

/// Cheap, locally-known health signal; must not perform I/O.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthHint {
    pub latency_ms: Option<u64>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// One authenticated connection to one broker account.
///
/// The gateway treats every implementation the same way. Implementations own
/// no retry logic; retries, rate accounting and breaker accounting live in
/// the dispatcher.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Perform one API call.
    async fn execute(
        &self,
        call: &CallContext,
        operation: &Operation,
        parameters: &Map<String, Value>,
    ) -> Result<Value, BackendError>;

    /// Current account balance, used for ranking.
    async fn get_balance(&self) -> Result<Balance, BackendError>;

    fn get_health_hint(&self) -> HealthHint;

    /// Broker family this adapter talks to
    fn backend_type(&self) -> BackendType;

    /// Account identifier at the broker
    fn account_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(
            BackendError::Server {
                status: 503,
                message: "busy".into()
            }
            .is_transient()
        );
        assert!(BackendError::Timeout(500).is_transient());
        assert!(!BackendError::Rejected("bad qty".into()).is_transient());
        assert!(!BackendError::Auth("expired".into()).is_transient());
    }

    #[test]
    fn test_response_error_mapping() {
        let err = BackendError::Throttled {
            retry_after_ms: Some(1500),
        }
        .to_response_error();
        assert_eq!(err.kind, ErrorKind::BackendTransient);
        assert_eq!(err.retry_after_ms, Some(1500));

        let err = BackendError::Timeout(200).to_response_error();
        assert_eq!(err.kind, ErrorKind::TimedOut);

        let err = BackendError::Auth("revoked".into()).to_response_error();
        assert_eq!(err.kind, ErrorKind::BackendPermanent);
        assert!(err.message.contains("revoked"));
    }
}
