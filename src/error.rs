use thiserror::Error;

use crate::config::ConfigValidationError;
use crate::model::{BackendType, ErrorKind, Priority};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("adapter '{0}' is already registered")]
    DuplicateAdapter(String),
    #[error("adapter '{0}' is not registered")]
    UnknownAdapter(String),
    #[error("adapter '{adapter_id}' belongs to backend '{actual}', not '{expected}'")]
    BackendMismatch {
        adapter_id: String,
        expected: BackendType,
        actual: BackendType,
    },
}

/// Failures surfaced synchronously by the gateway: submission rejections and
/// wiring errors. Everything after admission is reported as a `Response`.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Queue full for backend '{backend}' at {priority} priority")]
    QueueFull {
        backend: BackendType,
        priority: Priority,
    },
    #[error("Gateway is shutting down")]
    ShuttingDown,
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigValidationError),
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),
}

impl GatewayError {
    /// Kind reported when the rejection is folded into a `Response`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::QueueFull { .. } => ErrorKind::QueueFull,
            GatewayError::ShuttingDown => ErrorKind::Cancelled,
            _ => ErrorKind::InvalidRequest,
        }
    }
}
