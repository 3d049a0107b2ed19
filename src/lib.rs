pub mod account_pool;
pub mod api;
pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod metrics;
pub mod model;
pub mod priority_queue;
pub mod quality;
pub mod rate_limiter;
