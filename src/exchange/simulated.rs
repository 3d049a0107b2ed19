use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::exchange::adapter::{BackendAdapter, BackendError, Balance, CallContext, HealthHint};
use crate::model::{BackendType, Operation};

/// In-process paper account.
///
/// Echoes requests back as successful results unless scripted otherwise.
/// Used by the binary when no live client is wired for a backend, and by
/// tests to script latency and failures.
pub struct SimulatedAdapter {
    backend: BackendType,
    account_id: String,
    currency: String,
    balance: Mutex<Decimal>,
    latency: Mutex<Duration>,
    failure_rate: Mutex<f64>,
    script: Mutex<VecDeque<Result<Value, BackendError>>>,
    calls: AtomicU64,
    seen: Mutex<Vec<String>>,
    hint: Mutex<HealthHint>,
}

impl SimulatedAdapter {
    pub fn new(backend: impl Into<BackendType>, account_id: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            account_id: account_id.into(),
            currency: "USD".to_string(),
            balance: Mutex::new(Decimal::ZERO),
            latency: Mutex::new(Duration::ZERO),
            failure_rate: Mutex::new(0.0),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
            seen: Mutex::new(Vec::new()),
            hint: Mutex::new(HealthHint::default()),
        }
    }

    pub fn with_balance(self, balance: Decimal) -> Self {
        *self.balance.lock() = balance;
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Probability in `[0, 1]` that an unscripted call fails with a network
    /// error.
    pub fn with_failure_rate(self, rate: f64) -> Self {
        *self.failure_rate.lock() = rate.clamp(0.0, 1.0);
        self
    }

    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.lock() = balance;
    }

    /// Queue the outcome of the next unscripted call.
    pub fn push_outcome(&self, outcome: Result<Value, BackendError>) {
        self.script.lock().push_back(outcome);
    }

    pub fn push_failures(&self, error: BackendError, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(Err(error.clone()));
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Request ids in the order they reached `execute`.
    pub fn seen_request_ids(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    fn next_outcome(
        &self,
        call: &CallContext,
        operation: &Operation,
        parameters: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        if let Some(scripted) = self.script.lock().pop_front() {
            return scripted;
        }
        let rate = *self.failure_rate.lock();
        if rate > 0.0 && rand::thread_rng().gen_bool(rate) {
            return Err(BackendError::Network("simulated connection reset".to_string()));
        }
        Ok(json!({
            "account_id": self.account_id,
            "operation": operation.name(),
            "client_order_id": call.request_id,
            "echo": parameters,
        }))
    }
}

#[async_trait]
impl BackendAdapter for SimulatedAdapter {
    async fn execute(
        &self,
        call: &CallContext,
        operation: &Operation,
        parameters: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(call.request_id.clone());

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let outcome = self.next_outcome(call, operation, parameters);
        debug!(
            account_id = %self.account_id,
            request_id = %call.request_id,
            ok = outcome.is_ok(),
            "simulated call"
        );

        let mut hint = self.hint.lock();
        hint.latency_ms = Some(latency.as_millis() as u64);
        if outcome.is_ok() {
            hint.last_success_at = Some(Utc::now());
        }
        outcome
    }

    async fn get_balance(&self) -> Result<Balance, BackendError> {
        Ok(Balance::new(self.currency.clone(), *self.balance.lock()))
    }

    fn get_health_hint(&self) -> HealthHint {
        self.hint.lock().clone()
    }

    fn backend_type(&self) -> BackendType {
        self.backend.clone()
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }
}
