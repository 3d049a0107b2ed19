//! Rate Conformance Tests
//!
//! Drives a burst of High requests through the gateway against an adapter
//! governed by stacked windows and checks the trace of actual adapter calls:
//! no sliding interval of any window's length holds more calls than its
//! capacity.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::time::Instant;

use titan_gateway_rs::account_pool::AccountPool;
use titan_gateway_rs::circuit_breaker::BreakerConfig;
use titan_gateway_rs::config::DispatcherConfig;
use titan_gateway_rs::context::GatewayContext;
use titan_gateway_rs::exchange::adapter::{
    BackendAdapter, BackendError, Balance, CallContext, HealthHint,
};
use titan_gateway_rs::gateway::Gateway;
use titan_gateway_rs::model::{BackendType, Operation, SubmitRequest};
use titan_gateway_rs::rate_limiter::WindowSpec;

/// Records the virtual time of every call it receives.
struct RecordingAdapter {
    origin: Instant,
    calls: Mutex<Vec<u64>>,
}

#[async_trait]
impl BackendAdapter for RecordingAdapter {
    async fn execute(
        &self,
        call: &CallContext,
        _operation: &Operation,
        _parameters: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        let at = self.origin.elapsed().as_millis() as u64;
        self.calls.lock().push(at);
        Ok(json!({ "id": call.request_id }))
    }

    async fn get_balance(&self) -> Result<Balance, BackendError> {
        Ok(Balance::new("KRW", dec!(1_000_000)))
    }

    fn get_health_hint(&self) -> HealthHint {
        HealthHint::default()
    }

    fn backend_type(&self) -> BackendType {
        BackendType::new("kis")
    }

    fn account_id(&self) -> &str {
        "recorder"
    }
}

fn assert_conforms(trace: &[u64], spec: WindowSpec) {
    for (i, &end) in trace.iter().enumerate() {
        let inside = trace[..=i]
            .iter()
            .filter(|&&t| end - t < spec.window_ms)
            .count();
        assert!(
            inside <= spec.capacity as usize,
            "{} calls within {} ms ending at {}",
            inside,
            spec.window_ms,
            end
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_burst_respects_stacked_windows() {
    let windows = [WindowSpec::new(1_000, 5), WindowSpec::new(5_000, 12)];
    let origin = Instant::now();
    let client = Arc::new(RecordingAdapter {
        origin,
        calls: Mutex::new(Vec::new()),
    });

    let pool = AccountPool::new("kis", windows.to_vec(), BreakerConfig::default(), 20.0);
    pool.register("rec", client.clone()).unwrap();
    let gateway = Gateway::builder(GatewayContext::new_system())
        .dispatcher_config(DispatcherConfig {
            max_retries: 50,
            backoff_base_ms: 10,
            backoff_max_ms: 200,
            ..DispatcherConfig::default()
        })
        .pool(Arc::new(pool))
        .build();
    gateway.start();

    let handles: Vec<_> = (0..30)
        .map(|i| {
            gateway
                .submit(SubmitRequest::new(format!("burst-{i}"), "kis", Operation::PlaceOrder))
                .unwrap()
        })
        .collect();
    let mut succeeded = 0;
    for handle in handles {
        if handle.await.success {
            succeeded += 1;
        }
    }

    let trace = client.calls.lock().clone();
    assert_eq!(trace.len(), succeeded);
    assert!(succeeded >= 12, "only {succeeded} admitted");
    for spec in windows {
        assert_conforms(&trace, spec);
    }
    println!("✅ {} calls, all windows respected", trace.len());
}
