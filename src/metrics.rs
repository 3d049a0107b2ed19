use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};

// --- Admission ---

pub static REQUESTS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "titan_gateway_requests_submitted_total",
        "Requests accepted into a dispatch queue",
        &["backend", "priority"]
    )
    .expect("requests_submitted counter")
});

pub static REQUESTS_COMPLETED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "titan_gateway_requests_completed_total",
        "Terminal responses by outcome (ok or error kind)",
        &["backend", "outcome"]
    )
    .expect("requests_completed counter")
});

pub static RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "titan_gateway_retries_total",
        "Retry attempts scheduled by the dispatcher",
        &["backend", "reason"]
    )
    .expect("retries counter")
});

pub static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "titan_gateway_queue_depth",
        "Requests waiting per backend and priority class",
        &["backend", "priority"]
    )
    .expect("queue_depth gauge")
});

// --- Backends ---

pub static EXECUTE_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "titan_gateway_execute_latency_seconds",
        "Adapter execute() latency",
        &["backend"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("execute_latency histogram")
});

pub static BREAKER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "titan_gateway_breaker_transitions_total",
        "Circuit breaker transitions by target state",
        &["backend", "state"]
    )
    .expect("breaker_transitions counter")
});

pub fn inc_submitted(backend: &str, priority: &str) {
    REQUESTS_SUBMITTED.with_label_values(&[backend, priority]).inc();
}

pub fn inc_completed(backend: &str, outcome: &str) {
    REQUESTS_COMPLETED.with_label_values(&[backend, outcome]).inc();
}

pub fn inc_retries(backend: &str, reason: &str) {
    RETRIES.with_label_values(&[backend, reason]).inc();
}

pub fn set_queue_depth(backend: &str, priority: &str, depth: i64) {
    QUEUE_DEPTH.with_label_values(&[backend, priority]).set(depth);
}

pub fn observe_execute_latency(backend: &str, duration_sec: f64) {
    EXECUTE_LATENCY.with_label_values(&[backend]).observe(duration_sec);
}

pub fn inc_breaker_transition(backend: &str, state: &str) {
    BREAKER_TRANSITIONS.with_label_values(&[backend, state]).inc();
}

/// Text exposition of the default registry.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
