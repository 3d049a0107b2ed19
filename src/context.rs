use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::time::Instant;
use uuid::Uuid;

/// Trait for providing the current time.
/// Admission gates only ever look at `monotonic_millis`; wall-clock time is
/// used for the timestamps carried on requests and responses.
pub trait TimeProvider: Send + Sync {
    /// Milliseconds on a monotonic clock. Only differences are meaningful.
    fn monotonic_millis(&self) -> u64;
    fn now(&self) -> DateTime<Utc>;
}

/// Trait for generating unique IDs.
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Context holding the providers.
/// Passed down to the pools, router and dispatch loops.
#[derive(Clone)]
pub struct GatewayContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
}

impl GatewayContext {
    pub fn new_system() -> Self {
        Self {
            time: Arc::new(SystemTimeProvider::new()),
            id: Arc::new(RandomIdProvider),
        }
    }

    pub fn new_simulated(start_time_ms: i64) -> (Self, Arc<SimulatedTimeProvider>) {
        let clock = Arc::new(SimulatedTimeProvider::new(start_time_ms));
        let ctx = Self {
            time: clock.clone(),
            id: Arc::new(DeterministicIdProvider::new()),
        };
        (ctx, clock)
    }
}

// --- Live Implementations ---

/// Monotonic millis come from `tokio::time::Instant`, so a paused tokio clock
/// in tests drives the gates as well as the timers.
pub struct SystemTimeProvider {
    origin: Instant,
}

impl SystemTimeProvider {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn monotonic_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RandomIdProvider;

impl IdProvider for RandomIdProvider {
    fn new_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

// --- Simulated Implementations ---

pub struct SimulatedTimeProvider {
    start_time_ms: i64,
    current_time_ms: AtomicI64,
}

impl SimulatedTimeProvider {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            start_time_ms,
            current_time_ms: AtomicI64::new(start_time_ms),
        }
    }

    /// Setting the clock backwards is allowed; consumers must tolerate it.
    pub fn set_time(&self, time_ms: i64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, duration_ms: i64) {
        self.current_time_ms.fetch_add(duration_ms, Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTimeProvider {
    fn monotonic_millis(&self) -> u64 {
        let elapsed = self.current_time_ms.load(Ordering::SeqCst) - self.start_time_ms;
        elapsed.max(0) as u64
    }

    fn now(&self) -> DateTime<Utc> {
        let ms = self.current_time_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or_default()
    }
}

pub struct DeterministicIdProvider {
    counter: AtomicU64,
}

impl DeterministicIdProvider {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for DeterministicIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdProvider for DeterministicIdProvider {
    fn new_id(&self) -> String {
        let num = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("00000000-0000-0000-0000-{:012x}", num)
    }
}
