use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{AdapterHealth, BreakerConfig, BreakerState, Pass};
use crate::config::{AccountConfig, BackendConfig};
use crate::error::PoolError;
use crate::exchange::adapter::{BackendAdapter, HealthHint};
use crate::metrics;
use crate::model::BackendType;
use crate::quality::ExecutionQuality;
use crate::rate_limiter::{SlidingWindowLimiter, WindowSpec};

/// Outcome of the combined breaker + limiter gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(Pass),
    CircuitOpen,
    RateLimited { retry_after_ms: u64 },
}

/// Rate and breaker state of one adapter. Guarded by a single lock so that
/// check-then-charge is atomic.
struct Gate {
    limiter: SlidingWindowLimiter,
    health: AdapterHealth,
}

/// An adapter as owned by its pool: the client plus its private gate,
/// cached balance and execution-quality history.
pub struct ManagedAdapter {
    adapter_id: String,
    backend: BackendType,
    client: Arc<dyn BackendAdapter>,
    gate: Mutex<Gate>,
    balance: RwLock<Decimal>,
    quality: Mutex<ExecutionQuality>,
    enabled: AtomicBool,
}

impl ManagedAdapter {
    pub fn new(
        adapter_id: impl Into<String>,
        client: Arc<dyn BackendAdapter>,
        windows: &[WindowSpec],
        breaker: BreakerConfig,
        quality_half_life: f64,
    ) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            backend: client.backend_type(),
            client,
            gate: Mutex::new(Gate {
                limiter: SlidingWindowLimiter::new(windows),
                health: AdapterHealth::new(breaker),
            }),
            balance: RwLock::new(Decimal::ZERO),
            quality: Mutex::new(ExecutionQuality::new(quality_half_life)),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn account_id(&self) -> &str {
        self.client.account_id()
    }

    pub fn backend(&self) -> &BackendType {
        &self.backend
    }

    pub fn client(&self) -> &Arc<dyn BackendAdapter> {
        &self.client
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(AtomicOrdering::SeqCst)
    }

    fn set_enabled_flag(&self, enabled: bool) {
        self.enabled.store(enabled, AtomicOrdering::SeqCst);
    }

    pub fn balance(&self) -> Decimal {
        *self.balance.read()
    }

    pub fn set_balance(&self, balance: Decimal) {
        *self.balance.write() = balance;
    }

    pub fn quality_score(&self) -> f64 {
        self.quality.lock().score()
    }

    pub fn breaker_state(&self, now_ms: u64) -> BreakerState {
        self.gate.lock().health.observe(now_ms)
    }

    pub fn remaining_budget(&self, now_ms: u64) -> u32 {
        self.gate.lock().limiter.remaining(now_ms)
    }

    /// Breaker first, then rate budget, under one lock. A rejection by either
    /// leaves both untouched.
    pub fn try_admit(&self, now_ms: u64) -> Admission {
        let mut gate = self.gate.lock();
        if gate.health.is_open(now_ms) {
            return Admission::CircuitOpen;
        }
        if !gate.limiter.try_acquire(now_ms) {
            return Admission::RateLimited {
                retry_after_ms: gate.limiter.retry_after_ms(now_ms),
            };
        }
        // The breaker was observed passable under this lock.
        let pass = gate.health.try_admit(now_ms).unwrap_or(Pass::Regular);
        Admission::Admitted(pass)
    }

    /// Hands back a HalfOpen trial slot claimed by `try_admit` for a call
    /// that was never made. The rate budget stays charged.
    pub fn release(&self, pass: Pass) {
        if pass == Pass::Trial {
            self.gate.lock().health.release_trial();
        }
    }

    pub fn record_success(&self, latency_ms: u64, pass: Pass) {
        self.quality.lock().record(latency_ms, true);
        let transition = self.gate.lock().health.record_success(pass);
        self.log_transition(transition);
    }

    /// Transient failure or timeout: counts toward the breaker threshold.
    pub fn record_failure(&self, now_ms: u64, latency_ms: u64, pass: Pass) {
        self.quality.lock().record(latency_ms, false);
        let transition = self.gate.lock().health.record_failure(now_ms, pass);
        self.log_transition(transition);
    }

    /// Permanent error: the venue answered, so the breaker treats the call as
    /// healthy and quality is not penalised.
    pub fn record_rejection(&self, latency_ms: u64, pass: Pass) {
        self.record_success(latency_ms, pass);
    }

    fn log_transition(&self, transition: Option<BreakerState>) {
        let Some(state) = transition else {
            return;
        };
        metrics::inc_breaker_transition(self.backend.as_str(), state.as_str());
        match state {
            BreakerState::Open => warn!(
                backend = %self.backend,
                adapter_id = %self.adapter_id,
                "Circuit breaker OPEN"
            ),
            BreakerState::Closed => info!(
                backend = %self.backend,
                adapter_id = %self.adapter_id,
                "Circuit breaker closed"
            ),
            BreakerState::HalfOpen => debug!(
                backend = %self.backend,
                adapter_id = %self.adapter_id,
                "Circuit breaker half-open"
            ),
        }
    }

    fn rank_key(&self, now_ms: u64) -> RankKey {
        let (state, remaining) = {
            let mut gate = self.gate.lock();
            (gate.health.observe(now_ms), gate.limiter.remaining(now_ms))
        };
        RankKey {
            closed: state == BreakerState::Closed,
            remaining,
            balance: self.balance(),
            quality: self.quality_score(),
        }
    }

    pub fn snapshot(&self, now_ms: u64, assigned_symbols: usize) -> AdapterSnapshot {
        let (breaker, consecutive_failures, remaining_budget) = {
            let mut gate = self.gate.lock();
            (
                gate.health.observe(now_ms),
                gate.health.consecutive_failures(),
                gate.limiter.remaining(now_ms),
            )
        };
        AdapterSnapshot {
            adapter_id: self.adapter_id.clone(),
            account_id: self.account_id().to_string(),
            enabled: self.is_enabled(),
            breaker,
            consecutive_failures,
            remaining_budget,
            balance: self.balance(),
            quality: self.quality_score(),
            assigned_symbols,
            hint: self.client.get_health_hint(),
        }
    }
}

struct RankKey {
    closed: bool,
    remaining: u32,
    balance: Decimal,
    quality: f64,
}

/// Closed breaker first, then most remaining budget, highest balance, best
/// quality; adapter id makes the order total.
fn compare_ranked(a: &(RankKey, &Arc<ManagedAdapter>), b: &(RankKey, &Arc<ManagedAdapter>)) -> Ordering {
    let (ka, ma) = a;
    let (kb, mb) = b;
    Reverse(ka.closed)
        .cmp(&Reverse(kb.closed))
        .then_with(|| kb.remaining.cmp(&ka.remaining))
        .then_with(|| kb.balance.cmp(&ka.balance))
        .then_with(|| kb.quality.total_cmp(&ka.quality))
        .then_with(|| ma.adapter_id.cmp(&mb.adapter_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PoolStatus {
    Ready,
    /// Serving, but some breaker is not Closed
    Degraded,
    /// No enabled adapter, or a symbol has no adapter
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterSnapshot {
    pub adapter_id: String,
    pub account_id: String,
    pub enabled: bool,
    pub breaker: BreakerState,
    pub consecutive_failures: u32,
    pub remaining_budget: u32,
    pub balance: Decimal,
    pub quality: f64,
    pub assigned_symbols: usize,
    pub hint: HealthHint,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub backend: BackendType,
    pub status: PoolStatus,
    pub enabled: usize,
    pub closed: usize,
    pub unassigned_symbols: Vec<String>,
    pub adapters: Vec<AdapterSnapshot>,
}

#[derive(Default)]
struct PoolInner {
    /// Registration order
    adapters: Vec<Arc<ManagedAdapter>>,
    /// symbol -> adapter_id, always pointing at an enabled adapter
    assignments: HashMap<String, String>,
    /// Symbols waiting for an enabled adapter
    unassigned: BTreeSet<String>,
}

impl PoolInner {
    fn find(&self, adapter_id: &str) -> Option<&Arc<ManagedAdapter>> {
        self.adapters.iter().find(|a| a.adapter_id == adapter_id)
    }

    fn symbol_counts(&self) -> HashMap<&str, usize> {
        let mut counts: HashMap<&str, usize> = self
            .adapters
            .iter()
            .filter(|a| a.is_enabled())
            .map(|a| (a.adapter_id.as_str(), 0))
            .collect();
        for adapter_id in self.assignments.values() {
            if let Some(count) = counts.get_mut(adapter_id.as_str()) {
                *count += 1;
            }
        }
        counts
    }

    /// Enabled adapter with the fewest symbols; ties go to the smallest id.
    fn least_loaded(&self) -> Option<String> {
        self.symbol_counts()
            .into_iter()
            .min_by(|(id_a, n_a), (id_b, n_b)| n_a.cmp(n_b).then_with(|| id_a.cmp(id_b)))
            .map(|(id, _)| id.to_string())
    }

    fn place(&mut self, symbol: String) -> bool {
        match self.least_loaded() {
            Some(adapter_id) => {
                self.unassigned.remove(&symbol);
                self.assignments.insert(symbol, adapter_id);
                true
            }
            None => {
                self.unassigned.insert(symbol);
                false
            }
        }
    }

    /// Moves every symbol owned by `adapter_id` to the remaining adapters.
    fn reshard_from(&mut self, adapter_id: &str) -> usize {
        let mut orphaned: Vec<String> = self
            .assignments
            .iter()
            .filter(|(_, owner)| owner.as_str() == adapter_id)
            .map(|(symbol, _)| symbol.clone())
            .collect();
        orphaned.sort();
        for symbol in &orphaned {
            self.assignments.remove(symbol);
        }
        let moved = orphaned.len();
        for symbol in orphaned {
            self.place(symbol);
        }
        moved
    }

    fn place_unassigned(&mut self) {
        let pending: Vec<String> = self.unassigned.iter().cloned().collect();
        for symbol in pending {
            if !self.place(symbol) {
                break;
            }
        }
    }
}

/// All adapters of one broker family, plus the symbol sharding used for
/// market-data requests.
pub struct AccountPool {
    backend: BackendType,
    windows: Vec<WindowSpec>,
    breaker: BreakerConfig,
    quality_half_life: f64,
    inner: RwLock<PoolInner>,
}

impl AccountPool {
    pub fn new(
        backend: impl Into<BackendType>,
        windows: Vec<WindowSpec>,
        breaker: BreakerConfig,
        quality_half_life: f64,
    ) -> Self {
        Self {
            backend: backend.into(),
            windows,
            breaker,
            quality_half_life,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    /// Builds a pool from its backend section. `connect` supplies the wire
    /// client for each configured account.
    pub fn from_config<F>(
        backend: impl Into<BackendType>,
        config: &BackendConfig,
        quality_half_life: f64,
        mut connect: F,
    ) -> Result<Self, PoolError>
    where
        F: FnMut(&BackendType, &AccountConfig) -> Arc<dyn BackendAdapter>,
    {
        let pool = Self::new(
            backend,
            config.effective_windows(),
            config.breaker(),
            quality_half_life,
        );
        for account in &config.accounts {
            let client = connect(&pool.backend, account);
            pool.register(&account.adapter_id, client)?;
            if !account.enabled {
                pool.set_enabled(&account.adapter_id, false)?;
            }
        }
        // Enabled owners keep their explicit symbols; a disabled owner's
        // symbols are sharded onto the rest of the pool.
        let (enabled, disabled): (Vec<&AccountConfig>, Vec<&AccountConfig>) =
            config.accounts.iter().partition(|a| a.enabled);
        for account in enabled.into_iter().chain(disabled) {
            pool.assign_symbols(&account.adapter_id, &account.symbols)?;
        }
        pool.shard_symbols(&config.symbols);

        info!(
            backend = %pool.backend,
            adapters = config.accounts.len(),
            symbols = pool.inner.read().assignments.len(),
            "Account pool initialized"
        );
        Ok(pool)
    }

    pub fn backend(&self) -> &BackendType {
        &self.backend
    }

    pub fn register(
        &self,
        adapter_id: &str,
        client: Arc<dyn BackendAdapter>,
    ) -> Result<Arc<ManagedAdapter>, PoolError> {
        let actual = client.backend_type();
        if actual != self.backend {
            return Err(PoolError::BackendMismatch {
                adapter_id: adapter_id.to_string(),
                expected: self.backend.clone(),
                actual,
            });
        }

        let mut inner = self.inner.write();
        if inner.find(adapter_id).is_some() {
            return Err(PoolError::DuplicateAdapter(adapter_id.to_string()));
        }
        let managed = Arc::new(ManagedAdapter::new(
            adapter_id,
            client,
            &self.windows,
            self.breaker,
            self.quality_half_life,
        ));
        inner.adapters.push(managed.clone());
        inner.place_unassigned();
        info!(backend = %self.backend, adapter_id, "🔌 Registered adapter");
        Ok(managed)
    }

    /// Removes an adapter for good (e.g. revoked credentials) and re-shards
    /// its symbols before returning.
    pub fn deregister(&self, adapter_id: &str) -> Result<Arc<ManagedAdapter>, PoolError> {
        let mut inner = self.inner.write();
        let idx = inner
            .adapters
            .iter()
            .position(|a| a.adapter_id == adapter_id)
            .ok_or_else(|| PoolError::UnknownAdapter(adapter_id.to_string()))?;
        let removed = inner.adapters.remove(idx);
        let moved = inner.reshard_from(adapter_id);
        info!(
            backend = %self.backend,
            adapter_id,
            resharded = moved,
            "Deregistered adapter"
        );
        self.warn_if_unavailable(&inner);
        Ok(removed)
    }

    /// Takes an adapter in or out of rotation without forgetting it.
    pub fn set_enabled(&self, adapter_id: &str, enabled: bool) -> Result<(), PoolError> {
        let mut inner = self.inner.write();
        let adapter = inner
            .find(adapter_id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownAdapter(adapter_id.to_string()))?;
        if adapter.is_enabled() == enabled {
            return Ok(());
        }
        adapter.set_enabled_flag(enabled);
        if enabled {
            inner.place_unassigned();
        } else {
            inner.reshard_from(adapter_id);
            self.warn_if_unavailable(&inner);
        }
        info!(backend = %self.backend, adapter_id, enabled, "Adapter rotation changed");
        Ok(())
    }

    /// Pins symbols to an enabled adapter.
    pub fn assign_symbols(&self, adapter_id: &str, symbols: &[String]) -> Result<(), PoolError> {
        let mut inner = self.inner.write();
        let enabled = inner
            .find(adapter_id)
            .map(|a| a.is_enabled())
            .ok_or_else(|| PoolError::UnknownAdapter(adapter_id.to_string()))?;
        for symbol in symbols {
            let symbol = normalize_symbol(symbol);
            if enabled {
                inner.unassigned.remove(&symbol);
                inner.assignments.insert(symbol, adapter_id.to_string());
            } else {
                inner.place(symbol);
            }
        }
        Ok(())
    }

    /// Spreads symbols that have no owner yet across enabled adapters.
    pub fn shard_symbols(&self, symbols: &[String]) {
        let mut inner = self.inner.write();
        for symbol in symbols {
            let symbol = normalize_symbol(symbol);
            if !inner.assignments.contains_key(&symbol) {
                inner.place(symbol);
            }
        }
        self.warn_if_unavailable(&inner);
    }

    pub fn assignment(&self, symbol: &str) -> Option<String> {
        self.inner.read().assignments.get(&normalize_symbol(symbol)).cloned()
    }

    pub fn adapter(&self, adapter_id: &str) -> Option<Arc<ManagedAdapter>> {
        self.inner.read().find(adapter_id).cloned()
    }

    pub fn adapters(&self) -> Vec<Arc<ManagedAdapter>> {
        self.inner.read().adapters.clone()
    }

    /// Candidate adapters in the order they should be tried.
    ///
    /// A symbol with an owner yields exactly that adapter. Symbol-agnostic
    /// requests, and symbols nobody owns, get every enabled adapter ranked by
    /// breaker state, remaining budget, balance and quality.
    pub fn select_eligible(&self, symbol: Option<&str>, now_ms: u64) -> Vec<Arc<ManagedAdapter>> {
        let inner = self.inner.read();
        if let Some(symbol) = symbol {
            if let Some(owner) = inner.assignments.get(&normalize_symbol(symbol)) {
                return inner.find(owner).cloned().into_iter().collect();
            }
        }

        let mut keyed: Vec<(RankKey, &Arc<ManagedAdapter>)> = inner
            .adapters
            .iter()
            .filter(|a| a.is_enabled())
            .map(|a| (a.rank_key(now_ms), a))
            .collect();
        keyed.sort_by(compare_ranked);
        keyed.into_iter().map(|(_, a)| a.clone()).collect()
    }

    pub fn health(&self, now_ms: u64) -> PoolHealth {
        let inner = self.inner.read();
        let counts = inner.symbol_counts();
        let adapters: Vec<AdapterSnapshot> = inner
            .adapters
            .iter()
            .map(|a| {
                let assigned = counts.get(a.adapter_id.as_str()).copied().unwrap_or(0);
                a.snapshot(now_ms, assigned)
            })
            .collect();
        let enabled = adapters.iter().filter(|a| a.enabled).count();
        let closed = adapters
            .iter()
            .filter(|a| a.enabled && a.breaker == BreakerState::Closed)
            .count();
        let status = if enabled == 0 || !inner.unassigned.is_empty() {
            PoolStatus::Unavailable
        } else if closed < enabled {
            PoolStatus::Degraded
        } else {
            PoolStatus::Ready
        };
        PoolHealth {
            backend: self.backend.clone(),
            status,
            enabled,
            closed,
            unassigned_symbols: inner.unassigned.iter().cloned().collect(),
            adapters,
        }
    }

    /// Refreshes every cached balance concurrently. Failures keep the stale
    /// value and do not touch the breaker.
    pub async fn refresh_balances(&self) {
        let adapters = self.adapters();
        let results = join_all(adapters.iter().map(|a| a.client().get_balance())).await;
        for (adapter, result) in adapters.iter().zip(results) {
            match result {
                Ok(balance) => {
                    debug!(
                        backend = %self.backend,
                        adapter_id = %adapter.adapter_id(),
                        available = %balance.available,
                        "Balance refreshed"
                    );
                    adapter.set_balance(balance.available);
                }
                Err(e) => warn!(
                    backend = %self.backend,
                    adapter_id = %adapter.adapter_id(),
                    "Balance refresh failed: {}",
                    e
                ),
            }
        }
    }

    fn warn_if_unavailable(&self, inner: &PoolInner) {
        let enabled = inner.adapters.iter().filter(|a| a.is_enabled()).count();
        if enabled == 0 {
            error!(backend = %self.backend, "❌ Account pool has no enabled adapters");
        } else if !inner.unassigned.is_empty() {
            error!(
                backend = %self.backend,
                unassigned = inner.unassigned.len(),
                "❌ Symbols without an adapter"
            );
        }
    }
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::simulated::SimulatedAdapter;
    use rust_decimal_macros::dec;

    fn pool() -> AccountPool {
        AccountPool::new(
            "kis",
            vec![WindowSpec::new(1000, 2)],
            BreakerConfig {
                failure_threshold: 2,
                cooldown_ms: 1000,
            },
            20.0,
        )
    }

    fn sim(account: &str) -> Arc<dyn BackendAdapter> {
        Arc::new(SimulatedAdapter::new("kis", account))
    }

    fn ids(list: &[Arc<ManagedAdapter>]) -> Vec<&str> {
        list.iter().map(|a| a.adapter_id()).collect()
    }

    #[test]
    fn test_register_rejects_duplicates_and_foreign_backends() {
        let pool = pool();
        pool.register("a", sim("1")).unwrap();
        assert_eq!(
            pool.register("a", sim("2")).err(),
            Some(PoolError::DuplicateAdapter("a".into()))
        );
        let foreign: Arc<dyn BackendAdapter> = Arc::new(SimulatedAdapter::new("bybit", "x"));
        assert!(matches!(
            pool.register("b", foreign),
            Err(PoolError::BackendMismatch { .. })
        ));
    }

    #[test]
    fn test_symbol_scoped_selection_returns_owner() {
        let pool = pool();
        pool.register("a", sim("1")).unwrap();
        pool.register("b", sim("2")).unwrap();
        pool.assign_symbols("b", &["005930".to_string()]).unwrap();

        let picked = pool.select_eligible(Some("005930"), 0);
        assert_eq!(ids(&picked), vec!["b"]);
    }

    #[test]
    fn test_ranking_prefers_closed_then_budget_then_balance() {
        let pool = pool();
        let a = pool.register("a", sim("1")).unwrap();
        let b = pool.register("b", sim("2")).unwrap();
        let c = pool.register("c", sim("3")).unwrap();
        a.set_balance(dec!(100));
        b.set_balance(dec!(500));
        c.set_balance(dec!(900));

        // c loses one unit of budget, a trips its breaker
        assert_eq!(c.try_admit(0), Admission::Admitted(Pass::Regular));
        a.record_failure(0, 10, Pass::Regular);
        a.record_failure(0, 10, Pass::Regular);

        let ranked = pool.select_eligible(None, 0);
        assert_eq!(ids(&ranked), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_ranking_uses_quality_as_last_key() {
        let pool = pool();
        let a = pool.register("a", sim("1")).unwrap();
        let b = pool.register("b", sim("2")).unwrap();
        a.record_success(2_000, Pass::Regular);
        b.record_success(20, Pass::Regular);
        assert_eq!(ids(&pool.select_eligible(None, 0)), vec!["b", "a"]);
    }

    #[test]
    fn test_ties_break_on_adapter_id() {
        let pool = pool();
        pool.register("zeta", sim("1")).unwrap();
        pool.register("alpha", sim("2")).unwrap();
        assert_eq!(ids(&pool.select_eligible(None, 0)), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_auto_sharding_balances_counts() {
        let pool = pool();
        pool.register("a", sim("1")).unwrap();
        pool.register("b", sim("2")).unwrap();
        let symbols: Vec<String> = ["S1", "S2", "S3", "S4"].iter().map(|s| s.to_string()).collect();
        pool.shard_symbols(&symbols);

        let health = pool.health(0);
        let counts: Vec<usize> = health.adapters.iter().map(|a| a.assigned_symbols).collect();
        assert_eq!(counts, vec![2, 2]);
        assert_eq!(health.status, PoolStatus::Ready);
    }

    #[test]
    fn test_deregister_reshards_symbols() {
        let pool = pool();
        pool.register("a", sim("1")).unwrap();
        pool.register("b", sim("2")).unwrap();
        pool.assign_symbols("a", &["X".to_string(), "Y".to_string()]).unwrap();

        pool.deregister("a").unwrap();
        assert_eq!(pool.assignment("X").as_deref(), Some("b"));
        assert_eq!(pool.assignment("y").as_deref(), Some("b"));
        assert_eq!(pool.health(0).status, PoolStatus::Ready);
        assert!(pool.deregister("a").is_err());
    }

    #[test]
    fn test_last_adapter_removed_makes_pool_unavailable() {
        let pool = pool();
        pool.register("a", sim("1")).unwrap();
        pool.assign_symbols("a", &["X".to_string()]).unwrap();
        pool.deregister("a").unwrap();

        let health = pool.health(0);
        assert_eq!(health.status, PoolStatus::Unavailable);
        assert_eq!(health.unassigned_symbols, vec!["X".to_string()]);

        // A new adapter picks up the orphaned symbol.
        pool.register("b", sim("2")).unwrap();
        assert_eq!(pool.assignment("X").as_deref(), Some("b"));
        assert_eq!(pool.health(0).status, PoolStatus::Ready);
    }

    #[test]
    fn test_disabled_adapter_leaves_rotation() {
        let pool = pool();
        pool.register("a", sim("1")).unwrap();
        pool.register("b", sim("2")).unwrap();
        pool.assign_symbols("a", &["X".to_string()]).unwrap();

        pool.set_enabled("a", false).unwrap();
        assert_eq!(ids(&pool.select_eligible(None, 0)), vec!["b"]);
        assert_eq!(pool.assignment("X").as_deref(), Some("b"));
    }

    #[test]
    fn test_unowned_symbol_falls_back_to_ranking() {
        let pool = pool();
        pool.register("a", sim("1")).unwrap();
        pool.register("b", sim("2")).unwrap();
        assert_eq!(pool.select_eligible(Some("NOPE"), 0).len(), 2);
    }

    #[test]
    fn test_degraded_when_breaker_not_closed() {
        let pool = pool();
        let a = pool.register("a", sim("1")).unwrap();
        pool.register("b", sim("2")).unwrap();
        a.record_failure(0, 1, Pass::Regular);
        a.record_failure(0, 1, Pass::Regular);
        let health = pool.health(10);
        assert_eq!(health.status, PoolStatus::Degraded);
        assert_eq!(health.closed, 1);
    }

    #[test]
    fn test_gate_rejects_without_charging() {
        let pool = pool();
        let a = pool.register("a", sim("1")).unwrap();
        assert_eq!(a.try_admit(0), Admission::Admitted(Pass::Regular));
        assert_eq!(a.try_admit(0), Admission::Admitted(Pass::Regular));
        assert_eq!(
            a.try_admit(400),
            Admission::RateLimited {
                retry_after_ms: 600
            }
        );
        assert_eq!(a.remaining_budget(1000), 2);

        a.record_failure(1000, 1, Pass::Regular);
        a.record_failure(1000, 1, Pass::Regular);
        assert_eq!(a.try_admit(1000), Admission::CircuitOpen);
        // Open breaker did not consume budget.
        assert_eq!(a.remaining_budget(1000), 2);
    }

    #[tokio::test]
    async fn test_refresh_balances() {
        let pool = pool();
        let client = Arc::new(SimulatedAdapter::new("kis", "1").with_balance(dec!(42)));
        let a = pool.register("a", client).unwrap();
        pool.refresh_balances().await;
        assert_eq!(a.balance(), dec!(42));
    }

    #[test]
    fn test_from_config() {
        let settings = crate::config::Settings::from_toml_str(
            r#"
            [backends.kis]
            preset = "kis"
            symbols = ["A", "B", "C"]

            [[backends.kis.accounts]]
            adapter_id = "k1"
            account_id = "1"
            symbols = ["A"]

            [[backends.kis.accounts]]
            adapter_id = "k2"
            account_id = "2"

            [[backends.kis.accounts]]
            adapter_id = "k3"
            account_id = "3"
            enabled = false
            "#,
        )
        .unwrap();
        let pool = AccountPool::from_config("kis", &settings.backends["kis"], 20.0, |backend, acct| {
            Arc::new(SimulatedAdapter::new(backend.clone(), acct.account_id.clone()))
        })
        .unwrap();

        assert_eq!(pool.adapters().len(), 3);
        assert_eq!(pool.assignment("A").as_deref(), Some("k1"));
        // B and C go to the least-loaded enabled adapters; k3 is disabled.
        assert_eq!(pool.assignment("B").as_deref(), Some("k2"));
        assert_eq!(pool.assignment("C").as_deref(), Some("k1"));
        assert_eq!(ids(&pool.select_eligible(None, 0)), vec!["k1", "k2"]);
    }

    #[test]
    fn test_from_config_disabled_owner_symbols_are_sharded() {
        let settings = crate::config::Settings::from_toml_str(
            r#"
            [backends.kis]
            preset = "kis"

            [[backends.kis.accounts]]
            adapter_id = "k1"
            account_id = "1"

            [[backends.kis.accounts]]
            adapter_id = "k2"
            account_id = "2"
            enabled = false
            symbols = ["ZZZ"]
            "#,
        )
        .unwrap();
        let connect = |backend: &BackendType, acct: &AccountConfig| -> Arc<dyn BackendAdapter> {
            Arc::new(SimulatedAdapter::new(backend.clone(), acct.account_id.clone()))
        };

        let pool = AccountPool::from_config("kis", &settings.backends["kis"], 20.0, connect).unwrap();
        assert_eq!(pool.assignment("ZZZ").as_deref(), Some("k1"));
        assert_eq!(pool.health(0).status, PoolStatus::Ready);

        // With no enabled adapter the symbol is reported, not dropped.
        let mut lone = settings.backends["kis"].clone();
        lone.accounts.retain(|a| a.adapter_id == "k2");
        let pool = AccountPool::from_config("kis", &lone, 20.0, connect).unwrap();
        let health = pool.health(0);
        assert_eq!(pool.assignment("ZZZ"), None);
        assert_eq!(health.status, PoolStatus::Unavailable);
        assert_eq!(health.unassigned_symbols, vec!["ZZZ".to_string()]);
    }
}
