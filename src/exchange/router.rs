use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::account_pool::{AccountPool, Admission, ManagedAdapter};
use crate::circuit_breaker::Pass;
use crate::model::{ErrorKind, Request};

/// Why no candidate passed the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoCapacityReason {
    /// At least one candidate had a passable breaker but no budget
    RateLimited,
    /// Every candidate's breaker refused, or the pool had no candidates
    CircuitOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no adapter with capacity ({reason:?}, {candidates} candidates)")]
pub struct NoCapacity {
    pub reason: NoCapacityReason,
    /// Shortest wait after which a rate-limited candidate frees a slot
    pub retry_after_ms: Option<u64>,
    pub candidates: usize,
}

impl NoCapacity {
    pub fn kind(&self) -> ErrorKind {
        match self.reason {
            NoCapacityReason::RateLimited => ErrorKind::RateLimited,
            NoCapacityReason::CircuitOpen => ErrorKind::CircuitOpen,
        }
    }
}

/// Adapter chosen for one attempt. Its rate budget is already charged and,
/// in HalfOpen, its trial slot is already claimed.
#[derive(Clone)]
pub struct RoutedAdapter {
    pub adapter: Arc<ManagedAdapter>,
    /// Rank of the adapter in the candidate list, 0 = preferred
    pub rank: usize,
    /// Trial when this call is the HalfOpen probe
    pub pass: Pass,
}

/// Walks the pool's ranked candidates and returns the first one whose
/// breaker and rate budget both admit.
pub struct SmartRouter;

impl SmartRouter {
    pub fn select(
        request: &Request,
        pool: &AccountPool,
        now_ms: u64,
    ) -> Result<RoutedAdapter, NoCapacity> {
        // Orders fail over across the whole pool; only market-data reads
        // are pinned to the symbol's owner.
        let symbol = request
            .operation
            .is_symbol_scoped()
            .then(|| request.symbol.as_deref())
            .flatten();
        let candidates = pool.select_eligible(symbol, now_ms);
        let mut rate_limited = false;
        let mut retry_after_ms: Option<u64> = None;

        for (rank, adapter) in candidates.iter().enumerate() {
            match adapter.try_admit(now_ms) {
                Admission::Admitted(pass) => {
                    debug!(
                        request_id = %request.request_id,
                        adapter_id = %adapter.adapter_id(),
                        rank,
                        "Routed"
                    );
                    return Ok(RoutedAdapter {
                        adapter: adapter.clone(),
                        rank,
                        pass,
                    });
                }
                Admission::RateLimited { retry_after_ms: wait } => {
                    rate_limited = true;
                    retry_after_ms = Some(retry_after_ms.map_or(wait, |w| w.min(wait)));
                }
                Admission::CircuitOpen => {}
            }
        }

        Err(NoCapacity {
            reason: if rate_limited {
                NoCapacityReason::RateLimited
            } else {
                NoCapacityReason::CircuitOpen
            },
            retry_after_ms,
            candidates: candidates.len(),
        })
    }
}
