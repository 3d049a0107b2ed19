use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::account_pool::{AccountPool, PoolHealth};
use crate::config::{AccountConfig, DispatcherConfig, Settings};
use crate::context::GatewayContext;
use crate::engine::dispatcher::{Dispatcher, ResponseHandle};
use crate::engine::retry::RetryPolicy;
use crate::error::GatewayError;
use crate::exchange::adapter::BackendAdapter;
use crate::model::{BackendType, Response, ResponseError, SubmitRequest};

/// Assembles a `Gateway` from hand-built pools. `Gateway::from_settings`
/// covers the configured case.
pub struct GatewayBuilder {
    ctx: GatewayContext,
    config: DispatcherConfig,
    pools: Vec<(Arc<AccountPool>, Option<u64>)>,
}

impl GatewayBuilder {
    pub fn new(ctx: GatewayContext) -> Self {
        Self {
            ctx,
            config: DispatcherConfig::default(),
            pools: Vec::new(),
        }
    }

    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pool(mut self, pool: Arc<AccountPool>) -> Self {
        self.pools.push((pool, None));
        self
    }

    /// Adds a pool whose adapter calls are abandoned after `call_timeout_ms`.
    pub fn pool_with_call_timeout(mut self, pool: Arc<AccountPool>, call_timeout_ms: u64) -> Self {
        self.pools.push((pool, Some(call_timeout_ms)));
        self
    }

    pub fn build(self) -> Gateway {
        let mut dispatcher = Dispatcher::new(
            self.ctx,
            RetryPolicy::from(&self.config),
            self.config.outcome_channel_capacity,
        );
        for (pool, call_timeout_ms) in self.pools {
            dispatcher.add_pool(pool, self.config.queue_capacity_per_class, call_timeout_ms);
        }
        Gateway {
            dispatcher,
            balance_refresh: Duration::from_millis(self.config.balance_refresh_ms),
            background: Mutex::new(Vec::new()),
        }
    }
}

/// Entry point for upstream producers.
pub struct Gateway {
    dispatcher: Dispatcher,
    balance_refresh: Duration,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn builder(ctx: GatewayContext) -> GatewayBuilder {
        GatewayBuilder::new(ctx)
    }

    /// Validates `settings` and builds one pool per configured backend.
    /// `connect` supplies the wire client for each account.
    pub fn from_settings<F>(
        settings: &Settings,
        ctx: GatewayContext,
        mut connect: F,
    ) -> Result<Self, GatewayError>
    where
        F: FnMut(&BackendType, &AccountConfig) -> Arc<dyn BackendAdapter>,
    {
        settings.validate()?;

        let mut names: Vec<&String> = settings.backends.keys().collect();
        names.sort();

        let mut builder = Gateway::builder(ctx).dispatcher_config(settings.dispatcher.clone());
        for name in names {
            let backend = &settings.backends[name];
            let pool = Arc::new(AccountPool::from_config(
                name.as_str(),
                backend,
                settings.dispatcher.quality_half_life,
                &mut connect,
            )?);
            builder = match backend.call_timeout_ms {
                Some(ms) => builder.pool_with_call_timeout(pool, ms),
                None => builder.pool(pool),
            };
        }
        Ok(builder.build())
    }

    /// Starts the dispatch loops and the balance refresher.
    pub fn start(&self) {
        self.dispatcher.start();

        let mut background = self.background.lock();
        if !background.is_empty() || self.balance_refresh.is_zero() {
            return;
        }
        let pools = self.dispatcher.pools();
        let period = self.balance_refresh;
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                join_all(pools.iter().map(|pool| pool.refresh_balances())).await;
            }
        }));
        info!(period_ms = period.as_millis() as u64, "Balance refresh scheduled");
    }

    /// Queues a request. Fails fast on malformed input, unknown backends and
    /// full queues; everything after admission arrives through the handle.
    pub fn submit(&self, request: SubmitRequest) -> Result<ResponseHandle, GatewayError> {
        self.dispatcher.submit(request)
    }

    /// `submit` and wait, with submission errors folded into the response.
    pub async fn call(&self, request: SubmitRequest) -> Response {
        let correlation_id = request.correlation_id.clone();
        match self.submit(request) {
            Ok(handle) => handle.await,
            Err(e) => {
                let ctx = self.dispatcher.context();
                Response::failed(
                    &ctx.id.new_id(),
                    &correlation_id,
                    ResponseError::new(e.kind(), e.to_string()),
                    0,
                    None,
                    ctx.time.now(),
                )
            }
        }
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        self.dispatcher.cancel(request_id)
    }

    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<Response> {
        self.dispatcher.subscribe()
    }

    pub fn pool(&self, backend: &BackendType) -> Option<Arc<AccountPool>> {
        self.dispatcher.pool(backend)
    }

    pub fn pool_health(&self) -> Vec<PoolHealth> {
        let now_ms = self.dispatcher.context().time.monotonic_millis();
        self.dispatcher
            .pools()
            .iter()
            .map(|pool| pool.health(now_ms))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub async fn refresh_balances(&self) {
        let pools = self.dispatcher.pools();
        join_all(pools.iter().map(|pool| pool.refresh_balances())).await;
    }

    pub async fn shutdown(&self) {
        let background = std::mem::take(&mut *self.background.lock());
        for handle in background {
            handle.abort();
        }
        self.dispatcher.shutdown().await;
        if self.in_flight() > 0 {
            warn!(in_flight = self.in_flight(), "Shutdown with calls still executing");
        }
    }
}
