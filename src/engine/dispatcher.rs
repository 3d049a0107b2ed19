//! Per-backend dispatch partitions.
//!
//! usage:
//! let mut dispatcher = Dispatcher::new(ctx, RetryPolicy::default(), 1024);
//! dispatcher.add_pool(pool, 1024, None);
//! dispatcher.start();
//! let response = dispatcher.submit(request)?.await;
//!
//! Each backend gets its own priority queue and its own consumer loop. The
//! loop only decides; adapter calls, backoff sleeps and deadline timers run as
//! separate tasks so a slow broker never stalls the queue behind it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account_pool::{AccountPool, ManagedAdapter};
use crate::circuit_breaker::Pass;
use crate::context::GatewayContext;
use crate::engine::retry::{RetryDecision, RetryPolicy};
use crate::engine::state_machine::{RequestState, RequestStateMachine};
use crate::error::GatewayError;
use crate::exchange::adapter::{BackendError, CallContext};
use crate::exchange::router::SmartRouter;
use crate::metrics;
use crate::model::{
    BackendType, ErrorKind, Priority, Request, RequestId, Response, ResponseError, SubmitRequest,
};
use crate::priority_queue::{PriorityQueue, Queued, Rejected};

/// One logical request across all of its attempts. Resolved exactly once.
struct Job {
    origin_id: RequestId,
    correlation_id: String,
    backend: BackendType,
    current_id: Mutex<RequestId>,
    state: Mutex<RequestState>,
    responder: Mutex<Option<oneshot::Sender<Response>>>,
    cancel_requested: AtomicBool,
    retries: AtomicU32,
    dispatched_at: Mutex<Option<DateTime<Utc>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// Adapter call in flight. Whoever takes it records the call's outcome.
    executing: Mutex<Option<InFlight>>,
}

struct InFlight {
    adapter: Arc<ManagedAdapter>,
    pass: Pass,
    started: Instant,
}

impl Job {
    fn new(request: &Request, responder: oneshot::Sender<Response>) -> Self {
        Self {
            origin_id: request.request_id.clone(),
            correlation_id: request.correlation_id.clone(),
            backend: request.backend.clone(),
            current_id: Mutex::new(request.request_id.clone()),
            state: Mutex::new(RequestState::Queued),
            responder: Mutex::new(Some(responder)),
            cancel_requested: AtomicBool::new(false),
            retries: AtomicU32::new(0),
            dispatched_at: Mutex::new(None),
            watchdog: Mutex::new(None),
            executing: Mutex::new(None),
        }
    }

    fn advance(&self, next: RequestState) -> bool {
        let mut state = self.state.lock();
        match RequestStateMachine::transition(*state, next) {
            Ok(s) => {
                *state = s;
                true
            }
            Err(_) => false,
        }
    }

    fn state(&self) -> RequestState {
        *self.state.lock()
    }

    fn current_id(&self) -> RequestId {
        self.current_id.lock().clone()
    }

    fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    fn attempts(&self) -> u32 {
        self.retries() + 1
    }

    fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    fn is_resolved(&self) -> bool {
        self.responder.lock().is_none()
    }

    fn mark_dispatched(&self, at: DateTime<Utc>) {
        self.dispatched_at.lock().get_or_insert(at);
    }
}

/// Queue entry: the concrete attempt plus the logical request it belongs to.
struct Envelope {
    request: Request,
    job: Arc<Job>,
}

impl Queued for Envelope {
    fn priority(&self) -> Priority {
        self.request.priority
    }

    fn request_id(&self) -> &str {
        &self.request.request_id
    }
}

/// Caller's side of a submitted request. Resolves to the terminal `Response`.
pub struct ResponseHandle {
    request_id: RequestId,
    correlation_id: String,
    rx: oneshot::Receiver<Response>,
}

impl ResponseHandle {
    /// Id minted on submission; use it to cancel.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for ResponseHandle {
    type Output = Response;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Response> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(response)) => Poll::Ready(response),
            // Only reachable when the runtime tears down the dispatcher.
            Poll::Ready(Err(_)) => Poll::Ready(Response::failed(
                &self.request_id,
                &self.correlation_id,
                ResponseError::new(ErrorKind::Cancelled, "dispatcher dropped the request"),
                0,
                None,
                Utc::now(),
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Shared {
    ctx: GatewayContext,
    policy: RetryPolicy,
    /// Live jobs by the id returned on submission
    jobs: DashMap<RequestId, Arc<Job>>,
    outcomes: broadcast::Sender<Response>,
}

struct Partition {
    backend: BackendType,
    pool: Arc<AccountPool>,
    queue: PriorityQueue<Envelope>,
    call_timeout_ms: Option<u64>,
    shared: Arc<Shared>,
}

impl Partition {
    async fn run(self: Arc<Self>) {
        info!(backend = %self.backend, "🚀 Dispatch loop started");
        while let Some(envelope) = self.queue.next().await {
            self.publish_depth();
            self.dispatch(envelope);
        }
        info!(backend = %self.backend, "Dispatch loop stopped");
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let Envelope { request, job } = envelope;
        if job.is_resolved() {
            return;
        }
        if job.cancel_requested() {
            self.fail(&job, cancelled("cancelled by caller"), None);
            return;
        }
        if !job.advance(RequestState::Dispatching) {
            return;
        }

        let now_ms = self.shared.ctx.time.monotonic_millis();
        match SmartRouter::select(&request, &self.pool, now_ms) {
            Ok(routed) => {
                if !job.advance(RequestState::Executing) {
                    // Resolved (deadline) between dequeue and admission.
                    routed.adapter.release(routed.pass);
                    return;
                }
                *job.executing.lock() = Some(InFlight {
                    adapter: routed.adapter.clone(),
                    pass: routed.pass,
                    started: Instant::now(),
                });
                job.mark_dispatched(self.shared.ctx.time.now());
                debug!(
                    backend = %self.backend,
                    request_id = %request.request_id,
                    correlation_id = %request.correlation_id,
                    adapter_id = %routed.adapter.adapter_id(),
                    priority = %request.priority,
                    attempt = job.retries(),
                    "Dispatching"
                );
                let partition = self.clone();
                tokio::spawn(async move {
                    partition.execute(request, job, routed.adapter, routed.pass).await;
                });
            }
            Err(no_capacity) => {
                match self
                    .shared
                    .policy
                    .on_no_capacity(request.priority, job.retries(), &no_capacity)
                {
                    RetryDecision::Retry { delay_ms } => {
                        debug!(
                            backend = %self.backend,
                            request_id = %request.request_id,
                            delay_ms,
                            "No capacity, re-queueing High request"
                        );
                        self.schedule_retry(request, job, delay_ms, no_capacity.kind());
                    }
                    RetryDecision::GiveUp => {
                        let err = ResponseError::new(no_capacity.kind(), no_capacity.to_string())
                            .with_retry_after(no_capacity.retry_after_ms);
                        self.fail(&job, err, None);
                    }
                }
            }
        }
    }

    async fn execute(
        self: Arc<Self>,
        request: Request,
        job: Arc<Job>,
        adapter: Arc<ManagedAdapter>,
        pass: Pass,
    ) {
        let call = CallContext {
            request_id: request.request_id.clone(),
            correlation_id: request.correlation_id.clone(),
            attempt: job.retries(),
        };

        let started = Instant::now();
        let pending = adapter
            .client()
            .execute(&call, &request.operation, &request.parameters);
        let result = match self.call_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), pending)
                .await
                .unwrap_or_else(|_| Err(BackendError::Timeout(ms))),
            None => pending.await,
        };
        let elapsed = started.elapsed();
        let latency_ms = elapsed.as_millis() as u64;
        metrics::observe_execute_latency(self.backend.as_str(), elapsed.as_secs_f64());

        let adapter_id = adapter.adapter_id();
        if job.executing.lock().take().is_none() {
            // The deadline already charged this call as a failure.
            debug!(
                backend = %self.backend,
                request_id = %request.request_id,
                adapter_id,
                latency_ms,
                "Late adapter result after deadline discarded"
            );
            return;
        }
        match result {
            Ok(data) => {
                adapter.record_success(latency_ms, pass);
                if job.cancel_requested() {
                    self.fail(&job, cancelled("cancelled while executing"), Some(adapter_id));
                    return;
                }
                let dispatched_at = (*job.dispatched_at.lock()).unwrap_or_else(Utc::now);
                let response = Response::completed(
                    &request,
                    adapter_id,
                    data,
                    job.attempts(),
                    dispatched_at,
                    self.shared.ctx.time.now(),
                );
                self.finish(&job, response);
            }
            Err(e) => {
                if e.is_transient() {
                    adapter.record_failure(self.shared.ctx.time.monotonic_millis(), latency_ms, pass);
                } else {
                    adapter.record_rejection(latency_ms, pass);
                }
                if job.cancel_requested() {
                    self.fail(&job, cancelled("cancelled while executing"), Some(adapter_id));
                    return;
                }
                match self.shared.policy.on_backend_error(&e, job.retries()) {
                    RetryDecision::Retry { delay_ms } => {
                        warn!(
                            backend = %self.backend,
                            request_id = %request.request_id,
                            correlation_id = %request.correlation_id,
                            adapter_id,
                            delay_ms,
                            "⚠️ Transient backend failure, retrying: {}",
                            e
                        );
                        self.schedule_retry(request, job, delay_ms, e.kind());
                    }
                    RetryDecision::GiveUp => {
                        self.fail(&job, e.to_response_error(), Some(adapter_id));
                    }
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, request: Request, job: Arc<Job>, delay_ms: u64, reason: ErrorKind) {
        if !job.advance(RequestState::Retrying) {
            return;
        }
        job.retries.fetch_add(1, Ordering::SeqCst);
        metrics::inc_retries(self.backend.as_str(), reason.as_str());

        let partition = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            partition.requeue(request, job);
        });
    }

    /// Mints the next attempt under a fresh id and puts it back in its lane.
    fn requeue(&self, previous: Request, job: Arc<Job>) {
        if job.is_resolved() {
            return;
        }
        if job.cancel_requested() {
            self.fail(&job, cancelled("cancelled by caller"), None);
            return;
        }
        let retry = previous.retry(self.shared.ctx.id.new_id(), self.shared.ctx.time.now());
        *job.current_id.lock() = retry.request_id.clone();
        if !job.advance(RequestState::Queued) {
            return;
        }
        match self.queue.enqueue(Envelope {
            request: retry,
            job: job.clone(),
        }) {
            Ok(_) => self.publish_depth(),
            Err(Rejected::QueueFull { priority, .. }) => {
                let err = ResponseError::new(
                    ErrorKind::QueueFull,
                    format!("{} queue full on retry", priority),
                );
                self.fail(&job, err, None);
            }
            Err(Rejected::Closed) => {
                self.fail(&job, cancelled("gateway shutting down"), None);
            }
        }
    }

    fn arm_deadline(self: &Arc<Self>, job: &Arc<Job>, timeout_ms: u64) {
        let partition = self.clone();
        let watched = job.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            partition.queue.remove(&watched.current_id());
            let err = ResponseError::new(
                ErrorKind::TimedOut,
                format!("deadline of {} ms exceeded", timeout_ms),
            );
            let in_flight = watched.executing.lock().take();
            let adapter_id = in_flight.as_ref().map(|f| f.adapter.adapter_id().to_string());
            if partition.fail(&watched, err, adapter_id.as_deref()) {
                partition.publish_depth();
            }
            // A call still running at the deadline counts against its adapter.
            if let Some(f) = in_flight {
                let latency_ms = f.started.elapsed().as_millis() as u64;
                f.adapter.record_failure(
                    partition.shared.ctx.time.monotonic_millis(),
                    latency_ms,
                    f.pass,
                );
            }
        });
        *job.watchdog.lock() = Some(handle);
        if job.is_resolved() {
            if let Some(handle) = job.watchdog.lock().take() {
                handle.abort();
            }
        }
    }

    fn fail(&self, job: &Job, error: ResponseError, adapter_id: Option<&str>) -> bool {
        let dispatched_at = *job.dispatched_at.lock();
        let response = Response::failed(
            &job.current_id(),
            &job.correlation_id,
            error,
            job.attempts(),
            dispatched_at,
            self.shared.ctx.time.now(),
        )
        .with_adapter(adapter_id);
        self.finish(job, response)
    }

    /// Delivers the terminal response. Returns false when the job was
    /// already resolved, in which case `response` is discarded.
    fn finish(&self, job: &Job, response: Response) -> bool {
        let Some(responder) = job.responder.lock().take() else {
            return false;
        };
        *job.state.lock() = if response.success {
            RequestState::Completed
        } else {
            RequestState::Failed
        };
        self.shared.jobs.remove(&job.origin_id);
        if let Some(watchdog) = job.watchdog.lock().take() {
            watchdog.abort();
        }

        let outcome = response.error_kind().map_or("ok", ErrorKind::as_str);
        metrics::inc_completed(self.backend.as_str(), outcome);
        match &response.error {
            None => debug!(
                backend = %self.backend,
                request_id = %response.request_id,
                correlation_id = %response.correlation_id,
                attempts = response.attempts,
                "Request completed"
            ),
            Some(err) if err.kind == ErrorKind::Cancelled => info!(
                backend = %self.backend,
                request_id = %response.request_id,
                correlation_id = %response.correlation_id,
                "Request cancelled: {}",
                err.message
            ),
            Some(err) => warn!(
                backend = %self.backend,
                request_id = %response.request_id,
                correlation_id = %response.correlation_id,
                kind = %err.kind,
                attempts = response.attempts,
                "❌ Request failed: {}",
                err.message
            ),
        }

        // No subscribers is fine.
        let _ = self.shared.outcomes.send(response.clone());
        let _ = responder.send(response);
        true
    }

    fn publish_depth(&self) {
        for priority in Priority::ALL {
            metrics::set_queue_depth(
                self.backend.as_str(),
                priority.as_str(),
                self.queue.len_of(priority) as i64,
            );
        }
    }
}

fn cancelled(message: &str) -> ResponseError {
    ResponseError::new(ErrorKind::Cancelled, message)
}

/// All dispatch partitions, one per backend.
pub struct Dispatcher {
    shared: Arc<Shared>,
    partitions: HashMap<BackendType, Arc<Partition>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(ctx: GatewayContext, policy: RetryPolicy, outcome_capacity: usize) -> Self {
        let (outcomes, _) = broadcast::channel(outcome_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                ctx,
                policy,
                jobs: DashMap::new(),
                outcomes,
            }),
            partitions: HashMap::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Adds the partition for `pool.backend()`, replacing any previous one.
    pub fn add_pool(
        &mut self,
        pool: Arc<AccountPool>,
        queue_capacity_per_class: usize,
        call_timeout_ms: Option<u64>,
    ) {
        let backend = pool.backend().clone();
        let partition = Arc::new(Partition {
            backend: backend.clone(),
            pool,
            queue: PriorityQueue::new(queue_capacity_per_class),
            call_timeout_ms,
            shared: self.shared.clone(),
        });
        self.partitions.insert(backend, partition);
    }

    /// Spawns one consumer loop per partition. Must run inside a tokio
    /// runtime; calling it twice is a no-op.
    pub fn start(&self) {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }
        for partition in self.partitions.values() {
            loops.push(tokio::spawn(partition.clone().run()));
        }
    }

    pub fn submit(&self, submit: SubmitRequest) -> Result<ResponseHandle, GatewayError> {
        submit.validate().map_err(GatewayError::InvalidRequest)?;
        let partition = self.partitions.get(&submit.backend).cloned().ok_or_else(|| {
            GatewayError::InvalidRequest(format!("unknown backend '{}'", submit.backend))
        })?;
        if partition.queue.is_closed() {
            return Err(GatewayError::ShuttingDown);
        }

        let ctx = &self.shared.ctx;
        let request = Request::mint(submit, ctx.id.new_id(), ctx.time.now());
        let (tx, rx) = oneshot::channel();
        let job = Arc::new(Job::new(&request, tx));
        let request_id = request.request_id.clone();
        let correlation_id = request.correlation_id.clone();
        let priority = request.priority;
        let timeout_ms = request.timeout_ms;

        self.shared.jobs.insert(request_id.clone(), job.clone());
        match partition.queue.enqueue(Envelope {
            request,
            job: job.clone(),
        }) {
            Ok(ticket) => debug!(
                backend = %partition.backend,
                request_id = %request_id,
                correlation_id = %correlation_id,
                priority = %priority,
                position = ticket.position,
                "Request queued"
            ),
            Err(rejected) => {
                self.shared.jobs.remove(&request_id);
                warn!(
                    backend = %partition.backend,
                    correlation_id = %correlation_id,
                    "Submission rejected: {}",
                    rejected
                );
                return Err(match rejected {
                    Rejected::QueueFull { priority, .. } => GatewayError::QueueFull {
                        backend: partition.backend.clone(),
                        priority,
                    },
                    Rejected::Closed => GatewayError::ShuttingDown,
                });
            }
        }

        metrics::inc_submitted(partition.backend.as_str(), priority.as_str());
        partition.publish_depth();
        if let Some(ms) = timeout_ms {
            partition.arm_deadline(&job, ms);
        }

        Ok(ResponseHandle {
            request_id,
            correlation_id,
            rx,
        })
    }

    /// Cancels by the id returned on submission. A queued or backing-off
    /// request resolves `Cancelled` immediately; an executing one is allowed
    /// to finish and its result is discarded. Returns false for unknown or
    /// already-resolved ids.
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(job) = self.shared.jobs.get(request_id).map(|entry| entry.value().clone()) else {
            return false;
        };
        job.cancel_requested.store(true, Ordering::SeqCst);
        let Some(partition) = self.partitions.get(&job.backend) else {
            return false;
        };
        match job.state() {
            RequestState::Queued | RequestState::Retrying => {
                partition.queue.remove(&job.current_id());
                partition.fail(&job, cancelled("cancelled by caller"), None);
                partition.publish_depth();
            }
            state => debug!(
                request_id,
                state = %state,
                "Cancellation recorded; in-flight result will be discarded"
            ),
        }
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Response> {
        self.shared.outcomes.subscribe()
    }

    pub fn pool(&self, backend: &BackendType) -> Option<Arc<AccountPool>> {
        self.partitions.get(backend).map(|p| p.pool.clone())
    }

    pub fn pools(&self) -> Vec<Arc<AccountPool>> {
        let mut pools: Vec<Arc<AccountPool>> =
            self.partitions.values().map(|p| p.pool.clone()).collect();
        pools.sort_by(|a, b| a.backend().cmp(b.backend()));
        pools
    }

    pub fn queue_len(&self, backend: &BackendType) -> usize {
        self.partitions.get(backend).map_or(0, |p| p.queue.len())
    }

    /// Requests not yet resolved, across all partitions.
    pub fn in_flight(&self) -> usize {
        self.shared.jobs.len()
    }

    pub fn context(&self) -> &GatewayContext {
        &self.shared.ctx
    }

    /// Closes every queue, resolves queued and backing-off requests as
    /// `Cancelled` and waits for the loops to exit. Executing calls finish
    /// normally.
    pub async fn shutdown(&self) {
        for partition in self.partitions.values() {
            let drained = partition.queue.close();
            let count = drained.len();
            for envelope in drained {
                partition.fail(&envelope.job, cancelled("gateway shutting down"), None);
            }
            partition.publish_depth();
            info!(backend = %partition.backend, drained = count, "Queue closed");
        }

        let waiting: Vec<Arc<Job>> = self
            .shared
            .jobs
            .iter()
            .filter(|entry| entry.value().state() == RequestState::Retrying)
            .map(|entry| entry.value().clone())
            .collect();
        for job in waiting {
            if let Some(partition) = self.partitions.get(&job.backend) {
                partition.fail(&job, cancelled("gateway shutting down"), None);
            }
        }

        let loops = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            let _ = handle.await;
        }
        info!("🛑 Dispatcher stopped");
    }
}
