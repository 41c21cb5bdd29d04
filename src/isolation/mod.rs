//! Worker pool and request/response dispatch across the isolation boundary.
//!
//! The manager owns every worker and every pending request. Workers are
//! reached only through encoded `WorkerMessage` envelopes; a router task
//! per worker reads replies, resolves pending requests by id and turns a
//! closed reply channel into a crash.

pub mod protocol;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capabilities::PluginCapabilities;
use crate::context::{HostApi, PluginMetrics};
use crate::error::{SandboxError, SandboxResult};
use crate::runtime::PluginRuntime;
use crate::security::{
    EnforcementMode, RiskLevel, RuntimeMetrics, ScriptLanguage, SecurityPolicy,
    SecurityPolicyOptions,
};
use protocol::{ExecuteRequest, WorkerMessage, READY_ID};
use worker::WorkerInit;

/// Lifecycle event buffer before slow listeners start lagging.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_execution_time_ms: u64,
    pub max_workers: usize,
    /// Strips external HTTP and `system.network` from worker grants.
    pub enable_network_isolation: bool,
    /// Strips declared read/write roots from worker grants; temp stays.
    pub enable_file_system_isolation: bool,
    pub health_check_timeout_ms: u64,
    pub spawn_timeout_ms: u64,
    /// Host-side timeouts in a row before a worker is retired. 0 disables.
    pub max_consecutive_timeouts: u32,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 128,
            max_cpu_percent: 50.0,
            max_execution_time_ms: 5_000,
            max_workers: 8,
            enable_network_isolation: false,
            enable_file_system_isolation: false,
            health_check_timeout_ms: 1_000,
            spawn_timeout_ms: 5_000,
            max_consecutive_timeouts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Spawning,
    Idle,
    Executing,
    Crashed,
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerMetrics {
    pub total_executions: u64,
    pub total_errors: u64,
    /// Milliseconds.
    pub average_execution_time: f64,
    /// Bytes, as last reported by the worker's plugin context.
    pub memory_usage: u64,
    /// Percent, as last reported by the worker's plugin context.
    pub cpu_usage: f64,
}

impl WorkerMetrics {
    fn record(&mut self, elapsed: Duration, failed: bool) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let n = self.total_executions as f64;
        self.average_execution_time = (self.average_execution_time * n + ms) / (n + 1.0);
        self.total_executions += 1;
        if failed {
            self.total_errors += 1;
        }
    }
}

/// Audit events, published on `subscribe_events`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum WorkerEvent {
    Spawned { worker_id: String, plugin_id: String },
    Crashed { worker_id: String, plugin_id: String, reason: String },
    Terminated { worker_id: String, plugin_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Falls back to `IsolationConfig::max_execution_time_ms`.
    pub timeout: Option<Duration>,
    pub language: ScriptLanguage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    pub result: Value,
    pub metrics: RuntimeMetrics,
    /// Post-execution ceiling breaches; the result is still returned.
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub unhealthy: usize,
    pub unhealthy_workers: Vec<String>,
}

// ── Pool state ────────────────────────────────────────────

struct Completion {
    result: SandboxResult<Value>,
    plugin_metrics: Option<PluginMetrics>,
    elapsed: Duration,
}

struct Pending {
    reply: oneshot::Sender<Completion>,
    started: Instant,
    /// Health probes stay out of the metrics.
    probe: bool,
    plugin_metrics: Option<PluginMetrics>,
}

struct PluginWorker {
    id: String,
    plugin_id: String,
    capabilities: PluginCapabilities,
    state: WorkerState,
    commands: mpsc::UnboundedSender<String>,
    active_requests: HashMap<String, Pending>,
    metrics: WorkerMetrics,
    consecutive_timeouts: u32,
    last_used: Instant,
}

impl PluginWorker {
    fn accepts_work(&self) -> bool {
        matches!(
            self.state,
            WorkerState::Spawning | WorkerState::Idle | WorkerState::Executing
        )
    }

    /// Rejects every pending request. Returns how many there were.
    fn drain(&mut self, error: impl Fn() -> SandboxError) -> usize {
        let pending = std::mem::take(&mut self.active_requests);
        let count = pending.len();
        for (_, p) in pending {
            let _ = p.reply.send(Completion {
                result: Err(error()),
                plugin_metrics: None,
                elapsed: p.started.elapsed(),
            });
        }
        count
    }

    fn settle(&mut self) {
        if self.state == WorkerState::Executing && self.active_requests.is_empty() {
            self.state = WorkerState::Idle;
        }
    }
}

/// A plugin's current worker and the grant it runs with.
struct Assignment {
    worker_id: Option<String>,
    capabilities: PluginCapabilities,
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<String, PluginWorker>,
    assignments: HashMap<String, Assignment>,
    /// Crashed worker id → plugin id, reported until the plugin respawns.
    crashed: HashMap<String, String>,
}

impl PoolState {
    fn remove_worker(&mut self, worker_id: &str, reason: &str) -> Option<PluginWorker> {
        let mut worker = self.workers.remove(worker_id)?;
        worker.state = WorkerState::Terminated;
        let drained = worker.drain(|| SandboxError::Shutdown(reason.to_string()));
        if drained > 0 {
            debug!("Rejected {drained} pending request(s) on {worker_id}: {reason}");
        }
        self.unassign(&worker.plugin_id, worker_id);
        Some(worker)
    }

    fn unassign(&mut self, plugin_id: &str, worker_id: &str) {
        if let Some(assignment) = self.assignments.get_mut(plugin_id) {
            if assignment.worker_id.as_deref() == Some(worker_id) {
                assignment.worker_id = None;
            }
        }
    }

    /// Least recently used worker with nothing in flight.
    fn idle_lru(&self) -> Option<String> {
        self.workers
            .values()
            .filter(|w| w.state == WorkerState::Idle && w.active_requests.is_empty())
            .min_by_key(|w| w.last_used)
            .map(|w| w.id.clone())
    }
}

struct Shared {
    config: IsolationConfig,
    host: Arc<dyn HostApi>,
    plugin_runtime: Arc<dyn PluginRuntime>,
    policy: RwLock<Arc<SecurityPolicy>>,
    pool: Mutex<PoolState>,
    events: Mutex<Option<broadcast::Sender<WorkerEvent>>>,
    disposed: AtomicBool,
}

impl Shared {
    fn pool(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: WorkerEvent) {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // No listeners is fine.
            let _ = tx.send(event);
        }
    }

    fn announce_terminated(&self, worker: PluginWorker) {
        info!("Terminated worker {} (plugin {})", worker.id, worker.plugin_id);
        self.emit(WorkerEvent::Terminated {
            worker_id: worker.id.clone(),
            plugin_id: worker.plugin_id.clone(),
        });
        // Dropping the command sender stops the worker thread.
        drop(worker);
    }
}

// ── Manager ───────────────────────────────────────────────

/// Handle to a worker pool. Clones share the same pool.
#[derive(Clone)]
pub struct IsolationManager {
    shared: Arc<Shared>,
}

impl IsolationManager {
    pub fn new(
        config: IsolationConfig,
        policy: SecurityPolicy,
        host: Arc<dyn HostApi>,
        plugin_runtime: Arc<dyn PluginRuntime>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                host,
                plugin_runtime,
                policy: RwLock::new(Arc::new(policy)),
                pool: Mutex::new(PoolState::default()),
                events: Mutex::new(Some(events)),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.shared.config
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> Arc<SecurityPolicy> {
        self.shared
            .policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in a policy built from `options`. In-flight scans keep the
    /// snapshot they started with.
    pub fn update_policy(&self, options: SecurityPolicyOptions) {
        let policy = Arc::new(SecurityPolicy::new(options));
        *self
            .shared
            .policy
            .write()
            .unwrap_or_else(PoisonError::into_inner) = policy;
        info!("Security policy updated");
    }

    /// Lifecycle events. The stream ends once the manager is disposed.
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        let events = self.shared.events.lock().unwrap_or_else(PoisonError::into_inner);
        match events.as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn ensure_running(&self) -> SandboxResult<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            Err(SandboxError::Shutdown("isolation manager disposed".into()))
        } else {
            Ok(())
        }
    }

    /// Narrows a grant by the process-wide isolation toggles.
    fn isolate(&self, mut capabilities: PluginCapabilities) -> PluginCapabilities {
        let config = &self.shared.config;
        if config.enable_network_isolation {
            if let Some(http) = capabilities.http.as_mut() {
                http.external = false;
                http.allowed_domains.clear();
            }
            if let Some(system) = capabilities.system.as_mut() {
                system.network = false;
            }
        }
        if config.enable_file_system_isolation {
            if let Some(fs) = capabilities.filesystem.as_mut() {
                fs.read.clear();
                fs.write.clear();
            }
        }
        capabilities
    }

    /// Assigns a worker to `plugin_id`, spawning one if needed, and returns
    /// its id. A plugin whose grant changed gets a fresh worker.
    pub async fn create_plugin_context(
        &self,
        plugin_id: &str,
        capabilities: PluginCapabilities,
    ) -> SandboxResult<String> {
        self.ensure_running()?;
        let capabilities = self.isolate(capabilities);
        let config = &self.shared.config;

        let mut retired = Vec::new();
        let (worker_id, replies) = {
            let mut pool = self.shared.pool();

            let current = pool
                .assignments
                .get(plugin_id)
                .and_then(|a| a.worker_id.clone());
            if let Some(id) = current {
                let reusable = pool
                    .workers
                    .get(&id)
                    .is_some_and(|w| w.accepts_work() && w.capabilities == capabilities);
                if reusable {
                    return Ok(id);
                }
                retired.extend(pool.remove_worker(&id, "capabilities replaced"));
            }

            if pool.workers.len() >= config.max_workers {
                match pool.idle_lru() {
                    Some(lru) => retired.extend(pool.remove_worker(&lru, "evicted for a new plugin")),
                    None => {
                        drop(pool);
                        for worker in retired {
                            self.shared.announce_terminated(worker);
                        }
                        warn!("Worker pool full ({} workers busy)", config.max_workers);
                        return Err(SandboxError::PoolExhausted {
                            max: config.max_workers,
                        });
                    }
                }
            }

            let worker_id = format!("worker-{}", Uuid::new_v4());
            let channels = worker::spawn(WorkerInit {
                worker_id: worker_id.clone(),
                plugin_id: plugin_id.to_string(),
                capabilities: capabilities.clone(),
                host: self.shared.host.clone(),
                runtime: self.shared.plugin_runtime.clone(),
                timeout: Duration::from_millis(config.max_execution_time_ms),
                memory_limit: config.max_memory_mb.saturating_mul(1024 * 1024),
                cpu_quota: config.max_cpu_percent / 100.0,
            })
            .map_err(|e| SandboxError::WorkerCrashed {
                worker_id: worker_id.clone(),
                detail: format!("failed to spawn worker thread: {e}"),
            })?;

            pool.workers.insert(
                worker_id.clone(),
                PluginWorker {
                    id: worker_id.clone(),
                    plugin_id: plugin_id.to_string(),
                    capabilities: capabilities.clone(),
                    state: WorkerState::Spawning,
                    commands: channels.commands,
                    active_requests: HashMap::new(),
                    metrics: WorkerMetrics::default(),
                    consecutive_timeouts: 0,
                    last_used: Instant::now(),
                },
            );
            pool.assignments.insert(
                plugin_id.to_string(),
                Assignment {
                    worker_id: Some(worker_id.clone()),
                    capabilities,
                },
            );
            pool.crashed.retain(|_, p| p.as_str() != plugin_id);
            (worker_id, channels.replies)
        };
        for worker in retired {
            self.shared.announce_terminated(worker);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(route(
            Arc::downgrade(&self.shared),
            worker_id.clone(),
            plugin_id.to_string(),
            replies,
            ready_tx,
        ));

        let spawn_timeout = Duration::from_millis(config.spawn_timeout_ms);
        if !matches!(tokio::time::timeout(spawn_timeout, ready_rx).await, Ok(Ok(()))) {
            self.terminate_worker(&worker_id);
            return Err(SandboxError::WorkerCrashed {
                worker_id,
                detail: "worker did not become ready".into(),
            });
        }

        if let Some(worker) = self.shared.pool().workers.get_mut(&worker_id) {
            if worker.state == WorkerState::Spawning {
                worker.state = WorkerState::Idle;
            }
        }
        info!("Spawned worker {worker_id} for plugin {plugin_id}");
        self.shared.emit(WorkerEvent::Spawned {
            worker_id: worker_id.clone(),
            plugin_id: plugin_id.to_string(),
        });
        Ok(worker_id)
    }

    /// Scans `code`, sends it to `worker_id` and waits for the correlated
    /// reply, the timeout, or the worker's exit, whichever comes first.
    pub async fn execute(
        &self,
        worker_id: &str,
        code: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> SandboxResult<ExecutionOutcome> {
        self.ensure_running()?;
        let policy = self.policy();

        let verdict = policy.validate(code, options.language);
        if !verdict.allowed {
            warn!("Rejected payload for {worker_id}: {}", verdict.reasons.join("; "));
            return Err(SandboxError::SecurityRejected {
                reasons: verdict.reasons,
            });
        }
        let code = if policy.options().mode == EnforcementMode::Mitigate
            && verdict.risk == RiskLevel::Medium
            && options.language.is_primary()
        {
            debug!("Wrapping medium-risk payload for {worker_id}: {:?}", verdict.warnings);
            policy.generate_safe_wrapper(code)
        } else {
            code.to_string()
        };

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.shared.config.max_execution_time_ms));
        let (request_id, rx) = self.dispatch(worker_id, ExecuteRequest { code, input }, false)?;
        let Completion {
            result,
            plugin_metrics,
            elapsed,
        } = self.await_reply(worker_id, &request_id, rx, timeout, false).await?;
        let result = result?;

        let elapsed_ms = elapsed.as_millis() as u64;
        let metrics = RuntimeMetrics {
            execution_time_ms: elapsed_ms,
            memory_used_bytes: plugin_metrics.map(|m| m.memory_usage).unwrap_or(0),
            cpu_time_ms: elapsed_ms,
            output_size: serde_json::to_vec(&result).map(|v| v.len()).unwrap_or(0),
        };
        let report = policy.check_compliance(&metrics);
        if !report.compliant {
            warn!(
                "Worker {worker_id} exceeded policy ceilings: {}",
                report.violations.join("; ")
            );
        }

        Ok(ExecutionOutcome {
            result,
            metrics,
            violations: report.violations,
        })
    }

    /// Like `execute`, addressed by plugin. Respawns the plugin's worker
    /// if it crashed or was retired.
    pub async fn execute_for_plugin(
        &self,
        plugin_id: &str,
        code: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> SandboxResult<ExecutionOutcome> {
        let (live, capabilities) = {
            let pool = self.shared.pool();
            let Some(assignment) = pool.assignments.get(plugin_id) else {
                return Err(SandboxError::WorkerNotFound(plugin_id.to_string()));
            };
            let live = assignment
                .worker_id
                .clone()
                .filter(|id| pool.workers.contains_key(id));
            (live, assignment.capabilities.clone())
        };

        let worker_id = match live {
            Some(id) => id,
            None => {
                info!("Respawning worker for plugin {plugin_id}");
                self.create_plugin_context(plugin_id, capabilities).await?
            }
        };
        self.execute(&worker_id, code, input, options).await
    }

    fn dispatch(
        &self,
        worker_id: &str,
        request: ExecuteRequest,
        probe: bool,
    ) -> SandboxResult<(String, oneshot::Receiver<Completion>)> {
        let mut pool = self.shared.pool();
        let Some(worker) = pool.workers.get_mut(worker_id) else {
            return Err(SandboxError::WorkerNotFound(worker_id.to_string()));
        };
        if !worker.accepts_work() {
            return Err(SandboxError::WorkerCrashed {
                worker_id: worker_id.to_string(),
                detail: format!("worker is {:?}", worker.state),
            });
        }

        let request_id = Uuid::new_v4().to_string();
        let raw = WorkerMessage::Execute {
            id: request_id.clone(),
            data: request,
        }
        .encode()?;

        let (reply, rx) = oneshot::channel();
        worker.active_requests.insert(
            request_id.clone(),
            Pending {
                reply,
                started: Instant::now(),
                probe,
                plugin_metrics: None,
            },
        );
        if worker.commands.send(raw).is_err() {
            worker.active_requests.remove(&request_id);
            return Err(SandboxError::WorkerCrashed {
                worker_id: worker_id.to_string(),
                detail: "command channel closed".into(),
            });
        }
        if !probe {
            worker.state = WorkerState::Executing;
            worker.last_used = Instant::now();
        }
        Ok((request_id, rx))
    }

    async fn await_reply(
        &self,
        worker_id: &str,
        request_id: &str,
        mut rx: oneshot::Receiver<Completion>,
        timeout: Duration,
        probe: bool,
    ) -> SandboxResult<Completion> {
        let crashed = || SandboxError::WorkerCrashed {
            worker_id: worker_id.to_string(),
            detail: "reply channel dropped".into(),
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(_)) => Err(crashed()),
            Err(_) => {
                let (expired, retired) = self.expire(worker_id, request_id, timeout, probe);
                if let Some(worker) = retired {
                    warn!("Retiring worker {worker_id} after repeated timeouts");
                    self.shared.announce_terminated(worker);
                }
                if expired {
                    if !probe {
                        warn!("Request {request_id} on {worker_id} timed out after {timeout:?}");
                    }
                    Err(SandboxError::Timeout {
                        timeout_ms: timeout.as_millis() as u64,
                    })
                } else {
                    // Resolved between the deadline and the lock.
                    rx.try_recv().map_err(|_| crashed())
                }
            }
        }
    }

    /// Removes a timed-out request. Returns whether it was still pending,
    /// and the worker if this timeout retired it.
    fn expire(
        &self,
        worker_id: &str,
        request_id: &str,
        timeout: Duration,
        probe: bool,
    ) -> (bool, Option<PluginWorker>) {
        let max = self.shared.config.max_consecutive_timeouts;
        let mut pool = self.shared.pool();
        let Some(worker) = pool.workers.get_mut(worker_id) else {
            return (false, None);
        };
        if worker.active_requests.remove(request_id).is_none() {
            return (false, None);
        }
        worker.settle();
        if probe {
            return (true, None);
        }

        worker.metrics.record(timeout, true);
        worker.consecutive_timeouts += 1;
        let strikes = worker.consecutive_timeouts;
        if max > 0 && strikes >= max {
            let reason = format!("retired after {strikes} consecutive timeouts");
            (true, pool.remove_worker(worker_id, &reason))
        } else {
            (true, None)
        }
    }

    /// Probes every worker with a no-op request under the health-check
    /// timeout. Reporting only; nothing is restarted.
    pub async fn health_check(&self) -> HealthReport {
        let (ids, crashed) = {
            let pool = self.shared.pool();
            let ids: Vec<String> = pool.workers.keys().cloned().collect();
            let crashed: Vec<String> = pool.crashed.keys().cloned().collect();
            (ids, crashed)
        };
        let timeout = Duration::from_millis(self.shared.config.health_check_timeout_ms);

        let probes = ids.iter().map(|id| async move { (id.clone(), self.probe(id, timeout).await) });
        let results = join_all(probes).await;

        let mut report = HealthReport::default();
        for (id, healthy) in results {
            if healthy {
                report.healthy += 1;
            } else {
                report.unhealthy_workers.push(id);
            }
        }
        report.unhealthy_workers.extend(crashed);
        report.unhealthy_workers.sort();
        report.unhealthy = report.unhealthy_workers.len();
        debug!("Health check: {} healthy, {} unhealthy", report.healthy, report.unhealthy);
        report
    }

    async fn probe(&self, worker_id: &str, timeout: Duration) -> bool {
        let request = ExecuteRequest {
            code: String::new(),
            input: Value::Null,
        };
        let Ok((request_id, rx)) = self.dispatch(worker_id, request, true) else {
            return false;
        };
        matches!(
            self.await_reply(worker_id, &request_id, rx, timeout, true).await,
            Ok(Completion { result: Ok(_), .. })
        )
    }

    pub fn get_worker_metrics(&self, worker_id: &str) -> Option<WorkerMetrics> {
        self.shared
            .pool()
            .workers
            .get(worker_id)
            .map(|w| w.metrics.clone())
    }

    pub fn get_all_metrics(&self) -> HashMap<String, WorkerMetrics> {
        self.shared
            .pool()
            .workers
            .iter()
            .map(|(id, w)| (id.clone(), w.metrics.clone()))
            .collect()
    }

    pub fn worker_state(&self, worker_id: &str) -> Option<WorkerState> {
        self.shared.pool().workers.get(worker_id).map(|w| w.state)
    }

    pub fn worker_for_plugin(&self, plugin_id: &str) -> Option<String> {
        self.shared
            .pool()
            .assignments
            .get(plugin_id)
            .and_then(|a| a.worker_id.clone())
    }

    /// Stops a worker, rejecting its pending requests with `Shutdown`.
    /// Returns false if there was nothing to stop.
    pub fn terminate_worker(&self, worker_id: &str) -> bool {
        let removed = {
            let mut pool = self.shared.pool();
            pool.crashed.remove(worker_id);
            pool.remove_worker(worker_id, "worker terminated")
        };
        match removed {
            Some(worker) => {
                self.shared.announce_terminated(worker);
                true
            }
            None => false,
        }
    }

    /// Returns how many workers were stopped.
    pub fn terminate_all(&self) -> usize {
        let ids: Vec<String> = {
            let mut pool = self.shared.pool();
            pool.crashed.clear();
            pool.workers.keys().cloned().collect()
        };
        ids.iter().filter(|id| self.terminate_worker(id)).count()
    }

    /// Terminates everything, forgets every plugin and closes the event
    /// stream. Later calls fail with `Shutdown`.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let stopped = self.terminate_all();
        self.shared.pool().assignments.clear();
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("Isolation manager disposed ({stopped} worker(s) stopped)");
    }
}

// ── Reply routing ─────────────────────────────────────────

/// Reads one worker's replies until its channel closes. Holds only a weak
/// reference so a dropped manager takes its workers down with it.
async fn route(
    shared: Weak<Shared>,
    worker_id: String,
    plugin_id: String,
    mut replies: mpsc::UnboundedReceiver<String>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);

    while let Some(raw) = replies.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let message = match WorkerMessage::decode(&raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Worker {worker_id} sent a malformed message: {e}");
                continue;
            }
        };

        match message {
            WorkerMessage::Metrics { id, .. } if id == READY_ID => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
            }
            WorkerMessage::Metrics { id, data } => {
                let mut pool = shared.pool();
                if let Some(worker) = pool.workers.get_mut(&worker_id) {
                    worker.metrics.memory_usage = data.memory_usage;
                    worker.metrics.cpu_usage = data.cpu_usage;
                    if let Some(pending) = worker.active_requests.get_mut(&id) {
                        pending.plugin_metrics = Some(data);
                    }
                }
            }
            WorkerMessage::Result { id, data } => resolve(&shared, &worker_id, &id, Ok(data)),
            WorkerMessage::Error { id, error } => {
                resolve(&shared, &worker_id, &id, Err(error.into_error(&plugin_id)))
            }
            WorkerMessage::Log { data, .. } => match data.level.as_str() {
                "error" | "warn" => warn!(plugin = %plugin_id, worker = %worker_id, "{}", data.message),
                "debug" => debug!(plugin = %plugin_id, worker = %worker_id, "{}", data.message),
                _ => info!(plugin = %plugin_id, worker = %worker_id, "{}", data.message),
            },
            WorkerMessage::Execute { id, .. } => {
                warn!("Worker {worker_id} sent an execute envelope ({id}), ignoring");
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        handle_exit(&shared, &worker_id, &plugin_id);
    }
}

fn resolve(shared: &Shared, worker_id: &str, request_id: &str, result: SandboxResult<Value>) {
    let mut pool = shared.pool();
    let Some(worker) = pool.workers.get_mut(worker_id) else {
        return;
    };
    let Some(pending) = worker.active_requests.remove(request_id) else {
        debug!("Discarding stale reply {request_id} from worker {worker_id}");
        return;
    };

    let elapsed = pending.started.elapsed();
    // Probes leave the strike count alone.
    if !pending.probe {
        worker.metrics.record(elapsed, result.is_err());
        worker.consecutive_timeouts = 0;
    }
    worker.settle();
    let _ = pending.reply.send(Completion {
        result,
        plugin_metrics: pending.plugin_metrics,
        elapsed,
    });
}

/// The worker's reply channel closed. If the pool still holds the worker,
/// nobody asked it to stop: that is a crash.
fn handle_exit(shared: &Shared, worker_id: &str, plugin_id: &str) {
    let in_flight = {
        let mut pool = shared.pool();
        let Some(mut worker) = pool.workers.remove(worker_id) else {
            return;
        };
        worker.state = WorkerState::Crashed;
        let in_flight = worker.drain(|| SandboxError::WorkerCrashed {
            worker_id: worker_id.to_string(),
            detail: "worker exited unexpectedly".into(),
        });
        pool.unassign(plugin_id, worker_id);
        pool.crashed.insert(worker_id.to_string(), plugin_id.to_string());
        in_flight
    };

    error!("Worker {worker_id} for plugin {plugin_id} crashed with {in_flight} request(s) in flight");
    shared.emit(WorkerEvent::Crashed {
        worker_id: worker_id.to_string(),
        plugin_id: plugin_id.to_string(),
        reason: "worker exited unexpectedly".into(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::HttpCapability;
    use crate::context::{LocalHost, PluginApi};
    use crate::runtime::ScriptRuntime;
    use async_trait::async_trait;
    use serde_json::json;

    fn manager_with(config: IsolationConfig, policy: SecurityPolicy) -> IsolationManager {
        IsolationManager::new(
            config,
            policy,
            Arc::new(LocalHost::new()),
            Arc::new(ScriptRuntime::new()),
        )
    }

    fn manager(config: IsolationConfig) -> IsolationManager {
        manager_with(config, SecurityPolicy::default())
    }

    fn plain() -> ExecuteOptions {
        ExecuteOptions {
            language: ScriptLanguage::Plain,
            ..Default::default()
        }
    }

    fn plain_timeout(ms: u64) -> ExecuteOptions {
        ExecuteOptions {
            timeout: Some(Duration::from_millis(ms)),
            language: ScriptLanguage::Plain,
        }
    }

    /// Returns the code it was given.
    struct EchoRuntime;

    #[async_trait]
    impl PluginRuntime for EchoRuntime {
        fn name(&self) -> &str {
            "echo"
        }

        async fn run(&self, code: &str, _input: Value, _api: &PluginApi) -> anyhow::Result<Value> {
            Ok(Value::String(code.to_string()))
        }
    }

    #[tokio::test]
    async fn test_create_and_execute() {
        let m = manager(IsolationConfig::default());
        let mut events = m.subscribe_events();

        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            WorkerEvent::Spawned {
                worker_id: id.clone(),
                plugin_id: "p1".into()
            }
        );
        assert_eq!(m.worker_state(&id), Some(WorkerState::Idle));

        let outcome = m
            .execute(&id, "input /n\nreturn", json!({ "n": 41 }), plain())
            .await
            .unwrap();
        assert_eq!(outcome.result, json!(41));
        assert!(outcome.violations.is_empty());
        assert_eq!(m.worker_state(&id), Some(WorkerState::Idle));

        let metrics = m.get_worker_metrics(&id).unwrap();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.total_errors, 0);

        // Same grant, same worker.
        let again = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();
        assert_eq!(again, id);
        assert_eq!(m.worker_for_plugin("p1"), Some(id));
    }

    #[tokio::test]
    async fn test_plugin_errors_are_typed() {
        let m = manager(IsolationConfig::default());
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        let err = m.execute(&id, "read /etc/shadow", Value::Null, plain()).await.unwrap_err();
        assert_eq!(err.kind(), "capability");
        let err = m.execute(&id, "fail out of stock", Value::Null, plain()).await.unwrap_err();
        assert_eq!(err, SandboxError::Plugin("out of stock".into()));

        let metrics = m.get_worker_metrics(&id).unwrap();
        assert_eq!(metrics.total_executions, 2);
        assert_eq!(metrics.total_errors, 2);
    }

    #[tokio::test]
    async fn test_security_rejection_never_reaches_worker() {
        let m = manager(IsolationConfig::default());
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        let err = m
            .execute(&id, "return eval(userInput)", Value::Null, ExecuteOptions::default())
            .await
            .unwrap_err();
        match err {
            SandboxError::SecurityRejected { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("eval")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.get_worker_metrics(&id).unwrap().total_executions, 0);
    }

    #[tokio::test]
    async fn test_timeout_then_stale_reply_is_discarded() {
        let m = manager(IsolationConfig::default());
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        let started = Instant::now();
        let err = m
            .execute(&id, "sleep 300\nreturn 1", Value::Null, plain_timeout(50))
            .await
            .unwrap_err();
        let waited = started.elapsed();
        assert_eq!(err, SandboxError::Timeout { timeout_ms: 50 });
        assert!(waited >= Duration::from_millis(50), "{waited:?}");
        assert!(waited < Duration::from_millis(250), "{waited:?}");

        // Let the late reply arrive; it must not leak into the next request.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let outcome = m.execute(&id, "return 2", Value::Null, plain()).await.unwrap();
        assert_eq!(outcome.result, json!(2));

        let metrics = m.get_worker_metrics(&id).unwrap();
        assert_eq!(metrics.total_executions, 2);
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(m.worker_state(&id), Some(WorkerState::Idle));
    }

    #[tokio::test]
    async fn test_crash_rejects_in_flight_and_is_isolated() {
        let m = manager(IsolationConfig::default());
        let mut events = m.subscribe_events();
        let w1 = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();
        let w2 = m.create_plugin_context("p2", PluginCapabilities::default()).await.unwrap();

        let slow = |worker: String, code: &'static str| {
            let m = m.clone();
            tokio::spawn(async move { m.execute(&worker, code, Value::Null, plain()).await })
        };
        let a = slow(w1.clone(), "sleep 2000");
        let b = slow(w1.clone(), "sleep 2000");
        let other = slow(w2.clone(), "sleep 300\nreturn \"ok\"");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = m.execute(&w1, "panic boom", Value::Null, plain()).await.unwrap_err();
        assert!(matches!(err, SandboxError::WorkerCrashed { ref worker_id, .. } if *worker_id == w1));
        for handle in [a, b] {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), "worker_crashed");
        }
        assert_eq!(other.await.unwrap().unwrap().result, json!("ok"));

        let all = m.get_all_metrics();
        assert!(!all.contains_key(&w1));
        assert!(all.contains_key(&w2));
        assert_eq!(m.worker_for_plugin("p1"), None);

        loop {
            if let WorkerEvent::Crashed { worker_id, .. } = events.recv().await.unwrap() {
                assert_eq!(worker_id, w1);
                break;
            }
        }

        // Next demand respawns.
        let outcome = m.execute_for_plugin("p1", "return 3", Value::Null, plain()).await.unwrap();
        assert_eq!(outcome.result, json!(3));
        let respawned = m.worker_for_plugin("p1").unwrap();
        assert_ne!(respawned, w1);
    }

    #[tokio::test]
    async fn test_health_check_counts_crashed_worker() {
        let m = manager(IsolationConfig::default());
        let mut ids = Vec::new();
        for plugin in ["p1", "p2", "p3"] {
            ids.push(m.create_plugin_context(plugin, PluginCapabilities::default()).await.unwrap());
        }
        let _ = m.execute(&ids[2], "panic boom", Value::Null, plain()).await;

        let report = m.health_check().await;
        assert_eq!(report.healthy, 2);
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.unhealthy_workers, vec![ids[2].clone()]);

        // Respawning the plugin clears the record.
        m.execute_for_plugin("p3", "return 1", Value::Null, plain()).await.unwrap();
        let report = m.health_check().await;
        assert_eq!((report.healthy, report.unhealthy), (3, 0));
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_unhealthy() {
        let m = manager(IsolationConfig {
            health_check_timeout_ms: 100,
            ..Default::default()
        });
        let busy = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();
        m.create_plugin_context("p2", PluginCapabilities::default()).await.unwrap();

        let handle = {
            let m = m.clone();
            let busy = busy.clone();
            tokio::spawn(async move { m.execute(&busy, "spin 800\nreturn 1", Value::Null, plain()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = m.health_check().await;
        assert_eq!(report.healthy, 1);
        assert_eq!(report.unhealthy_workers, vec![busy]);

        // Probes do not disturb the real request.
        assert_eq!(handle.await.unwrap().unwrap().result, json!(1));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent_and_drains() {
        let m = manager(IsolationConfig::default());
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        let pending = {
            let m = m.clone();
            let id = id.clone();
            tokio::spawn(async move { m.execute(&id, "sleep 2000", Value::Null, plain()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(m.terminate_worker(&id));
        assert!(!m.terminate_worker(&id));
        assert_eq!(pending.await.unwrap().unwrap_err().kind(), "shutdown");

        let err = m.execute(&id, "return 1", Value::Null, plain()).await.unwrap_err();
        assert_eq!(err, SandboxError::WorkerNotFound(id.clone()));
        assert!(m.get_all_metrics().is_empty());

        // A terminated worker is not reported as crashed.
        let report = m.health_check().await;
        assert_eq!(report, HealthReport::default());
    }

    #[tokio::test]
    async fn test_full_pool_retires_lru_idle_worker() {
        let m = manager(IsolationConfig {
            max_workers: 2,
            ..Default::default()
        });
        let mut events = m.subscribe_events();
        let w1 = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();
        let w2 = m.create_plugin_context("p2", PluginCapabilities::default()).await.unwrap();
        m.execute(&w2, "return 1", Value::Null, plain()).await.unwrap();

        let w3 = m.create_plugin_context("p3", PluginCapabilities::default()).await.unwrap();
        assert_eq!(m.worker_state(&w1), None);
        assert!(m.worker_state(&w2).is_some());
        assert!(m.worker_state(&w3).is_some());

        let mut terminated = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let WorkerEvent::Terminated { worker_id, .. } = event {
                terminated.push(worker_id);
            }
        }
        assert_eq!(terminated, vec![w1]);

        // Both busy: nothing to retire.
        let busy: Vec<_> = [w2, w3]
            .into_iter()
            .map(|id| {
                let m = m.clone();
                tokio::spawn(async move { m.execute(&id, "sleep 500", Value::Null, plain()).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = m.create_plugin_context("p4", PluginCapabilities::default()).await.unwrap_err();
        assert_eq!(err, SandboxError::PoolExhausted { max: 2 });
        for handle in busy {
            handle.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_consecutive_timeouts_retire_worker() {
        let m = manager(IsolationConfig {
            max_consecutive_timeouts: 2,
            ..Default::default()
        });
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        for _ in 0..2 {
            let err = m.execute(&id, "sleep 500", Value::Null, plain_timeout(30)).await.unwrap_err();
            assert_eq!(err.kind(), "timeout");
        }
        assert_eq!(m.worker_state(&id), None);

        let outcome = m.execute_for_plugin("p1", "return 1", Value::Null, plain()).await.unwrap();
        assert_eq!(outcome.result, json!(1));
    }

    #[tokio::test]
    async fn test_answered_probes_do_not_reset_timeout_strikes() {
        let m = manager(IsolationConfig {
            max_consecutive_timeouts: 2,
            ..Default::default()
        });
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        let err = m.execute(&id, "sleep 500", Value::Null, plain_timeout(30)).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");

        // The sleeping worker still answers the no-op probe.
        let report = m.health_check().await;
        assert_eq!(report.healthy, 1);
        assert_eq!(m.worker_state(&id), Some(WorkerState::Idle));

        let err = m.execute(&id, "sleep 500", Value::Null, plain_timeout(30)).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert_eq!(m.worker_state(&id), None);
    }

    #[tokio::test]
    async fn test_successful_call_resets_timeout_strikes() {
        let m = manager(IsolationConfig {
            max_consecutive_timeouts: 2,
            ..Default::default()
        });
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        m.execute(&id, "sleep 300", Value::Null, plain_timeout(30)).await.unwrap_err();
        m.execute(&id, "return 1", Value::Null, plain()).await.unwrap();
        m.execute(&id, "sleep 300", Value::Null, plain_timeout(30)).await.unwrap_err();
        assert!(m.worker_state(&id).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_creates_share_one_worker() {
        let m = manager(IsolationConfig::default());
        let (a, b) = tokio::join!(
            m.create_plugin_context("p1", PluginCapabilities::default()),
            m.create_plugin_context("p1", PluginCapabilities::default()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(m.get_all_metrics().len(), 1);

        let outcome = m.execute_for_plugin("p1", "return 1", Value::Null, plain()).await.unwrap();
        assert_eq!(outcome.result, json!(1));
    }

    #[tokio::test]
    async fn test_huge_memory_limit_saturates() {
        let m = manager(IsolationConfig {
            max_memory_mb: u64::MAX,
            ..Default::default()
        });
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();
        let outcome = m.execute(&id, "return 1", Value::Null, plain()).await.unwrap();
        assert_eq!(outcome.result, json!(1));
    }

    #[tokio::test]
    async fn test_capability_change_replaces_worker() {
        let m = manager(IsolationConfig::default());
        let first = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();
        let caps = PluginCapabilities {
            http: Some(HttpCapability {
                internal: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let second = m.create_plugin_context("p1", caps).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(m.worker_state(&first), None);
    }

    #[tokio::test]
    async fn test_network_isolation_narrows_grant() {
        let m = manager(IsolationConfig {
            enable_network_isolation: true,
            ..Default::default()
        });
        let caps = PluginCapabilities {
            http: Some(HttpCapability {
                internal: false,
                external: true,
                allowed_domains: vec!["api.example.com".into()],
            }),
            ..Default::default()
        };
        let id = m.create_plugin_context("p1", caps).await.unwrap();
        let err = m
            .execute(&id, "fetch https://api.example.com/v1", Value::Null, plain())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "capability");
    }

    #[tokio::test]
    async fn test_mitigate_mode_wraps_medium_risk() {
        let policy = SecurityPolicy::new(SecurityPolicyOptions {
            mode: EnforcementMode::Mitigate,
            ..Default::default()
        });
        let m = IsolationManager::new(
            IsolationConfig::default(),
            policy,
            Arc::new(LocalHost::new()),
            Arc::new(EchoRuntime),
        );
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        let code = "while (true) { if (done()) break; }";
        let outcome = m.execute(&id, code, Value::Null, ExecuteOptions::default()).await.unwrap();
        let sent = outcome.result.as_str().unwrap();
        assert!(sent.contains("\"use strict\""));
        assert!(sent.contains("__sandbox.tick();"));

        // Low risk goes through untouched.
        let outcome = m.execute(&id, "return 1;", Value::Null, ExecuteOptions::default()).await.unwrap();
        assert_eq!(outcome.result, json!("return 1;"));

        // Reject mode leaves medium risk untouched.
        m.update_policy(SecurityPolicyOptions::default());
        let outcome = m.execute(&id, code, Value::Null, ExecuteOptions::default()).await.unwrap();
        assert_eq!(outcome.result, json!(code));
    }

    #[tokio::test]
    async fn test_compliance_violations_accompany_result() {
        let policy = SecurityPolicy::new(SecurityPolicyOptions {
            max_output_size: 4,
            ..Default::default()
        });
        let m = manager_with(IsolationConfig::default(), policy);
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        let outcome = m
            .execute(&id, "return \"a long answer\"", Value::Null, plain())
            .await
            .unwrap();
        assert_eq!(outcome.result, json!("a long answer"));
        assert_eq!(outcome.violations.len(), 1);
        assert!(outcome.violations[0].contains("maxOutputSize"));
    }

    #[tokio::test]
    async fn test_dispose() {
        let m = manager(IsolationConfig::default());
        let mut events = m.subscribe_events();
        let id = m.create_plugin_context("p1", PluginCapabilities::default()).await.unwrap();

        m.dispose();
        m.dispose();

        assert!(m.get_all_metrics().is_empty());
        let err = m.create_plugin_context("p2", PluginCapabilities::default()).await.unwrap_err();
        assert_eq!(err.kind(), "shutdown");
        let err = m.execute_for_plugin("p1", "return 1", Value::Null, plain()).await.unwrap_err();
        assert_eq!(err, SandboxError::WorkerNotFound("p1".into()));

        let mut seen = Vec::new();
        while let Ok(event) = events.recv().await {
            seen.push(event);
        }
        assert_eq!(
            seen.last(),
            Some(&WorkerEvent::Terminated {
                worker_id: id,
                plugin_id: "p1".into()
            })
        );
    }
}
