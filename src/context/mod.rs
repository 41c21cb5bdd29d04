//! Per-plugin execution context.
//!
//! A `PluginContext` owns the scoped `PluginApi` built from one enforced
//! capability set, runs payloads through a `PluginRuntime` under a
//! deadline, and keeps execution metrics. It lives inside a worker; the
//! host only ever talks to it through the worker protocol.

pub mod facades;
pub mod host;
pub mod sql;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::capabilities::PluginCapabilities;
use crate::error::{SandboxError, SandboxResult};
use crate::runtime::PluginRuntime;

pub use facades::{LogRecord, PluginApi};
pub use host::{HostApi, LocalHost};

pub struct ContextOptions {
    pub timeout: Duration,
    /// Ceiling on the serialized size of a single result, in bytes.
    pub memory_limit: u64,
    /// Fraction of wall time the plugin is expected to keep busy (0..=1).
    pub cpu_quota: f64,
    pub capabilities: PluginCapabilities,
    /// Receives plugin log output, in addition to tracing.
    pub log_sink: Option<mpsc::UnboundedSender<LogRecord>>,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            memory_limit: 128 * 1024 * 1024,
            cpu_quota: 1.0,
            capabilities: PluginCapabilities::default(),
            log_sink: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginMetrics {
    pub execution_count: u64,
    /// Milliseconds, summed over every execution.
    pub total_execution_time: u64,
    pub error_count: u64,
    pub last_execution: Option<DateTime<Utc>>,
    /// Largest input or output payload seen, in bytes.
    pub memory_usage: u64,
    /// Busy time as a percentage of the context's lifetime.
    pub cpu_usage: f64,
}

pub struct PluginContext {
    plugin_id: String,
    timeout: Duration,
    memory_limit: u64,
    cpu_quota: f64,
    capabilities: PluginCapabilities,
    runtime: Arc<dyn PluginRuntime>,
    /// Taken on destroy; in-flight executions keep their own clone.
    api: Mutex<Option<Arc<PluginApi>>>,
    metrics: Mutex<PluginMetrics>,
    destroyed: AtomicBool,
    created_at: Instant,
}

impl PluginContext {
    pub fn new(
        plugin_id: &str,
        host: Arc<dyn HostApi>,
        runtime: Arc<dyn PluginRuntime>,
        options: ContextOptions,
    ) -> SandboxResult<Self> {
        let api = PluginApi::new(plugin_id, &options.capabilities, host, options.log_sink)?;
        debug!(
            "Created context for plugin {plugin_id} (runtime: {}, timeout: {:?})",
            runtime.name(),
            options.timeout
        );
        Ok(Self {
            plugin_id: plugin_id.to_string(),
            timeout: options.timeout,
            memory_limit: options.memory_limit,
            cpu_quota: options.cpu_quota,
            capabilities: options.capabilities,
            runtime,
            api: Mutex::new(Some(Arc::new(api))),
            metrics: Mutex::new(PluginMetrics::default()),
            destroyed: AtomicBool::new(false),
            created_at: Instant::now(),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn capabilities(&self) -> &PluginCapabilities {
        &self.capabilities
    }

    /// Checks a capability key such as `database.read:users`.
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.grants(name)
    }

    /// Runs `code` with `input` under the context deadline. Metrics are
    /// updated whatever the outcome.
    pub async fn execute(&self, code: &str, input: Value) -> SandboxResult<Value> {
        let api = self.api.lock().ok().and_then(|guard| guard.clone());
        let Some(api) = api.filter(|_| !self.destroyed.load(Ordering::Acquire)) else {
            return Err(SandboxError::Destroyed(self.plugin_id.clone()));
        };

        let input_size = payload_size(&input);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.runtime.run(code, input, &api)).await {
            Ok(Ok(value)) => {
                let size = payload_size(&value);
                if size > self.memory_limit {
                    Err(SandboxError::Plugin(format!(
                        "result of {size} bytes exceeds memory limit of {} bytes",
                        self.memory_limit
                    )))
                } else {
                    Ok((value, size))
                }
            }
            Ok(Err(err)) => Err(SandboxError::from_anyhow(err)),
            Err(_) => Err(SandboxError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        let elapsed = started.elapsed();

        let output_size = outcome.as_ref().map(|(_, size)| *size).unwrap_or(0);
        self.record(elapsed, outcome.is_err(), input_size.max(output_size));

        match outcome {
            Ok((value, _)) => Ok(value),
            Err(err) => {
                debug!("Plugin {} execution failed: {err}", self.plugin_id);
                Err(err)
            }
        }
    }

    fn record(&self, elapsed: Duration, failed: bool, payload: u64) {
        let Ok(mut m) = self.metrics.lock() else {
            return;
        };
        m.execution_count += 1;
        m.total_execution_time += elapsed.as_millis() as u64;
        if failed {
            m.error_count += 1;
        }
        m.last_execution = Some(Utc::now());
        m.memory_usage = m.memory_usage.max(payload);

        let lifetime_ms = self.created_at.elapsed().as_millis().max(1) as f64;
        m.cpu_usage = (m.total_execution_time as f64 / lifetime_ms * 100.0).min(100.0);
        if m.cpu_usage > self.cpu_quota * 100.0 {
            warn!(
                "Plugin {} busy {:.1}% of its lifetime, over its {:.0}% quota",
                self.plugin_id,
                m.cpu_usage,
                self.cpu_quota * 100.0
            );
        }
    }

    pub fn get_metrics(&self) -> PluginMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Releases the plugin API (and its temp directory once in-flight
    /// calls finish). Later `execute` calls fail with `Destroyed`.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut api) = self.api.lock() {
            api.take();
        }
        info!("Destroyed context for plugin {}", self.plugin_id);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

fn payload_size(value: &Value) -> u64 {
    serde_json::to_vec(value).map(|v| v.len() as u64).unwrap_or(0)
}
