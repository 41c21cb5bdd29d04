//! Error taxonomy shared by every sandbox component.
//!
//! Management-plane errors (`Validation`, `SecurityRejected`) describe a
//! structurally invalid request and are never retried. Worker-plane errors
//! (`Timeout`, `WorkerCrashed`) are surfaced per call; the pool heals itself
//! by respawning on the next demand.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    /// Capability manifest failed schema validation.
    #[error("invalid capability manifest for plugin '{plugin_id}': {}", .diagnostics.join("; "))]
    Validation {
        plugin_id: String,
        diagnostics: Vec<String>,
    },

    /// Plugin attempted an action outside its granted capabilities.
    #[error("capability '{capability}' denied: {detail}")]
    Capability { capability: String, detail: String },

    /// Static scan blocked the payload before dispatch.
    #[error("payload rejected by security policy: {}", .reasons.join("; "))]
    SecurityRejected { reasons: Vec<String> },

    /// Execution exceeded its deadline.
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The isolation worker exited abnormally while the request was in flight.
    #[error("worker {worker_id} crashed: {detail}")]
    WorkerCrashed { worker_id: String, detail: String },

    /// The worker or the whole pool is shutting down.
    #[error("sandbox shutting down: {0}")]
    Shutdown(String),

    /// The plugin context was destroyed.
    #[error("plugin context for '{0}' has been destroyed")]
    Destroyed(String),

    #[error("no worker with id {0}")]
    WorkerNotFound(String),

    #[error("worker pool exhausted ({max} workers, all busy)")]
    PoolExhausted { max: usize },

    /// Plugin code itself failed.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Malformed or unexpected message on the worker channel.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SandboxError {
    pub fn capability(capability: impl Into<String>, detail: impl Into<String>) -> Self {
        SandboxError::Capability {
            capability: capability.into(),
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code, used on the worker wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation { .. } => "validation",
            SandboxError::Capability { .. } => "capability",
            SandboxError::SecurityRejected { .. } => "security_rejected",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::WorkerCrashed { .. } => "worker_crashed",
            SandboxError::Shutdown(_) => "shutdown",
            SandboxError::Destroyed(_) => "destroyed",
            SandboxError::WorkerNotFound(_) => "worker_not_found",
            SandboxError::PoolExhausted { .. } => "pool_exhausted",
            SandboxError::Plugin(_) => "plugin",
            SandboxError::Protocol(_) => "protocol",
        }
    }

    /// Recovers a `SandboxError` carried inside an `anyhow::Error`
    /// (façade errors propagated through plugin runtimes with `?`).
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<SandboxError>() {
            Ok(e) => e,
            Err(other) => SandboxError::Plugin(format!("{other:#}")),
        }
    }

    pub fn to_wire(&self) -> WireError {
        use serde_json::json;

        let detail = match self {
            SandboxError::Validation {
                plugin_id,
                diagnostics,
            } => json!({ "plugin_id": plugin_id, "diagnostics": diagnostics }),
            SandboxError::Capability { capability, detail } => {
                json!({ "capability": capability, "detail": detail })
            }
            SandboxError::SecurityRejected { reasons } => json!({ "reasons": reasons }),
            SandboxError::Timeout { timeout_ms } => json!({ "timeout_ms": timeout_ms }),
            SandboxError::WorkerCrashed { worker_id, detail } => {
                json!({ "worker_id": worker_id, "detail": detail })
            }
            SandboxError::PoolExhausted { max } => json!({ "max": max }),
            SandboxError::Shutdown(message)
            | SandboxError::Destroyed(message)
            | SandboxError::WorkerNotFound(message)
            | SandboxError::Plugin(message)
            | SandboxError::Protocol(message) => json!({ "message": message }),
        };
        WireError {
            code: self.kind().to_string(),
            message: self.to_string(),
            detail: Some(detail),
        }
    }
}

/// Serialized error carried by `error` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl WireError {
    /// Rebuilds the host-side error. `plugin_id` fills in fields the
    /// worker does not send back. Missing detail falls back to `message`.
    pub fn into_error(self, plugin_id: &str) -> SandboxError {
        let detail = self.detail.unwrap_or(serde_json::Value::Null);
        let text = |key: &str| detail[key].as_str().map(String::from);
        let list = |key: &str| {
            detail[key].as_array().map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
        };
        let message = text("message").unwrap_or_else(|| self.message.clone());

        match self.code.as_str() {
            "validation" => SandboxError::Validation {
                plugin_id: text("plugin_id").unwrap_or_else(|| plugin_id.to_string()),
                diagnostics: list("diagnostics").unwrap_or_else(|| vec![self.message.clone()]),
            },
            "capability" => SandboxError::Capability {
                capability: text("capability").unwrap_or_else(|| "unknown".to_string()),
                detail: text("detail").unwrap_or(self.message),
            },
            "security_rejected" => SandboxError::SecurityRejected {
                reasons: list("reasons").unwrap_or_else(|| vec![self.message.clone()]),
            },
            "timeout" => SandboxError::Timeout {
                timeout_ms: detail["timeout_ms"].as_u64().unwrap_or(0),
            },
            "worker_crashed" => SandboxError::WorkerCrashed {
                worker_id: text("worker_id").unwrap_or_default(),
                detail: text("detail").unwrap_or(self.message),
            },
            "pool_exhausted" => SandboxError::PoolExhausted {
                max: detail["max"].as_u64().unwrap_or(0) as usize,
            },
            "shutdown" => SandboxError::Shutdown(message),
            "destroyed" => {
                SandboxError::Destroyed(text("message").unwrap_or_else(|| plugin_id.to_string()))
            }
            "worker_not_found" => SandboxError::WorkerNotFound(message),
            "protocol" => SandboxError::Protocol(message),
            _ => SandboxError::Plugin(message),
        }
    }
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
