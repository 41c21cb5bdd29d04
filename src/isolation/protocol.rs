//! Host ↔ worker wire protocol.
//!
//! Envelopes are serialized to JSON strings before crossing the worker
//! boundary, so nothing but owned text is shared between the two sides.
//!
//! ```json
//! {"type":"execute","id":"5b1c…","data":{"code":"return 1","input":null}}
//! {"type":"metrics","id":"5b1c…","data":{"execution_count":1,…}}
//! {"type":"result","id":"5b1c…","data":1}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{LogRecord, PluginMetrics};
use crate::error::{SandboxError, SandboxResult, WireError};

/// Id of the `metrics` envelope a worker sends once it is ready.
pub const READY_ID: &str = "ready";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Empty code is a liveness probe: the worker replies `null` without
    /// touching the plugin context.
    pub code: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerMessage {
    Execute { id: String, data: ExecuteRequest },
    Result { id: String, data: Value },
    Error { id: String, error: WireError },
    Metrics { id: String, data: PluginMetrics },
    Log { id: String, data: LogRecord },
}

impl WorkerMessage {
    pub fn id(&self) -> &str {
        match self {
            WorkerMessage::Execute { id, .. }
            | WorkerMessage::Result { id, .. }
            | WorkerMessage::Error { id, .. }
            | WorkerMessage::Metrics { id, .. }
            | WorkerMessage::Log { id, .. } => id,
        }
    }

    pub fn encode(&self) -> SandboxResult<String> {
        serde_json::to_string(self).map_err(|e| SandboxError::Protocol(format!("encode failed: {e}")))
    }

    pub fn decode(raw: &str) -> SandboxResult<Self> {
        serde_json::from_str(raw).map_err(|e| SandboxError::Protocol(format!("decode failed: {e}")))
    }
}
