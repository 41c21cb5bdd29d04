pub mod script;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::PluginApi;

/// Interprets plugin payloads inside a worker.
///
/// A runtime only ever sees the plugin's scoped `PluginApi`; anything it
/// does outside that surface is outside the capability model. Errors from
/// façades should be propagated with `?` so the worker can report their
/// kind.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    /// Short identifier for logs (e.g. "script").
    fn name(&self) -> &str;

    async fn run(&self, code: &str, input: Value, api: &PluginApi) -> anyhow::Result<Value>;
}

pub use script::ScriptRuntime;
