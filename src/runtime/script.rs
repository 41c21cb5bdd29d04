//! Builtin line-oriented runtime.
//!
//! One command per line; blank lines and `#` comments are skipped. Each
//! command leaves its result in a register that `return` (with no
//! argument) yields, as does falling off the end of the script.
//!
//! ```text
//! # count open orders
//! query SELECT count(*) FROM orders WHERE open
//! log counted
//! return
//! ```

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};

use super::PluginRuntime;
use crate::context::PluginApi;

pub struct ScriptRuntime;

impl ScriptRuntime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON if it parses, otherwise the raw text as a string.
fn literal(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

fn millis(arg: &str, line: usize) -> anyhow::Result<Duration> {
    let ms: u64 = arg
        .parse()
        .with_context(|| format!("line {line}: expected milliseconds, got '{arg}'"))?;
    Ok(Duration::from_millis(ms))
}

#[async_trait]
impl PluginRuntime for ScriptRuntime {
    fn name(&self) -> &str {
        "script"
    }

    async fn run(&self, code: &str, input: Value, api: &PluginApi) -> anyhow::Result<Value> {
        let mut last = Value::Null;

        for (index, raw) in code.lines().enumerate() {
            let line = index + 1;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            let (command, arg) = match text.split_once(char::is_whitespace) {
                Some((command, arg)) => (command, arg.trim()),
                None => (text, ""),
            };

            match command {
                "return" if arg.is_empty() => return Ok(last),
                "return" => return Ok(literal(arg)),
                "log" => api.logger.log("info", arg),
                "warn" => api.logger.log("warn", arg),
                "sleep" => tokio::time::sleep(millis(arg, line)?).await,
                // Blocks the worker thread; no await point.
                "spin" => std::thread::sleep(millis(arg, line)?),
                "input" if arg.is_empty() => last = input.clone(),
                "input" => {
                    last = input.pointer(arg).cloned().unwrap_or(Value::Null);
                }
                "query" => last = api.database.query(arg, &[]).await?,
                "fetch" => {
                    let response = api.http.get(arg).await?;
                    last = json!({ "status": response.status, "body": response.body });
                }
                "read" => last = Value::String(api.filesystem.read(arg).await?),
                "write" => {
                    let (path, contents) = arg.split_once(char::is_whitespace).unwrap_or((arg, ""));
                    api.filesystem.write(path, contents.trim_start()).await?;
                    last = Value::Bool(true);
                }
                "emit" => {
                    let (topic, payload) = arg.split_once(char::is_whitespace).unwrap_or((arg, "null"));
                    api.events.emit(topic, literal(payload.trim())).await?;
                    last = Value::Bool(true);
                }
                "env" => {
                    last = api.env.get(arg)?.map(Value::String).unwrap_or(Value::Null);
                }
                "fail" => bail!("{}", if arg.is_empty() { "plugin failed" } else { arg }),
                "panic" => panic!("plugin panicked: {arg}"),
                other => bail!("line {line}: unknown command '{other}'"),
            }
        }

        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{PluginCapabilities, SystemCapability};
    use crate::context::host::LocalHost;
    use crate::error::SandboxError;
    use std::sync::Arc;

    fn api(caps: PluginCapabilities) -> PluginApi {
        PluginApi::new("p1", &caps, Arc::new(LocalHost::new()), None).unwrap()
    }

    #[tokio::test]
    async fn test_return_forms() {
        let rt = ScriptRuntime::new();
        let api = api(PluginCapabilities::default());

        assert_eq!(rt.run("return 42", Value::Null, &api).await.unwrap(), json!(42));
        assert_eq!(rt.run("return {\"a\": [1]}", Value::Null, &api).await.unwrap(), json!({"a": [1]}));
        assert_eq!(rt.run("return hello world", Value::Null, &api).await.unwrap(), json!("hello world"));
        assert_eq!(rt.run("# nothing\n\n", Value::Null, &api).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_input_register() {
        let rt = ScriptRuntime::new();
        let api = api(PluginCapabilities::default());
        let input = json!({ "order": { "id": 9 } });

        assert_eq!(rt.run("input /order/id\nreturn", input.clone(), &api).await.unwrap(), json!(9));
        assert_eq!(rt.run("input", input.clone(), &api).await.unwrap(), input);
        assert_eq!(rt.run("input /missing", input, &api).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_fail_and_unknown_command() {
        let rt = ScriptRuntime::new();
        let api = api(PluginCapabilities::default());

        let err = rt.run("fail bad input", Value::Null, &api).await.unwrap_err();
        assert_eq!(err.to_string(), "bad input");
        let err = rt.run("log ok\nfrobnicate", Value::Null, &api).await.unwrap_err();
        assert_eq!(err.to_string(), "line 2: unknown command 'frobnicate'");
        assert!(rt.run("sleep soon", Value::Null, &api).await.is_err());
    }

    #[tokio::test]
    async fn test_capability_errors_survive_anyhow() {
        let rt = ScriptRuntime::new();
        let api = api(PluginCapabilities::default());

        let err = rt.run("read /etc/passwd", Value::Null, &api).await.unwrap_err();
        let err = SandboxError::from_anyhow(err);
        assert_eq!(err.kind(), "capability");
    }

    #[tokio::test]
    async fn test_env_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let caps = PluginCapabilities {
            filesystem: Some(crate::capabilities::FilesystemCapability {
                read: vec![root.clone()],
                write: vec![root.clone()],
                temp: false,
            }),
            system: Some(SystemCapability {
                env: vec!["PLUGIN_SANDBOX_TEST_UNSET".into()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let api = api(caps);
        let rt = ScriptRuntime::new();

        let script = format!("write {root}/note.txt hello there\nread {root}/note.txt");
        assert_eq!(rt.run(&script, Value::Null, &api).await.unwrap(), json!("hello there"));
        assert_eq!(
            rt.run("env PLUGIN_SANDBOX_TEST_UNSET", Value::Null, &api).await.unwrap(),
            Value::Null
        );
    }
}
