//! Worker side of the isolation boundary.
//!
//! Each worker is a dedicated OS thread running its own single-threaded
//! tokio runtime. It reads encoded `execute` envelopes, runs them against a
//! lazily built `PluginContext`, and answers with `metrics` followed by
//! `result` or `error`. A panicking execution ends the loop; the host sees
//! its receiving channel close and treats that as a crash.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::protocol::{ExecuteRequest, WorkerMessage, READY_ID};
use crate::capabilities::PluginCapabilities;
use crate::context::{ContextOptions, HostApi, LogRecord, PluginContext, PluginMetrics};
use crate::error::SandboxResult;
use crate::runtime::PluginRuntime;

/// Everything a worker thread is started with.
pub(crate) struct WorkerInit {
    pub worker_id: String,
    pub plugin_id: String,
    pub capabilities: PluginCapabilities,
    pub host: Arc<dyn HostApi>,
    pub runtime: Arc<dyn PluginRuntime>,
    pub timeout: Duration,
    pub memory_limit: u64,
    pub cpu_quota: f64,
}

/// Channel ends the host keeps for one worker.
pub(crate) struct WorkerChannels {
    pub commands: mpsc::UnboundedSender<String>,
    pub replies: mpsc::UnboundedReceiver<String>,
}

/// Starts the worker thread. The thread exits once `commands` is dropped
/// or an execution panics.
pub(crate) fn spawn(init: WorkerInit) -> std::io::Result<WorkerChannels> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<String>();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let name = format!("plugin-{}", init.worker_id);

    std::thread::Builder::new().name(name).spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(run(init, cmd_rx, out_tx)),
            Err(e) => error!("Worker {} failed to start its runtime: {e}", init.worker_id),
        }
    })?;

    Ok(WorkerChannels {
        commands: cmd_tx,
        replies: out_rx,
    })
}

fn send(out: &mpsc::UnboundedSender<String>, message: WorkerMessage) {
    match message.encode() {
        Ok(raw) => {
            // Host gone: nothing left to tell.
            let _ = out.send(raw);
        }
        Err(e) => error!("Worker failed to encode {} reply: {e}", message.id()),
    }
}

fn build_context(
    init: &WorkerInit,
    log_sink: mpsc::UnboundedSender<LogRecord>,
) -> SandboxResult<Arc<PluginContext>> {
    let context = PluginContext::new(
        &init.plugin_id,
        init.host.clone(),
        init.runtime.clone(),
        ContextOptions {
            timeout: init.timeout,
            memory_limit: init.memory_limit,
            cpu_quota: init.cpu_quota,
            capabilities: init.capabilities.clone(),
            log_sink: Some(log_sink),
        },
    )?;
    Ok(Arc::new(context))
}

async fn run(
    init: WorkerInit,
    mut commands: mpsc::UnboundedReceiver<String>,
    out: mpsc::UnboundedSender<String>,
) {
    let worker_id = init.worker_id.clone();
    let (log_tx, mut logs) = mpsc::unbounded_channel::<LogRecord>();
    let mut context: Option<Arc<PluginContext>> = None;
    let mut tasks = JoinSet::new();

    send(
        &out,
        WorkerMessage::Metrics {
            id: READY_ID.to_string(),
            data: PluginMetrics::default(),
        },
    );
    debug!("Worker {worker_id} ready for plugin {}", init.plugin_id);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(raw) = command else {
                    debug!("Worker {worker_id} command channel closed");
                    break;
                };
                let (id, request) = match WorkerMessage::decode(&raw) {
                    Ok(WorkerMessage::Execute { id, data }) => (id, data),
                    Ok(other) => {
                        warn!("Worker {worker_id} ignoring unexpected '{}' message", other.id());
                        continue;
                    }
                    Err(e) => {
                        warn!("Worker {worker_id} dropped malformed command: {e}");
                        continue;
                    }
                };

                if request.code.trim().is_empty() {
                    send(&out, WorkerMessage::Result { id, data: serde_json::Value::Null });
                    continue;
                }

                if context.is_none() {
                    match build_context(&init, log_tx.clone()) {
                        Ok(ctx) => context = Some(ctx),
                        Err(e) => {
                            send(&out, WorkerMessage::Error { id, error: e.to_wire() });
                            continue;
                        }
                    }
                }
                if let Some(ctx) = context.clone() {
                    tasks.spawn(execute(ctx, id, request, out.clone()));
                }
            }
            Some(record) = logs.recv() => {
                send(&out, WorkerMessage::Log { id: worker_id.clone(), data: record });
            }
            Some(joined) = tasks.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Worker {worker_id} execution panicked, shutting down");
                        break;
                    }
                }
            }
        }
    }

    if let Some(ctx) = context {
        ctx.destroy();
    }
    tasks.abort_all();
}

async fn execute(
    ctx: Arc<PluginContext>,
    id: String,
    request: ExecuteRequest,
    out: mpsc::UnboundedSender<String>,
) {
    let result = ctx.execute(&request.code, request.input).await;
    send(
        &out,
        WorkerMessage::Metrics {
            id: id.clone(),
            data: ctx.get_metrics(),
        },
    );
    let reply = match result {
        Ok(data) => WorkerMessage::Result { id, data },
        Err(e) => WorkerMessage::Error { id, error: e.to_wire() },
    };
    send(&out, reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LocalHost;
    use crate::runtime::ScriptRuntime;
    use serde_json::json;

    fn start() -> WorkerChannels {
        spawn(WorkerInit {
            worker_id: "worker-test".into(),
            plugin_id: "p1".into(),
            capabilities: PluginCapabilities::default(),
            host: Arc::new(LocalHost::new()),
            runtime: Arc::new(ScriptRuntime::new()),
            timeout: Duration::from_secs(5),
            memory_limit: 1024 * 1024,
            cpu_quota: 1.0,
        })
        .unwrap()
    }

    fn execute_msg(id: &str, code: &str) -> String {
        WorkerMessage::Execute {
            id: id.into(),
            data: ExecuteRequest {
                code: code.into(),
                input: json!(null),
            },
        }
        .encode()
        .unwrap()
    }

    async fn next(channels: &mut WorkerChannels) -> WorkerMessage {
        let raw = channels.replies.recv().await.unwrap();
        WorkerMessage::decode(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_ready_then_metrics_then_result() {
        let mut w = start();
        assert!(matches!(next(&mut w).await, WorkerMessage::Metrics { id, .. } if id == READY_ID));

        w.commands.send(execute_msg("r1", "return 7")).unwrap();
        match next(&mut w).await {
            WorkerMessage::Metrics { id, data } => {
                assert_eq!(id, "r1");
                assert_eq!(data.execution_count, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(next(&mut w).await, WorkerMessage::Result { id: "r1".into(), data: json!(7) });
    }

    #[tokio::test]
    async fn test_probe_and_error_replies() {
        let mut w = start();
        next(&mut w).await;

        w.commands.send(execute_msg("probe", "")).unwrap();
        assert_eq!(next(&mut w).await, WorkerMessage::Result { id: "probe".into(), data: json!(null) });

        w.commands.send(execute_msg("r2", "read /etc/passwd")).unwrap();
        next(&mut w).await;
        match next(&mut w).await {
            WorkerMessage::Error { id, error } => {
                assert_eq!(id, "r2");
                assert_eq!(error.code, "capability");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_forwarded() {
        let mut w = start();
        next(&mut w).await;

        w.commands.send(execute_msg("r1", "log hello\nsleep 20\nreturn 1")).unwrap();
        let mut saw_log = false;
        loop {
            match next(&mut w).await {
                WorkerMessage::Log { data, .. } => {
                    assert_eq!(data.message, "hello");
                    saw_log = true;
                }
                WorkerMessage::Result { .. } => break,
                _ => {}
            }
        }
        assert!(saw_log);
    }

    #[tokio::test]
    async fn test_panic_closes_channel() {
        let mut w = start();
        next(&mut w).await;

        w.commands.send(execute_msg("r1", "panic boom")).unwrap();
        assert!(w.replies.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropping_commands_stops_worker() {
        let WorkerChannels { commands, mut replies } = start();
        replies.recv().await.unwrap();
        drop(commands);
        assert!(replies.recv().await.is_none());
    }
}
