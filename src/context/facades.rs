//! Capability-scoped façades over a `HostApi`.
//!
//! Each façade holds the grant for one capability family (or `None`, in
//! which case every call is denied) and checks it before delegating.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::host::{HostApi, HostEvent, HttpRequest, HttpResponse};
use super::sql::{scan_tables, StatementKind, TableScan};
use crate::capabilities::{
    domain_matches, name_matches, path_within, topic_matches, DatabaseCapability,
    EventsCapability, FilesystemCapability, HttpCapability, PluginCapabilities, SystemCapability,
};
use crate::error::{SandboxError, SandboxResult};

/// Hosts reachable with `http.internal`.
pub const INTERNAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1"];

// ── Database ──────────────────────────────────────────────

pub struct ScopedDatabase {
    plugin_id: String,
    grant: Option<DatabaseCapability>,
    host: Arc<dyn HostApi>,
}

impl ScopedDatabase {
    pub async fn query(&self, sql: &str, params: &[Value]) -> SandboxResult<Value> {
        let Some(grant) = &self.grant else {
            return Err(SandboxError::capability("database", "no database access granted"));
        };
        let body = sql.trim().trim_end_matches(';');
        if body.contains(';') {
            return Err(SandboxError::capability(
                "database",
                "multiple statements in one query",
            ));
        }

        let kind = StatementKind::classify(body);
        let TableScan {
            tables,
            targets,
            unresolved,
        } = scan_tables(body);
        if unresolved {
            return Err(SandboxError::capability(
                "database",
                "could not determine referenced tables",
            ));
        }
        let readable = |t: &str| grant.read.iter().chain(&grant.write).any(|p| name_matches(p, t));
        let writable = |t: &str| grant.write.iter().any(|p| name_matches(p, t));

        match kind {
            StatementKind::Execute if !grant.execute => {
                return Err(SandboxError::capability(
                    "database.execute",
                    "statement requires execute access",
                ));
            }
            StatementKind::Write if targets.is_empty() => {
                return Err(SandboxError::capability(
                    "database.write",
                    "could not determine target table",
                ));
            }
            _ => {}
        }
        // Targets are checked whatever the kind: `SELECT … INTO`, CTEs.
        if let Some(target) = targets.iter().find(|t| !writable(t.as_str())) {
            return Err(SandboxError::capability(
                format!("database.write:{target}"),
                "table not declared for write",
            ));
        }
        if let Some(table) = tables.iter().find(|t| !readable(t.as_str())) {
            return Err(SandboxError::capability(
                format!("database.read:{table}"),
                "table not declared",
            ));
        }

        debug!("[{}] query {kind:?} on {tables:?}", self.plugin_id);
        self.host
            .query(body, params)
            .await
            .map_err(SandboxError::from_anyhow)
    }
}

// ── HTTP ──────────────────────────────────────────────────

pub struct ScopedHttp {
    plugin_id: String,
    grant: Option<HttpCapability>,
    host: Arc<dyn HostApi>,
}

impl ScopedHttp {
    /// Whether a request to `url` would be let through.
    pub fn is_allowed(&self, url: &str) -> SandboxResult<()> {
        let Some(grant) = &self.grant else {
            return Err(SandboxError::capability("http", "no HTTP access granted"));
        };
        let parsed = url::Url::parse(url)
            .map_err(|e| SandboxError::capability("http", format!("invalid URL '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SandboxError::capability(
                "http",
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }
        let host = parsed
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase())
            .ok_or_else(|| SandboxError::capability("http", format!("URL '{url}' has no host")))?;

        if INTERNAL_HOSTS.contains(&host.as_str()) {
            return if grant.internal {
                Ok(())
            } else {
                Err(SandboxError::capability("http.internal", format!("internal host '{host}'")))
            };
        }
        if grant.external && grant.allowed_domains.iter().any(|d| domain_matches(d, &host)) {
            Ok(())
        } else {
            Err(SandboxError::capability(
                format!("http.domain:{host}"),
                "domain not in allowedDomains",
            ))
        }
    }

    pub async fn request(&self, request: HttpRequest) -> SandboxResult<HttpResponse> {
        self.is_allowed(&request.url)?;
        debug!("[{}] {} {}", self.plugin_id, request.method, request.url);
        self.host
            .http_request(request)
            .await
            .map_err(SandboxError::from_anyhow)
    }

    pub async fn get(&self, url: &str) -> SandboxResult<HttpResponse> {
        self.request(HttpRequest::get(url)).await
    }
}

// ── Filesystem ────────────────────────────────────────────

pub struct ScopedFilesystem {
    plugin_id: String,
    grant: Option<FilesystemCapability>,
    temp: Option<tempfile::TempDir>,
    host: Arc<dyn HostApi>,
}

impl ScopedFilesystem {
    /// The ephemeral scratch directory, when `filesystem.temp` is granted.
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp.as_ref().map(|t| t.path())
    }

    fn in_temp(&self, path: &Path) -> bool {
        self.temp_dir().is_some_and(|t| path.starts_with(t))
    }

    fn check(&self, path: &str, write: bool) -> SandboxResult<PathBuf> {
        let field = if write { "filesystem.write" } else { "filesystem.read" };
        let Some(grant) = &self.grant else {
            return Err(SandboxError::capability("filesystem", "no filesystem access granted"));
        };
        let normalized = normalize(path).ok_or_else(|| {
            SandboxError::capability(
                format!("{field}:{path}"),
                "path must be absolute and free of '..'",
            )
        })?;
        let shown = normalized.to_string_lossy();

        let roots: Vec<&String> = if write {
            grant.write.iter().collect()
        } else {
            grant.read.iter().chain(&grant.write).collect()
        };
        if roots.iter().any(|root| path_within(root, &shown)) || self.in_temp(&normalized) {
            Ok(normalized)
        } else {
            Err(SandboxError::capability(format!("{field}:{shown}"), "path outside declared roots"))
        }
    }

    pub async fn read(&self, path: &str) -> SandboxResult<String> {
        let path = self.check(path, false)?;
        debug!("[{}] read {}", self.plugin_id, path.display());
        self.host.read_file(&path).await.map_err(SandboxError::from_anyhow)
    }

    pub async fn write(&self, path: &str, contents: &str) -> SandboxResult<()> {
        let path = self.check(path, true)?;
        debug!("[{}] write {}", self.plugin_id, path.display());
        self.host
            .write_file(&path, contents)
            .await
            .map_err(SandboxError::from_anyhow)
    }
}

/// Lexical normalization: absolute, `.` dropped, `..` rejected.
fn normalize(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => return None,
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

// ── Events ────────────────────────────────────────────────

pub struct ScopedEvents {
    plugin_id: String,
    grant: Option<EventsCapability>,
    host: Arc<dyn HostApi>,
}

impl ScopedEvents {
    pub async fn emit(&self, topic: &str, payload: Value) -> SandboxResult<()> {
        let permitted = self
            .grant
            .as_ref()
            .is_some_and(|g| g.emit.iter().any(|p| topic_matches(p, topic)));
        if !permitted {
            return Err(SandboxError::capability(
                format!("events.emit:{topic}"),
                "topic not declared for emit",
            ));
        }
        self.host
            .emit(HostEvent {
                topic: topic.to_string(),
                payload,
                source: self.plugin_id.clone(),
            })
            .await
            .map_err(SandboxError::from_anyhow)
    }

    /// Subscribes to `pattern`, which must be covered by a declared
    /// `events.listen` entry.
    pub fn subscribe(&self, pattern: &str) -> SandboxResult<EventSubscription> {
        let permitted = self
            .grant
            .as_ref()
            .is_some_and(|g| g.listen.iter().any(|p| p == pattern || topic_matches(p, pattern)));
        if !permitted {
            return Err(SandboxError::capability(
                format!("events.listen:{pattern}"),
                "topic not declared for listen",
            ));
        }
        Ok(EventSubscription {
            pattern: pattern.to_string(),
            rx: self.host.subscribe(),
        })
    }
}

/// Host events filtered down to one topic pattern.
pub struct EventSubscription {
    pattern: String,
    rx: broadcast::Receiver<HostEvent>,
}

impl EventSubscription {
    /// Next matching event, or `None` once the bus is closed.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if topic_matches(&self.pattern, &event.topic) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event subscription on '{}' lagged by {n} events", self.pattern);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ── Environment ───────────────────────────────────────────

pub struct ScopedEnv {
    grant: Option<SystemCapability>,
    host: Arc<dyn HostApi>,
}

impl ScopedEnv {
    pub fn get(&self, name: &str) -> SandboxResult<Option<String>> {
        let permitted = self
            .grant
            .as_ref()
            .is_some_and(|g| g.env.iter().any(|n| name_matches(n, name)));
        if permitted {
            Ok(self.host.env(name))
        } else {
            Err(SandboxError::capability(format!("system.env:{name}"), "variable not declared"))
        }
    }
}

// ── Logging ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
}

/// Plugin log output. Always traced; also forwarded when a sink is set.
pub struct PluginLogger {
    plugin_id: String,
    sink: Option<mpsc::UnboundedSender<LogRecord>>,
}

impl PluginLogger {
    pub fn log(&self, level: &str, message: &str) {
        match level {
            "error" | "warn" => warn!(plugin = %self.plugin_id, "{message}"),
            "debug" => debug!(plugin = %self.plugin_id, "{message}"),
            _ => info!(plugin = %self.plugin_id, "{message}"),
        }
        if let Some(sink) = &self.sink {
            let _ = sink.send(LogRecord {
                level: level.to_string(),
                message: message.to_string(),
            });
        }
    }
}

// ── Bundle ────────────────────────────────────────────────

/// Everything a running plugin can reach.
pub struct PluginApi {
    pub plugin_id: String,
    pub database: ScopedDatabase,
    pub http: ScopedHttp,
    pub filesystem: ScopedFilesystem,
    pub events: ScopedEvents,
    pub env: ScopedEnv,
    pub logger: PluginLogger,
}

impl PluginApi {
    pub fn new(
        plugin_id: &str,
        capabilities: &PluginCapabilities,
        host: Arc<dyn HostApi>,
        log_sink: Option<mpsc::UnboundedSender<LogRecord>>,
    ) -> SandboxResult<Self> {
        let temp = match &capabilities.filesystem {
            Some(fs) if fs.temp => Some(
                tempfile::Builder::new()
                    .prefix(&format!("plugin-{plugin_id}-"))
                    .tempdir()
                    .map_err(|e| SandboxError::Plugin(format!("failed to create temp dir: {e}")))?,
            ),
            _ => None,
        };
        let plugin_id = plugin_id.to_string();

        Ok(Self {
            database: ScopedDatabase {
                plugin_id: plugin_id.clone(),
                grant: capabilities.database.clone(),
                host: host.clone(),
            },
            http: ScopedHttp {
                plugin_id: plugin_id.clone(),
                grant: capabilities.http.clone(),
                host: host.clone(),
            },
            filesystem: ScopedFilesystem {
                plugin_id: plugin_id.clone(),
                grant: capabilities.filesystem.clone(),
                temp,
                host: host.clone(),
            },
            events: ScopedEvents {
                plugin_id: plugin_id.clone(),
                grant: capabilities.events.clone(),
                host: host.clone(),
            },
            env: ScopedEnv {
                grant: capabilities.system.clone(),
                host,
            },
            logger: PluginLogger {
                plugin_id: plugin_id.clone(),
                sink: log_sink,
            },
            plugin_id,
        })
    }
}
