//! Capability model: what a plugin is allowed to touch.
//!
//! A `PluginCapabilities` value is produced once per validation by
//! [`CapabilityManager`] and then treated as immutable. Capability keys
//! used by approvals and `has_capability` look like `family.field` or
//! `family.field:item`, e.g. `database.read:users`, `system.spawn`,
//! `events.emit:orders.created`.

pub mod manager;
pub mod schema;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use manager::{ApprovalRequest, CapabilityManager, CapabilityPolicy};

/// Wildcard entry accepted in table, domain and topic lists.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PluginCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<EventsCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemCapability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiCapability>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatabaseCapability {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    /// DDL and stored procedure calls.
    #[serde(default)]
    pub execute: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpCapability {
    /// Requests to the fixed internal-origin allowlist.
    #[serde(default)]
    pub internal: bool,
    /// Requests to hosts in `allowed_domains`.
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FilesystemCapability {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
    /// Ephemeral scratch directory, removed when the context is destroyed.
    #[serde(default)]
    pub temp: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventsCapability {
    #[serde(default)]
    pub emit: Vec<String>,
    #[serde(default)]
    pub listen: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SystemCapability {
    /// Environment variable names the plugin may read.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub spawn: bool,
    #[serde(default)]
    pub network: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UiCapability {
    #[serde(default)]
    pub views: bool,
    #[serde(default)]
    pub modals: bool,
    #[serde(default)]
    pub notifications: bool,
}

/// Predefined capability bundles, each a superset of the previous one.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum CapabilityLevel {
    Minimal,
    #[default]
    Standard,
    Enhanced,
    Privileged,
}

impl CapabilityLevel {
    pub const ALL: [CapabilityLevel; 4] = [
        CapabilityLevel::Minimal,
        CapabilityLevel::Standard,
        CapabilityLevel::Enhanced,
        CapabilityLevel::Privileged,
    ];
}

impl fmt::Display for CapabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityLevel::Minimal => "MINIMAL",
            CapabilityLevel::Standard => "STANDARD",
            CapabilityLevel::Enhanced => "ENHANCED",
            CapabilityLevel::Privileged => "PRIVILEGED",
        };
        f.write_str(name)
    }
}

impl FromStr for CapabilityLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(CapabilityLevel::Minimal),
            "standard" => Ok(CapabilityLevel::Standard),
            "enhanced" => Ok(CapabilityLevel::Enhanced),
            "privileged" => Ok(CapabilityLevel::Privileged),
            other => Err(anyhow::anyhow!(
                "unknown capability level '{other}' (expected minimal, standard, enhanced or privileged)"
            )),
        }
    }
}

impl PluginCapabilities {
    /// Removes duplicate entries from every list, keeping first occurrence.
    pub fn normalized(mut self) -> Self {
        if let Some(db) = self.database.as_mut() {
            dedup(&mut db.read);
            dedup(&mut db.write);
        }
        if let Some(http) = self.http.as_mut() {
            dedup(&mut http.allowed_domains);
        }
        if let Some(fs) = self.filesystem.as_mut() {
            dedup(&mut fs.read);
            dedup(&mut fs.write);
        }
        if let Some(events) = self.events.as_mut() {
            dedup(&mut events.emit);
            dedup(&mut events.listen);
        }
        if let Some(system) = self.system.as_mut() {
            dedup(&mut system.env);
        }
        self
    }

    /// Checks a capability key against this grant.
    ///
    /// A bare family (`"http"`) is granted when the family is present.
    /// A list field (`"database.read"`) is granted when the list is
    /// non-empty; with an item (`"database.read:users"`) the item must be
    /// covered by the list. Unknown keys are never granted.
    pub fn grants(&self, key: &str) -> bool {
        let (path, item) = match key.split_once(':') {
            Some((path, item)) => (path, Some(item)),
            None => (key, None),
        };
        let (family, field) = match path.split_once('.') {
            Some((family, field)) => (family, Some(field)),
            None => (path, None),
        };

        match (family, field) {
            ("database", None) => self.database.is_some(),
            ("http", None) => self.http.is_some(),
            ("filesystem", None) => self.filesystem.is_some(),
            ("events", None) => self.events.is_some(),
            ("system", None) => self.system.is_some(),
            ("ui", None) => self.ui.is_some(),

            ("database", Some(field)) => self.database.as_ref().is_some_and(|db| match field {
                "read" => list_grants(&db.read, item, name_matches),
                "write" => list_grants(&db.write, item, name_matches),
                "execute" => db.execute,
                _ => false,
            }),
            ("http", Some(field)) => self.http.as_ref().is_some_and(|http| match field {
                "internal" => http.internal,
                "external" => http.external,
                "domain" | "allowedDomains" => {
                    list_grants(&http.allowed_domains, item, domain_matches)
                }
                _ => false,
            }),
            ("filesystem", Some(field)) => self.filesystem.as_ref().is_some_and(|fs| match field {
                "read" => list_grants(&fs.read, item, path_within),
                "write" => list_grants(&fs.write, item, path_within),
                "temp" => fs.temp,
                _ => false,
            }),
            ("events", Some(field)) => self.events.as_ref().is_some_and(|ev| match field {
                "emit" => list_grants(&ev.emit, item, topic_matches),
                "listen" => list_grants(&ev.listen, item, topic_matches),
                _ => false,
            }),
            ("system", Some(field)) => self.system.as_ref().is_some_and(|sys| match field {
                "env" => list_grants(&sys.env, item, name_matches),
                "spawn" => sys.spawn,
                "network" => sys.network,
                _ => false,
            }),
            ("ui", Some(field)) => self.ui.as_ref().is_some_and(|ui| match field {
                "views" => ui.views,
                "modals" => ui.modals,
                "notifications" => ui.notifications,
                _ => false,
            }),
            _ => false,
        }
    }
}

fn list_grants(list: &[String], item: Option<&str>, matches: fn(&str, &str) -> bool) -> bool {
    match item {
        None => !list.is_empty(),
        Some(item) => list.iter().any(|pattern| matches(pattern, item)),
    }
}

pub(crate) fn dedup(list: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    list.retain(|entry| seen.insert(entry.clone()));
}

/// Exact (case-insensitive) name match, or the bare wildcard.
pub fn name_matches(pattern: &str, name: &str) -> bool {
    pattern == WILDCARD || pattern.eq_ignore_ascii_case(name)
}

/// Host match: exact, `*.example.com` for strict subdomains, or `*`.
pub fn domain_matches(pattern: &str, host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();
    if pattern == WILDCARD {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{suffix}")),
        None => host == pattern,
    }
}

/// Topic match: exact, `orders.*` for anything under `orders.`, or `*`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1),
        None => pattern == topic,
    }
}

/// Path match: `path` is the root itself or lies beneath it.
/// Callers normalize `path` first; `..` components are never accepted.
pub fn path_within(root: &str, path: &str) -> bool {
    let path = Path::new(path);
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return false;
    }
    path.starts_with(Path::new(root))
}
