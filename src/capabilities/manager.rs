use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::schema::validate_manifest;
use super::{
    dedup, CapabilityLevel, DatabaseCapability, EventsCapability, FilesystemCapability,
    HttpCapability, PluginCapabilities, SystemCapability, UiCapability, WILDCARD,
};
use crate::error::{SandboxError, SandboxResult};

/// Capability keys that stay unapproved until an operator signs them off,
/// even when the manifest and policy grant them.
pub const HIGH_RISK_CAPABILITIES: &[&str] = &[
    "database.execute",
    "system.spawn",
    "system.network",
    "http.external",
    "filesystem.write",
];

/// Operator ceilings applied after template merging. The policy can only
/// narrow a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityPolicy {
    pub max_database_tables: usize,
    pub max_http_domains: usize,
    pub max_file_paths: usize,
    /// Gates `database.execute`.
    pub allow_execute: bool,
    /// Gates `system.spawn`.
    pub allow_spawn: bool,
    /// Gates `system.network`.
    pub allow_network: bool,
    /// Keep bare `*` entries in table, domain and topic lists.
    pub allow_wildcards: bool,
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self {
            max_database_tables: 10,
            max_http_domains: 10,
            max_file_paths: 5,
            allow_execute: false,
            allow_spawn: false,
            allow_network: false,
            allow_wildcards: false,
        }
    }
}

/// A pending request for operator sign-off.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub capability: String,
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
}

/// Validates manifests, merges them with level templates, clamps them
/// against the operator policy, and tracks operator approvals.
///
/// All state is owned by the instance; `clear_cache` resets it.
pub struct CapabilityManager {
    policy: CapabilityPolicy,
    capability_cache: HashMap<String, PluginCapabilities>,
    approved_capabilities: HashMap<String, HashSet<String>>,
    pending_approvals: HashMap<String, Vec<ApprovalRequest>>,
}

impl CapabilityManager {
    pub fn new(policy: CapabilityPolicy) -> Self {
        Self {
            policy,
            capability_cache: HashMap::new(),
            approved_capabilities: HashMap::new(),
            pending_approvals: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    /// Validates `raw` against the schema, merges it into the template for
    /// `level`, clamps the result against the policy, and caches it.
    ///
    /// Always re-derives from scratch; the cache only serves lookups.
    pub fn validate_capabilities(
        &mut self,
        plugin_id: &str,
        raw: &Value,
        level: CapabilityLevel,
    ) -> SandboxResult<PluginCapabilities> {
        let declared = validate_manifest(raw).map_err(|diagnostics| {
            warn!("Capability manifest for {plugin_id} rejected: {}", diagnostics.join("; "));
            SandboxError::Validation {
                plugin_id: plugin_id.to_string(),
                diagnostics,
            }
        })?;

        let merged = merge(template(level), declared);
        let enforced = clamp(merged, &self.policy, plugin_id);

        info!(
            "Validated capabilities for {plugin_id} at {level} (effective level {})",
            Self::get_capability_level(&enforced)
        );
        self.capability_cache
            .insert(plugin_id.to_string(), enforced.clone());
        Ok(enforced)
    }

    /// Last validated capabilities for a plugin.
    pub fn cached_capabilities(&self, plugin_id: &str) -> Option<&PluginCapabilities> {
        self.capability_cache.get(plugin_id)
    }

    /// Lowest template that covers `capabilities`: every granted family is
    /// present in the template and every granted flag is set there too.
    pub fn get_capability_level(capabilities: &PluginCapabilities) -> CapabilityLevel {
        CapabilityLevel::ALL
            .into_iter()
            .find(|level| covers(&template(*level), capabilities))
            .unwrap_or(CapabilityLevel::Privileged)
    }

    // ── Approvals ────────────────────────────────────────

    pub fn requires_approval(capability: &str) -> bool {
        let base = capability.split(':').next().unwrap_or(capability);
        HIGH_RISK_CAPABILITIES.contains(&base)
    }

    /// Asks for operator sign-off. Returns true when the capability is
    /// usable right away: low-risk, or already approved.
    pub fn request_capability_approval(
        &mut self,
        plugin_id: &str,
        capability: &str,
        reason: Option<&str>,
    ) -> bool {
        if !Self::requires_approval(capability) || self.has_approved_capability(plugin_id, capability)
        {
            return true;
        }

        let pending = self.pending_approvals.entry(plugin_id.to_string()).or_default();
        if !pending.iter().any(|r| r.capability == capability) {
            info!(
                "Plugin {plugin_id} requests approval for {capability}{}",
                reason.map(|r| format!(" ({r})")).unwrap_or_default()
            );
            pending.push(ApprovalRequest {
                capability: capability.to_string(),
                reason: reason.map(String::from),
                requested_at: Utc::now(),
            });
        }
        false
    }

    pub fn approve_capability(&mut self, plugin_id: &str, capability: &str) {
        info!("Operator approved {capability} for {plugin_id}");
        self.approved_capabilities
            .entry(plugin_id.to_string())
            .or_default()
            .insert(capability.to_string());
        if let Some(pending) = self.pending_approvals.get_mut(plugin_id) {
            pending.retain(|r| r.capability != capability);
        }
    }

    pub fn revoke_capability(&mut self, plugin_id: &str, capability: &str) -> bool {
        let removed = self
            .approved_capabilities
            .get_mut(plugin_id)
            .is_some_and(|set| set.remove(capability));
        if removed {
            info!("Operator revoked {capability} for {plugin_id}");
        }
        removed
    }

    pub fn has_approved_capability(&self, plugin_id: &str, capability: &str) -> bool {
        self.approved_capabilities
            .get(plugin_id)
            .is_some_and(|set| set.contains(capability))
    }

    pub fn pending_approvals(&self, plugin_id: &str) -> &[ApprovalRequest] {
        self.pending_approvals
            .get(plugin_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Granted by the last validation and, for high-risk keys, approved.
    pub fn is_capability_permitted(&self, plugin_id: &str, capability: &str) -> bool {
        let granted = self
            .capability_cache
            .get(plugin_id)
            .is_some_and(|caps| caps.grants(capability));
        granted
            && (!Self::requires_approval(capability)
                || self.has_approved_capability(plugin_id, capability))
    }

    pub fn clear_cache(&mut self) {
        debug!(
            "Clearing capability cache ({} plugins) and approvals",
            self.capability_cache.len()
        );
        self.capability_cache.clear();
        self.approved_capabilities.clear();
        self.pending_approvals.clear();
    }

    // ── Reporting ────────────────────────────────────────

    /// Operator-facing summary of a plugin's validated capabilities.
    /// Returns `None` when the plugin has not been validated.
    pub fn generate_capability_report(&self, plugin_id: &str) -> Option<String> {
        let caps = self.capability_cache.get(plugin_id)?;
        let mut out = format!(
            "Capability report for plugin '{plugin_id}'\nLevel: {}\n",
            Self::get_capability_level(caps)
        );

        match &caps.database {
            Some(db) => out.push_str(&format!(
                "Database: {} read table(s), {} write table(s), execute: {}\n",
                db.read.len(),
                db.write.len(),
                yes_no(db.execute)
            )),
            None => out.push_str("Database: none\n"),
        }
        match &caps.http {
            Some(http) => out.push_str(&format!(
                "HTTP: internal: {}, external: {}, {} domain(s)\n",
                yes_no(http.internal),
                yes_no(http.external),
                http.allowed_domains.len()
            )),
            None => out.push_str("HTTP: none\n"),
        }
        match &caps.filesystem {
            Some(fs) => out.push_str(&format!(
                "Filesystem: {} read path(s), {} write path(s), temp: {}\n",
                fs.read.len(),
                fs.write.len(),
                yes_no(fs.temp)
            )),
            None => out.push_str("Filesystem: none\n"),
        }
        match &caps.events {
            Some(ev) => out.push_str(&format!(
                "Events: {} emit topic(s), {} listen topic(s)\n",
                ev.emit.len(),
                ev.listen.len()
            )),
            None => out.push_str("Events: none\n"),
        }
        match &caps.system {
            Some(sys) => out.push_str(&format!(
                "System: {} env var(s), spawn: {}, network: {}\n",
                sys.env.len(),
                yes_no(sys.spawn),
                yes_no(sys.network)
            )),
            None => out.push_str("System: none\n"),
        }
        match &caps.ui {
            Some(ui) => out.push_str(&format!(
                "UI: views: {}, modals: {}, notifications: {}\n",
                yes_no(ui.views),
                yes_no(ui.modals),
                yes_no(ui.notifications)
            )),
            None => out.push_str("UI: none\n"),
        }

        let mut approved: Vec<&String> = self
            .approved_capabilities
            .get(plugin_id)
            .map(|set| set.iter().collect())
            .unwrap_or_default();
        approved.sort();
        if !approved.is_empty() {
            let list: Vec<&str> = approved.iter().map(|s| s.as_str()).collect();
            out.push_str(&format!("Approved: {}\n", list.join(", ")));
        }
        let pending = self.pending_approvals(plugin_id);
        if !pending.is_empty() {
            let list: Vec<&str> = pending.iter().map(|r| r.capability.as_str()).collect();
            out.push_str(&format!("Pending approval: {}\n", list.join(", ")));
        }
        Some(out)
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

// ── Templates ────────────────────────────────────────────

/// Base grant for a level. List fields are empty: templates grant
/// families and flags, manifests name concrete tables, hosts and paths.
pub fn template(level: CapabilityLevel) -> PluginCapabilities {
    let mut caps = PluginCapabilities {
        ui: Some(UiCapability {
            notifications: true,
            ..Default::default()
        }),
        ..Default::default()
    };
    if level == CapabilityLevel::Minimal {
        return caps;
    }

    caps.database = Some(DatabaseCapability::default());
    caps.http = Some(HttpCapability {
        internal: true,
        ..Default::default()
    });
    caps.filesystem = Some(FilesystemCapability {
        temp: true,
        ..Default::default()
    });
    caps.events = Some(EventsCapability::default());
    caps.ui = Some(UiCapability {
        views: true,
        modals: false,
        notifications: true,
    });
    if level == CapabilityLevel::Standard {
        return caps;
    }

    if let Some(http) = caps.http.as_mut() {
        http.external = true;
    }
    if let Some(ui) = caps.ui.as_mut() {
        ui.modals = true;
    }
    caps.system = Some(SystemCapability::default());
    if level == CapabilityLevel::Enhanced {
        return caps;
    }

    if let Some(db) = caps.database.as_mut() {
        db.execute = true;
    }
    caps.system = Some(SystemCapability {
        env: Vec::new(),
        spawn: true,
        network: true,
    });
    caps
}

// ── Merge ────────────────────────────────────────────────

/// Deduplicating union of lists, OR of flags. Template entries come first.
pub fn merge(base: PluginCapabilities, extra: PluginCapabilities) -> PluginCapabilities {
    PluginCapabilities {
        database: merge_family(base.database, extra.database, |a, b| DatabaseCapability {
            read: union(a.read, b.read),
            write: union(a.write, b.write),
            execute: a.execute || b.execute,
        }),
        http: merge_family(base.http, extra.http, |a, b| HttpCapability {
            internal: a.internal || b.internal,
            external: a.external || b.external,
            allowed_domains: union(a.allowed_domains, b.allowed_domains),
        }),
        filesystem: merge_family(base.filesystem, extra.filesystem, |a, b| {
            FilesystemCapability {
                read: union(a.read, b.read),
                write: union(a.write, b.write),
                temp: a.temp || b.temp,
            }
        }),
        events: merge_family(base.events, extra.events, |a, b| EventsCapability {
            emit: union(a.emit, b.emit),
            listen: union(a.listen, b.listen),
        }),
        system: merge_family(base.system, extra.system, |a, b| SystemCapability {
            env: union(a.env, b.env),
            spawn: a.spawn || b.spawn,
            network: a.network || b.network,
        }),
        ui: merge_family(base.ui, extra.ui, |a, b| UiCapability {
            views: a.views || b.views,
            modals: a.modals || b.modals,
            notifications: a.notifications || b.notifications,
        }),
    }
    // One-sided families bypass `union`.
    .normalized()
}

fn merge_family<T>(a: Option<T>, b: Option<T>, f: impl FnOnce(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (a, b) => a.or(b),
    }
}

fn union(mut a: Vec<String>, b: Vec<String>) -> Vec<String> {
    a.extend(b);
    dedup(&mut a);
    a
}

// ── Clamp ────────────────────────────────────────────────

/// Narrows a merged grant to the policy. Never adds anything.
pub fn clamp(
    mut caps: PluginCapabilities,
    policy: &CapabilityPolicy,
    plugin_id: &str,
) -> PluginCapabilities {
    if let Some(db) = caps.database.as_mut() {
        limit(&mut db.read, policy.max_database_tables, policy, plugin_id, "database.read");
        limit(&mut db.write, policy.max_database_tables, policy, plugin_id, "database.write");
        if db.execute && !policy.allow_execute {
            warn!("Policy denies database.execute for {plugin_id}");
            db.execute = false;
        }
    }
    if let Some(http) = caps.http.as_mut() {
        limit(
            &mut http.allowed_domains,
            policy.max_http_domains,
            policy,
            plugin_id,
            "http.allowedDomains",
        );
    }
    if let Some(fs) = caps.filesystem.as_mut() {
        limit(&mut fs.read, policy.max_file_paths, policy, plugin_id, "filesystem.read");
        limit(&mut fs.write, policy.max_file_paths, policy, plugin_id, "filesystem.write");
    }
    if let Some(events) = caps.events.as_mut() {
        strip_wildcards(&mut events.emit, policy, plugin_id, "events.emit");
        strip_wildcards(&mut events.listen, policy, plugin_id, "events.listen");
    }
    if let Some(system) = caps.system.as_mut() {
        strip_wildcards(&mut system.env, policy, plugin_id, "system.env");
        if system.spawn && !policy.allow_spawn {
            warn!("Policy denies system.spawn for {plugin_id}");
            system.spawn = false;
        }
        if system.network && !policy.allow_network {
            warn!("Policy denies system.network for {plugin_id}");
            system.network = false;
        }
    }
    caps
}

fn limit(list: &mut Vec<String>, max: usize, policy: &CapabilityPolicy, plugin_id: &str, field: &str) {
    strip_wildcards(list, policy, plugin_id, field);
    if list.len() > max {
        warn!(
            "Truncating {field} for {plugin_id} from {} to {max} entries",
            list.len()
        );
        list.truncate(max);
    }
}

fn strip_wildcards(list: &mut Vec<String>, policy: &CapabilityPolicy, plugin_id: &str, field: &str) {
    if policy.allow_wildcards {
        return;
    }
    let before = list.len();
    list.retain(|entry| entry != WILDCARD);
    if list.len() != before {
        warn!("Dropping wildcard from {field} for {plugin_id} (wildcards not allowed)");
    }
}

// ── Level inference ──────────────────────────────────────

fn covers(template: &PluginCapabilities, caps: &PluginCapabilities) -> bool {
    fn family<T>(tpl: &Option<T>, cap: &Option<T>, used: impl Fn(&T) -> bool, flags: impl Fn(&T, &T) -> bool) -> bool {
        match (tpl, cap) {
            (_, None) => true,
            (None, Some(c)) => !used(c),
            (Some(t), Some(c)) => flags(t, c),
        }
    }
    let implies = |granted: bool, allowed: bool| !granted || allowed;

    family(
        &template.database,
        &caps.database,
        |d| !d.read.is_empty() || !d.write.is_empty() || d.execute,
        |t, c| implies(c.execute, t.execute),
    ) && family(
        &template.http,
        &caps.http,
        |h| h.internal || h.external || !h.allowed_domains.is_empty(),
        |t, c| implies(c.internal, t.internal) && implies(c.external, t.external),
    ) && family(
        &template.filesystem,
        &caps.filesystem,
        |f| !f.read.is_empty() || !f.write.is_empty() || f.temp,
        |t, c| implies(c.temp, t.temp),
    ) && family(
        &template.events,
        &caps.events,
        |e| !e.emit.is_empty() || !e.listen.is_empty(),
        |_, _| true,
    ) && family(
        &template.system,
        &caps.system,
        |s| !s.env.is_empty() || s.spawn || s.network,
        |t, c| implies(c.spawn, t.spawn) && implies(c.network, t.network),
    ) && family(
        &template.ui,
        &caps.ui,
        |u| u.views || u.modals || u.notifications,
        |t, c| {
            implies(c.views, t.views)
                && implies(c.modals, t.modals)
                && implies(c.notifications, t.notifications)
        },
    )
}


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn arb_names() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(prop_oneof![Just("*".to_string()), "[a-z]{1,6}"], 0..12)
    }

    fn arb_paths() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("/[a-z]{1,6}(/[a-z]{1,4})?", 0..10)
    }

    fn arb_topics() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(prop_oneof![Just("*".to_string()), "[a-z]{1,6}(\\.\\*)?"], 0..8)
    }

    fn arb_capabilities() -> impl Strategy<Value = PluginCapabilities> {
        (
            prop::option::of((arb_names(), arb_names(), any::<bool>())),
            prop::option::of((any::<bool>(), any::<bool>(), arb_names())),
            prop::option::of((arb_names(), any::<bool>(), any::<bool>())),
            prop::option::of((arb_paths(), arb_paths(), any::<bool>())),
            prop::option::of((arb_topics(), arb_topics())),
        )
            .prop_map(|(db, http, system, fs, events)| PluginCapabilities {
                database: db.map(|(read, write, execute)| DatabaseCapability { read, write, execute }),
                http: http.map(|(internal, external, allowed_domains)| HttpCapability {
                    internal,
                    external,
                    allowed_domains,
                }),
                system: system.map(|(env, spawn, network)| SystemCapability { env, spawn, network }),
                filesystem: fs.map(|(read, write, temp)| FilesystemCapability { read, write, temp }),
                events: events.map(|(emit, listen)| EventsCapability { emit, listen }),
                ..Default::default()
            })
    }

    fn arb_policy() -> impl Strategy<Value = CapabilityPolicy> {
        (0usize..8, 0usize..8, 0usize..8, any::<[bool; 4]>()).prop_map(
            |(tables, domains, paths, [execute, spawn, network, wildcards])| CapabilityPolicy {
                max_database_tables: tables,
                max_http_domains: domains,
                max_file_paths: paths,
                allow_execute: execute,
                allow_spawn: spawn,
                allow_network: network,
                allow_wildcards: wildcards,
            },
        )
    }

    fn arb_level() -> impl Strategy<Value = CapabilityLevel> {
        (0usize..4).prop_map(|i| CapabilityLevel::ALL[i])
    }

    proptest! {
        #[test]
        fn clamp_never_widens(
            manifest in arb_capabilities(),
            policy in arb_policy(),
            level in arb_level(),
        ) {
            let tpl = template(level);
            let result = clamp(merge(tpl.clone(), manifest.clone()), &policy, "p");

            // Nothing outside manifest ∪ template.
            let widest = merge(tpl, manifest);
            prop_assert!(covers(&widest, &result));
            if let (Some(r), Some(w)) = (&result.database, &widest.database) {
                prop_assert!(r.read.iter().all(|t| w.read.contains(t)));
                prop_assert!(r.write.iter().all(|t| w.write.contains(t)));
                prop_assert!(r.read.len() <= policy.max_database_tables);
                prop_assert!(r.write.len() <= policy.max_database_tables);
                prop_assert!(!r.execute || policy.allow_execute);
                if !policy.allow_wildcards {
                    prop_assert!(!r.write.iter().any(|t| t == "*"));
                }
            }
            if let (Some(r), Some(w)) = (&result.http, &widest.http) {
                prop_assert!(r.allowed_domains.iter().all(|d| w.allowed_domains.contains(d)));
                prop_assert!(r.allowed_domains.len() <= policy.max_http_domains);
            }
            if let Some(sys) = &result.system {
                prop_assert!(!sys.spawn || policy.allow_spawn);
                prop_assert!(!sys.network || policy.allow_network);
                if !policy.allow_wildcards {
                    prop_assert!(!sys.env.iter().any(|e| e == "*"));
                }
            }
            if let (Some(r), Some(w)) = (&result.filesystem, &widest.filesystem) {
                prop_assert!(r.read.iter().all(|p| w.read.contains(p)));
                prop_assert!(r.write.iter().all(|p| w.write.contains(p)));
                prop_assert!(r.read.len() <= policy.max_file_paths);
                prop_assert!(r.write.len() <= policy.max_file_paths);
            }
            if let (Some(r), Some(w)) = (&result.events, &widest.events) {
                prop_assert!(r.emit.iter().all(|t| w.emit.contains(t)));
                prop_assert!(r.listen.iter().all(|t| w.listen.contains(t)));
                if !policy.allow_wildcards {
                    prop_assert!(!r.emit.iter().chain(&r.listen).any(|t| t == "*"));
                }
            }
        }

        #[test]
        fn merge_lists_are_deduplicated(manifest in arb_capabilities(), level in arb_level()) {
            let merged = merge(template(level), manifest);
            let unique = |list: &[String]| {
                let mut seen = HashSet::new();
                list.iter().all(|t| seen.insert(t.clone()))
            };
            if let Some(db) = &merged.database {
                prop_assert!(unique(&db.read) && unique(&db.write));
            }
            if let Some(http) = &merged.http {
                prop_assert!(unique(&http.allowed_domains));
            }
            if let Some(fs) = &merged.filesystem {
                prop_assert!(unique(&fs.read) && unique(&fs.write));
            }
            if let Some(events) = &merged.events {
                prop_assert!(unique(&events.emit) && unique(&events.listen));
            }
            if let Some(sys) = &merged.system {
                prop_assert!(unique(&sys.env));
            }
        }
    }
}
