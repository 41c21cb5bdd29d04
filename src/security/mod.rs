//! Static pre-execution scanning and post-execution compliance checks.
//!
//! `SecurityPolicy::validate` classifies a payload by matching regex
//! heuristics against its source text. It never fails: every outcome is a
//! structured `ValidationResult`. The scan is a coarse filter; the worker
//! boundary and the capability façades are what actually confine plugins.

mod patterns;
pub mod wrapper;

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use patterns::{compile_regex, compile_table, Rule};

/// Payloads larger than this raise a warning.
const LARGE_PAYLOAD_BYTES: usize = 100 * 1024;

/// More call sites than this raise a warning.
const MAX_CALL_SITES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        })
    }
}

/// Declared language of a payload. JavaScript and TypeScript are the
/// primary languages; others get an extra language-specific pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    #[default]
    JavaScript,
    TypeScript,
    Python,
    /// Line-oriented scripts for the builtin runtime.
    Plain,
}

impl ScriptLanguage {
    pub fn is_primary(self) -> bool {
        matches!(self, ScriptLanguage::JavaScript | ScriptLanguage::TypeScript)
    }
}

impl FromStr for ScriptLanguage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(ScriptLanguage::JavaScript),
            "typescript" | "ts" => Ok(ScriptLanguage::TypeScript),
            "python" | "py" => Ok(ScriptLanguage::Python),
            "plain" | "script" => Ok(ScriptLanguage::Plain),
            other => Err(anyhow::anyhow!("unknown script language '{other}'")),
        }
    }
}

/// What the isolation layer does with a medium-risk payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Run medium-risk payloads unchanged, reject high-risk ones.
    #[default]
    Reject,
    /// Wrap medium-risk payloads with guards, reject high-risk ones.
    Mitigate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicyOptions {
    pub max_execution_time_ms: u64,
    pub max_memory_bytes: u64,
    pub max_cpu_time_ms: u64,
    pub max_output_size: usize,

    pub allow_network: bool,
    pub allow_file_system: bool,
    pub allow_child_process: bool,

    pub allowed_modules: Vec<String>,
    pub blocked_modules: Vec<String>,
    pub allowed_apis: Vec<String>,
    pub blocked_apis: Vec<String>,
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,

    pub max_loops: u64,
    pub max_recursion: u32,
    pub max_array_size: usize,
    pub max_string_length: usize,

    pub mode: EnforcementMode,
}

impl Default for SecurityPolicyOptions {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 5_000,
            max_memory_bytes: 128 * 1024 * 1024,
            max_cpu_time_ms: 5_000,
            max_output_size: 1024 * 1024,
            allow_network: false,
            allow_file_system: false,
            allow_child_process: false,
            allowed_modules: Vec::new(),
            blocked_modules: [
                "fs",
                "child_process",
                "cluster",
                "net",
                "dgram",
                "tls",
                "http",
                "https",
                "http2",
                "vm",
                "v8",
                "worker_threads",
                "os",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_apis: Vec::new(),
            blocked_apis: ["eval", "WebAssembly", "globalThis"]
                .into_iter()
                .map(String::from)
                .collect(),
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            max_loops: 100_000,
            max_recursion: 1_000,
            max_array_size: 1_000_000,
            max_string_length: 1_000_000,
            mode: EnforcementMode::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub allowed: bool,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
    pub risk: RiskLevel,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            allowed: true,
            reasons: Vec::new(),
            warnings: Vec::new(),
            risk: RiskLevel::Low,
        }
    }

    fn block(&mut self, reason: String) {
        self.allowed = false;
        self.risk = RiskLevel::High;
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }

    fn warn(&mut self, warning: String) {
        self.risk = self.risk.max(RiskLevel::Medium);
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }
}

/// Observed usage of one execution, checked against the policy ceilings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
    pub cpu_time_ms: u64,
    pub output_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub violations: Vec<String>,
}

/// Compiled rule sets for one options snapshot.
#[derive(Debug, Clone)]
struct RuleSet {
    dangerous: Vec<Rule>,
    suspicious: Vec<Rule>,
    python: Vec<Rule>,
    require_import: Regex,
    es_import: Regex,
    python_import: Regex,
    /// `None` when no API is blocked.
    blocked_api: Option<Regex>,
    url_host: Regex,
    large_array: Regex,
    large_repeat: Regex,
    call_site: Regex,
    blocked_modules: Vec<String>,
}

impl RuleSet {
    fn compile(options: &SecurityPolicyOptions) -> Self {
        let mut dangerous = compile_table(patterns::DANGEROUS);
        let mut python = compile_table(patterns::PYTHON_DANGEROUS);
        if !options.allow_network {
            dangerous.extend(compile_table(patterns::NETWORK));
            python.extend(compile_table(patterns::PYTHON_NETWORK));
        }
        if !options.allow_file_system {
            dangerous.extend(compile_table(patterns::FILESYSTEM));
            python.extend(compile_table(patterns::PYTHON_FILESYSTEM));
        }
        if !options.allow_child_process {
            dangerous.extend(compile_table(patterns::CHILD_PROCESS));
        }

        let blocked_apis: Vec<String> = options
            .blocked_apis
            .iter()
            .filter(|api| !options.allowed_apis.contains(*api))
            .map(|api| regex::escape(api))
            .collect();
        let blocked_api = (!blocked_apis.is_empty())
            .then(|| compile_regex(&format!(r"\b(?:{})\b", blocked_apis.join("|"))));

        // Flags unlock the modules they cover.
        let unlocked = |module: &str| {
            (options.allow_network && patterns::NETWORK_MODULES.contains(&module))
                || (options.allow_file_system && patterns::FILESYSTEM_MODULES.contains(&module))
                || (options.allow_child_process
                    && patterns::CHILD_PROCESS_MODULES.contains(&module))
        };
        let blocked_modules = options
            .blocked_modules
            .iter()
            .filter(|m| !unlocked(m.as_str()) && !options.allowed_modules.contains(*m))
            .cloned()
            .collect();

        Self {
            dangerous,
            suspicious: compile_table(patterns::SUSPICIOUS),
            python,
            require_import: compile_regex(patterns::REQUIRE_IMPORT),
            es_import: compile_regex(patterns::ES_IMPORT),
            python_import: compile_regex(patterns::PYTHON_IMPORT),
            blocked_api,
            url_host: compile_regex(patterns::URL_HOST),
            large_array: compile_regex(patterns::LARGE_ARRAY),
            large_repeat: compile_regex(patterns::LARGE_REPEAT),
            call_site: compile_regex(patterns::CALL_SITE),
            blocked_modules,
        }
    }
}

/// Risk classifier for plugin payloads. Cheap to clone; immutable once
/// built. `update_options` swaps in a fully recompiled rule set.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    options: SecurityPolicyOptions,
    rules: RuleSet,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self::new(SecurityPolicyOptions::default())
    }
}

impl SecurityPolicy {
    pub fn new(options: SecurityPolicyOptions) -> Self {
        let rules = RuleSet::compile(&options);
        Self { options, rules }
    }

    pub fn options(&self) -> &SecurityPolicyOptions {
        &self.options
    }

    /// Replaces the options. The new rule set is compiled before the swap,
    /// so the policy is never observed half-updated.
    pub fn update_options(&mut self, options: SecurityPolicyOptions) {
        let rules = RuleSet::compile(&options);
        self.options = options;
        self.rules = rules;
    }

    /// Derived policy with `f` applied to a copy of the options.
    pub fn with_options(&self, f: impl FnOnce(&mut SecurityPolicyOptions)) -> Self {
        let mut options = self.options.clone();
        f(&mut options);
        Self::new(options)
    }

    /// Scans `script` and returns the verdict.
    pub fn validate(&self, script: &str, language: ScriptLanguage) -> ValidationResult {
        let mut result = ValidationResult::new();
        let rules = &self.rules;

        for rule in &rules.dangerous {
            if rule.regex.is_match(script) {
                result.block(rule.reason.to_string());
            }
        }
        if language == ScriptLanguage::Python {
            for rule in &rules.python {
                if rule.regex.is_match(script) {
                    result.block(rule.reason.to_string());
                }
            }
        }

        for rule in &rules.suspicious {
            if rule.regex.is_match(script) {
                result.warn(rule.reason.to_string());
            }
        }

        for module in self.imported_modules(script, language) {
            if self.is_module_blocked(&module) {
                result.block(format!("Blocked module import: {module}"));
            }
        }

        if let Some(blocked_api) = &rules.blocked_api {
            for m in blocked_api.find_iter(script) {
                result.block(format!("Blocked API reference: {}", m.as_str()));
            }
        }

        for caps in rules.url_host.captures_iter(script) {
            let host = caps[1].to_ascii_lowercase();
            let listed = |list: &[String]| {
                list.iter()
                    .any(|pattern| crate::capabilities::domain_matches(pattern, &host))
            };
            if listed(&self.options.blocked_domains) {
                result.block(format!("Reference to blocked domain: {host}"));
            } else if !self.options.allowed_domains.is_empty() && !listed(&self.options.allowed_domains) {
                result.warn(format!("Reference to domain outside allowlist: {host}"));
            }
        }

        self.apply_heuristics(script, language, &mut result);

        debug!(
            "Scanned {} bytes ({language:?}): allowed={}, risk={}",
            script.len(),
            result.allowed,
            result.risk
        );
        result
    }

    /// Size and structure heuristics. Only ever warn.
    fn apply_heuristics(&self, script: &str, language: ScriptLanguage, result: &mut ValidationResult) {
        if script.len() > LARGE_PAYLOAD_BYTES {
            result.warn(format!("Large payload ({} bytes)", script.len()));
        }
        if script.len() > self.options.max_string_length {
            result.warn(format!(
                "Payload exceeds maxStringLength ({} > {})",
                script.len(),
                self.options.max_string_length
            ));
        }

        for caps in self.rules.large_array.captures_iter(script) {
            if caps[1].parse::<u128>().is_ok_and(|n| n > self.options.max_array_size as u128) {
                result.warn(format!("Very large array allocation ({})", &caps[1]));
            }
        }
        for caps in self.rules.large_repeat.captures_iter(script) {
            if caps[1].parse::<u128>().is_ok_and(|n| n > self.options.max_string_length as u128) {
                result.warn(format!("Very large string repeat ({})", &caps[1]));
            }
        }

        if language.is_primary() {
            let depth = max_loop_nesting(script);
            if depth >= 2 {
                result.warn(format!("Nested loops detected (depth {depth})"));
            }
        }

        let call_sites = self.rules.call_site.find_iter(script).count();
        if call_sites > MAX_CALL_SITES {
            result.warn(format!("Excessive call sites ({call_sites})"));
        }
    }

    fn imported_modules(&self, script: &str, language: ScriptLanguage) -> Vec<String> {
        let mut modules = Vec::new();
        let mut push = |raw: &str| {
            let name = raw.strip_prefix("node:").unwrap_or(raw);
            let root = if language == ScriptLanguage::Python {
                name.split('.').next().unwrap_or(name)
            } else {
                name.split('/').next().unwrap_or(name)
            };
            if !modules.iter().any(|m| m == root) {
                modules.push(root.to_string());
            }
        };

        if language == ScriptLanguage::Python {
            for caps in self.rules.python_import.captures_iter(script) {
                if let Some(m) = caps.get(1).or_else(|| caps.get(2)) {
                    push(m.as_str());
                }
            }
        } else {
            for caps in self.rules.require_import.captures_iter(script) {
                push(&caps[1]);
            }
            for caps in self.rules.es_import.captures_iter(script) {
                push(&caps[1]);
            }
        }
        modules
    }

    fn is_module_blocked(&self, module: &str) -> bool {
        if self.rules.blocked_modules.iter().any(|m| m == module) {
            return true;
        }
        // Relative imports are the plugin's own files.
        let external = !module.starts_with('.');
        external
            && !self.options.allowed_modules.is_empty()
            && !self.options.allowed_modules.iter().any(|m| m == module)
    }

    /// Compares observed usage against the ceilings.
    pub fn check_compliance(&self, metrics: &RuntimeMetrics) -> ComplianceReport {
        let o = &self.options;
        let mut violations = Vec::new();
        if metrics.execution_time_ms > o.max_execution_time_ms {
            violations.push(format!(
                "executionTime {}ms exceeds maxExecutionTime {}ms",
                metrics.execution_time_ms, o.max_execution_time_ms
            ));
        }
        if metrics.memory_used_bytes > o.max_memory_bytes {
            violations.push(format!(
                "memoryUsed {} bytes exceeds maxMemory {} bytes",
                metrics.memory_used_bytes, o.max_memory_bytes
            ));
        }
        if metrics.cpu_time_ms > o.max_cpu_time_ms {
            violations.push(format!(
                "cpuTime {}ms exceeds maxCPU {}ms",
                metrics.cpu_time_ms, o.max_cpu_time_ms
            ));
        }
        if metrics.output_size > o.max_output_size {
            violations.push(format!(
                "outputSize {} bytes exceeds maxOutputSize {} bytes",
                metrics.output_size, o.max_output_size
            ));
        }
        ComplianceReport {
            compliant: violations.is_empty(),
            violations,
        }
    }

    /// See [`wrapper::sanitize_code`].
    pub fn sanitize_code(&self, code: &str) -> String {
        wrapper::sanitize_code(code)
    }

    /// See [`wrapper::generate_safe_wrapper`].
    pub fn generate_safe_wrapper(&self, code: &str) -> String {
        wrapper::generate_safe_wrapper(code, &self.options)
    }
}

/// Deepest nesting of `for`/`while`/`do` blocks, by brace tracking.
/// Strings and comments are not skipped; this is a heuristic.
fn max_loop_nesting(script: &str) -> usize {
    let bytes = script.as_bytes();
    let mut stack: Vec<bool> = Vec::new();
    let mut pending_loop = false;
    let mut parens = 0usize;
    let mut max_depth = 0;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_alphabetic() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let preceded_by_ident = start > 0
                && (bytes[start - 1].is_ascii_alphanumeric()
                    || bytes[start - 1] == b'_'
                    || bytes[start - 1] == b'$'
                    || bytes[start - 1] == b'.');
            if !preceded_by_ident && matches!(&script[start..i], "for" | "while" | "do") {
                pending_loop = true;
            }
            continue;
        }
        match c {
            b'{' => {
                stack.push(pending_loop);
                if pending_loop {
                    let depth = stack.iter().filter(|is_loop| **is_loop).count();
                    max_depth = max_depth.max(depth);
                }
                pending_loop = false;
            }
            b'}' => {
                stack.pop();
            }
            b'(' => parens += 1,
            b')' => parens = parens.saturating_sub(1),
            b';' if parens == 0 => pending_loop = false,
            _ => {}
        }
        i += 1;
    }
    max_depth
}
