//! Strict schema validation for raw capability manifests.
//!
//! Structural checks (types, unknown keys) come from the `deny_unknown_fields`
//! serde model; value checks (identifier syntax, path shape) are done here
//! and reported together so an operator sees every problem at once.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::{PluginCapabilities, WILDCARD};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
});

static DOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    compile_regex(r"^(\*\.)?[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)*$")
});

static TOPIC: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*(\.\*)?$"));

static ENV_NAME: LazyLock<Regex> = LazyLock::new(|| compile_regex(r"^[A-Za-z_][A-Za-z0-9_]*$"));

fn compile_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(regex) => regex,
        // Covered by `test_patterns_compile`
        Err(err) => panic!("invalid regex pattern `{pattern}`: {err}"),
    }
}

/// Parses and validates a raw manifest. `null` is read as an empty grant.
///
/// Returns the normalized capabilities, or every diagnostic found.
pub fn validate_manifest(raw: &Value) -> Result<PluginCapabilities, Vec<String>> {
    let raw = match raw {
        Value::Null => return Ok(PluginCapabilities::default()),
        Value::Object(_) => raw,
        other => {
            return Err(vec![format!(
                "capabilities must be an object, got {}",
                json_type(other)
            )])
        }
    };

    let caps: PluginCapabilities = serde_json::from_value(raw.clone()).map_err(|e| vec![e.to_string()])?;

    let mut diagnostics = Vec::new();

    if let Some(db) = &caps.database {
        check_all(&mut diagnostics, "database.read", &db.read, is_table_name);
        check_all(&mut diagnostics, "database.write", &db.write, is_table_name);
    }
    if let Some(http) = &caps.http {
        check_all(&mut diagnostics, "http.allowedDomains", &http.allowed_domains, |d| {
            d == WILDCARD || (d.len() <= 253 && DOMAIN.is_match(d))
        });
    }
    if let Some(fs) = &caps.filesystem {
        check_all(&mut diagnostics, "filesystem.read", &fs.read, is_valid_root);
        check_all(&mut diagnostics, "filesystem.write", &fs.write, is_valid_root);
    }
    if let Some(events) = &caps.events {
        check_all(&mut diagnostics, "events.emit", &events.emit, is_topic);
        check_all(&mut diagnostics, "events.listen", &events.listen, is_topic);
    }
    if let Some(system) = &caps.system {
        check_all(&mut diagnostics, "system.env", &system.env, |n| ENV_NAME.is_match(n));
    }

    if diagnostics.is_empty() {
        Ok(caps.normalized())
    } else {
        Err(diagnostics)
    }
}

fn check_all(diagnostics: &mut Vec<String>, field: &str, values: &[String], valid: impl Fn(&str) -> bool) {
    for value in values {
        if !valid(value) {
            diagnostics.push(format!("{field}: invalid entry '{value}'"));
        }
    }
}

fn is_table_name(name: &str) -> bool {
    name == WILDCARD || IDENTIFIER.is_match(name)
}

fn is_topic(topic: &str) -> bool {
    topic == WILDCARD || TOPIC.is_match(topic)
}

/// Absolute, no `..`, no NUL.
fn is_valid_root(path: &str) -> bool {
    let p = Path::new(path);
    !path.contains('\0')
        && p.is_absolute()
        && !p.components().any(|c| matches!(c, Component::ParentDir))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
