use serde::Deserialize;

use crate::capabilities::CapabilityPolicy;
use crate::isolation::IsolationConfig;
use crate::security::SecurityPolicyOptions;

/// Sandbox configuration. Every table is optional; an empty file yields
/// the defaults.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub isolation: IsolationConfig,
    pub security: SecurityPolicyOptions,
    pub capabilities: CapabilityPolicy,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding `${ENV_VAR}` references.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// One-line summary for the startup log.
    pub fn describe(&self) -> String {
        format!(
            "{} worker(s), {}ms timeout, {}MB per worker, {:?} mode",
            self.isolation.max_workers,
            self.isolation.max_execution_time_ms,
            self.isolation.max_memory_mb,
            self.security.mode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::EnforcementMode;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_default() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.isolation.max_workers, 8);
        assert!(config.security.blocked_modules.contains(&"child_process".to_string()));
    }

    #[test]
    fn test_partial_tables_keep_defaults() {
        let config = Config::parse(
            r#"
[isolation]
max_workers = 2
enable_network_isolation = true

[security]
mode = "mitigate"
allowed_domains = ["api.example.com"]

[capabilities]
allow_network = true
"#,
        )
        .unwrap();

        assert_eq!(config.isolation.max_workers, 2);
        assert!(config.isolation.enable_network_isolation);
        assert_eq!(config.isolation.max_execution_time_ms, 5_000);
        assert_eq!(config.security.mode, EnforcementMode::Mitigate);
        assert_eq!(config.security.allowed_domains, vec!["api.example.com"]);
        assert!(config.capabilities.allow_network);
        assert!(!config.capabilities.allow_spawn);
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("PLUGIN_SANDBOX_TEST_WORKERS", "3");
        let config = Config::parse("[isolation]\nmax_workers = ${PLUGIN_SANDBOX_TEST_WORKERS}\n").unwrap();
        assert_eq!(config.isolation.max_workers, 3);
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let err = Config::parse("[isolation]\nmax_workers = ${PLUGIN_SANDBOX_TEST_UNSET_VAR}\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_mode_is_an_error() {
        assert!(Config::parse("[security]\nmode = \"ignore\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[isolation]\nmax_execution_time_ms = 250").unwrap();

        let config = Config::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.isolation.max_execution_time_ms, 250);
        assert!(config.describe().contains("250ms timeout"));
        assert!(Config::load("/nonexistent/sandbox.toml").is_err());
    }
}
