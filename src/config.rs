//! Configuration for the proxy.
//!
//! Two layers: a JSON policy file describing the guarded repositories, and
//! runtime settings taken from the process environment.  The pre-receive
//! hook re-reads both from the same sources as the server so that parent
//! and child always agree on policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Policy file
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// SSH private key used for upstream I/O.  `GIT_SSH_KEY_PATH` in the
    /// environment takes precedence over this value.
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    /// Guarded repositories, keyed by logical name.  Names may contain `/`.
    pub repos: HashMap<String, RepoPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoPolicy {
    /// Git-reachable URL of the authoritative remote.
    pub upstream: String,
    /// Glob patterns for paths that must not change relative to the base
    /// branch.  Empty means no path restrictions.
    #[serde(default)]
    pub protected_paths: Vec<String>,
    /// Branch names must match at least one of these patterns.
    /// Mutually exclusive with `blocked_branches`.
    pub allowed_branches: Option<Vec<String>>,
    /// Branch names must match none of these patterns.
    /// Mutually exclusive with `allowed_branches`.
    pub blocked_branches: Option<Vec<String>>,
    #[serde(default)]
    pub force_push: ForcePush,
    /// Comparison base for protected-path diffs.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcePush {
    #[default]
    Deny,
    Allow,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// Load and validate a [`Config`] from a JSON file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Cross-field checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    for (name, policy) in &config.repos {
        anyhow::ensure!(
            !policy.upstream.is_empty(),
            "repo '{name}': upstream must be a non-empty URL"
        );
        anyhow::ensure!(
            policy.allowed_branches.is_some() != policy.blocked_branches.is_some(),
            "repo '{name}': exactly one of allowed_branches or blocked_branches must be set"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Runtime settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the JSON policy file.
    pub config_path: PathBuf,
    /// Root directory holding the bare mirrors.
    pub repos_dir: PathBuf,
    /// HTTP listen port.
    pub http_port: u16,
    pub log_level: LogLevel,
    /// SSH key path from the environment, overriding the policy file.
    pub ssh_key_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => anyhow::bail!("invalid LOG_LEVEL: {other} (expected debug|info|warn|error)"),
        }
    }
}

impl RuntimeConfig {
    /// Read runtime settings from the process environment, falling back to
    /// the documented defaults.
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("GIT_PROXY_CONFIG")
            .unwrap_or_else(|_| "/etc/git-proxy/config.json".to_string());
        let repos_dir = std::env::var("REPOS_DIR")
            .unwrap_or_else(|_| "/var/lib/git-proxy/repos".to_string());

        let http_port = match std::env::var("HTTP_PORT") {
            Ok(raw) => parse_port(&raw)?,
            Err(_) => 8080,
        };

        let log_level = match std::env::var("LOG_LEVEL") {
            Ok(raw) => LogLevel::parse(&raw)?,
            Err(_) => LogLevel::Info,
        };

        Ok(Self {
            config_path: PathBuf::from(config_path),
            repos_dir: PathBuf::from(repos_dir),
            http_port,
            log_level,
            ssh_key_path: std::env::var("GIT_SSH_KEY_PATH").ok(),
        })
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    let port: u32 = raw
        .parse()
        .with_context(|| format!("invalid HTTP_PORT: {raw}"))?;
    anyhow::ensure!(
        (1..=65535).contains(&port),
        "HTTP_PORT must be in 1..=65535, got {port}"
    );
    Ok(port as u16)
}

// ---------------------------------------------------------------------------
// SSH environment
// ---------------------------------------------------------------------------

/// Compute the environment overlay applied to every git invocation that may
/// reach upstream.  The runtime key path wins over the policy-file value;
/// with neither set we rely on an ambient `GIT_SSH_COMMAND` and warn when
/// that is missing too.
pub fn ssh_env(runtime: &RuntimeConfig, config: &Config) -> HashMap<String, String> {
    let key_path = runtime
        .ssh_key_path
        .as_deref()
        .or(config.ssh_key_path.as_deref());

    let mut env = HashMap::new();
    match key_path {
        Some(path) => {
            env.insert(
                "GIT_SSH_COMMAND".to_string(),
                format!(
                    "ssh -i {path} -o StrictHostKeyChecking=accept-new \
                     -o UserKnownHostsFile=/dev/null"
                ),
            );
        }
        None => {
            if std::env::var("GIT_SSH_COMMAND").is_err() {
                tracing::warn!(
                    "no SSH key configured and GIT_SSH_COMMAND not set; \
                     upstream SSH access may fail"
                );
            }
        }
    }
    env
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), json).unwrap();
        file
    }

    #[test]
    fn load_minimal_config() {
        let file = write_config(
            r#"{
                "repos": {
                    "demo": {
                        "upstream": "git@example.com:org/demo.git",
                        "allowed_branches": ["agent/*"]
                    }
                }
            }"#,
        );
        let config = load_config(file.path()).unwrap();
        let policy = &config.repos["demo"];
        assert_eq!(policy.force_push, ForcePush::Deny);
        assert_eq!(policy.base_branch, "main");
        assert!(policy.protected_paths.is_empty());
    }

    #[test]
    fn both_branch_lists_rejected() {
        let file = write_config(
            r#"{
                "repos": {
                    "demo": {
                        "upstream": "git@example.com:org/demo.git",
                        "allowed_branches": ["a"],
                        "blocked_branches": ["b"]
                    }
                }
            }"#,
        );
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn neither_branch_list_rejected() {
        let file = write_config(
            r#"{
                "repos": {
                    "demo": { "upstream": "git@example.com:org/demo.git" }
                }
            }"#,
        );
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn empty_allowed_list_is_valid() {
        // An empty list is still "set"; it admits no branch at all.
        let file = write_config(
            r#"{
                "repos": {
                    "demo": { "upstream": "u", "allowed_branches": [] }
                }
            }"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.repos["demo"].allowed_branches, Some(vec![]));
    }

    #[test]
    fn empty_upstream_rejected() {
        let file = write_config(
            r#"{
                "repos": {
                    "demo": { "upstream": "", "blocked_branches": [] }
                }
            }"#,
        );
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn force_push_allow_parses() {
        let file = write_config(
            r#"{
                "repos": {
                    "demo": {
                        "upstream": "u",
                        "blocked_branches": ["main"],
                        "force_push": "allow",
                        "base_branch": "trunk"
                    }
                }
            }"#,
        );
        let config = load_config(file.path()).unwrap();
        let policy = &config.repos["demo"];
        assert_eq!(policy.force_push, ForcePush::Allow);
        assert_eq!(policy.base_branch, "trunk");
    }

    #[test]
    fn port_bounds() {
        assert_eq!(parse_port("8080").unwrap(), 8080);
        assert_eq!(parse_port("1").unwrap(), 1);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("not-a-port").is_err());
    }

    #[test]
    fn log_level_parse() {
        assert_eq!(LogLevel::parse("warn").unwrap(), LogLevel::Warn);
        assert!(LogLevel::parse("verbose").is_err());
    }
}
