//! Server configuration loaded from a JSON document.
//!
//! The configuration mirrors the sections consumed at startup: per-tool
//! settings (path separators), database backend selection, server ports and
//! timeouts, authorization, audit logging, and the user list. The document is
//! loaded once and shared as an `Arc<DepiConfig>` for the lifetime of the
//! process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{DepiError, Result};

/// Environment variable naming an alternate configuration file.
pub const DEPI_CONFIG_ENV_VAR: &str = "DEPI_CONFIG";

const DEFAULT_PATH_SEPARATOR: &str = "/";

/// Per-tool settings. Tools differ mainly in how resource URLs nest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Separator used for folder-prefix matching of resource URLs.
    #[serde(rename = "pathSeparator", default = "default_separator")]
    pub path_separator: String,
}

fn default_separator() -> String {
    DEFAULT_PATH_SEPARATOR.to_string()
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            path_separator: default_separator(),
        }
    }
}

/// Which storage backend services the branch catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    /// In-memory state with numbered JSON snapshots per branch.
    #[default]
    Memjson,
    /// Relational store over SQLite.
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    #[serde(rename = "type", default)]
    pub kind: DbKind,
    /// Snapshot backend: directory holding per-branch snapshot files.
    #[serde(rename = "stateDir", default = "default_state_dir")]
    pub state_dir: String,
    /// Relational backend: sqlx connection URL.
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(rename = "pool_size", default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_state_dir() -> String {
    ".state".to_string()
}

fn default_db_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_pool_size() -> u32 {
    10
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            kind: DbKind::default(),
            state_dir: default_state_dir(),
            url: default_db_url(),
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_insecure_port")]
    pub insecure_port: u16,
    /// TLS port and material are accepted for deployment tooling; the binary
    /// itself only serves the insecure port and expects a fronting proxy to
    /// terminate TLS.
    #[serde(default)]
    pub secure_port: u16,
    #[serde(default)]
    pub key_pem: Option<String>,
    #[serde(default)]
    pub cert_pem: Option<String>,
    #[serde(default)]
    pub authorization_enabled: bool,
    /// Seconds of inactivity before the sweeper closes a session.
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

fn default_insecure_port() -> u16 {
    5150
}

fn default_session_timeout() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            insecure_port: default_insecure_port(),
            secure_port: 0,
            key_pem: None,
            cert_pem: None,
            authorization_enabled: false,
            session_timeout: default_session_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// Rule-bundle definitions referenced by name from user `auth_rules`.
    #[serde(default)]
    pub auth_def_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory for daily audit files. Empty disables auditing.
    #[serde(default = "default_audit_dir")]
    pub directory: String,
}

fn default_audit_dir() -> String {
    "audit_logs".to_string()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: default_audit_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    /// Capability specs (`"CapResourceRead(git,*,*)"`) or rule-bundle names.
    #[serde(default)]
    pub auth_rules: Vec<String>,
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DepiConfig {
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub authorization: AuthConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl DepiConfig {
    /// Load a configuration document from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            DepiError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            DepiError::Config(format!("cannot parse config {}: {}", path.display(), e))
        })?;
        Ok(config)
    }

    /// Path separator for `tool_id`, falling back to `/` for unknown tools.
    pub fn path_separator(&self, tool_id: &str) -> &str {
        self.tools
            .get(tool_id)
            .map(|t| t.path_separator.as_str())
            .unwrap_or(DEFAULT_PATH_SEPARATOR)
    }

    /// The set of tool ids a session may log in with, beyond the built-in
    /// `cli` and `blackboard` pseudo-tools.
    pub fn known_tool(&self, tool_id: &str) -> bool {
        tool_id == "cli" || tool_id == "blackboard" || self.tools.contains_key(tool_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let doc = r##"{
            "tools": {"git": {"pathSeparator": "/"}, "webgme": {"pathSeparator": "#"}},
            "db": {"type": "memjson", "stateDir": "/tmp/depi-state"},
            "server": {"insecure_port": 5150, "authorization_enabled": true, "session_timeout": 120},
            "audit": {"directory": ""},
            "users": [{"name": "mark", "password": "mark", "auth_rules": ["CapResourceRead(*,*,*)"]}]
        }"##;
        let config: DepiConfig = serde_json::from_str(doc).unwrap();
        assert_eq!(config.path_separator("git"), "/");
        assert_eq!(config.path_separator("webgme"), "#");
        assert_eq!(config.path_separator("unknown"), "/");
        assert!(config.server.authorization_enabled);
        assert_eq!(config.server.session_timeout, 120);
        assert_eq!(config.users.len(), 1);
        assert!(config.known_tool("git"));
        assert!(config.known_tool("cli"));
        assert!(!config.known_tool("svn"));
    }

    #[test]
    fn defaults_apply() {
        let config: DepiConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.db.kind, DbKind::Memjson);
        assert_eq!(config.server.insecure_port, 5150);
        assert_eq!(config.server.session_timeout, 3600);
        assert!(!config.server.authorization_enabled);
    }
}
