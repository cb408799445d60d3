//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `K8S_NAMESPACE`, `TERMINAL_TEMPLATES_PATH`,
//!    `TERMINAL_IMAGE`, `TERMINAL_PORT`, `TERMINAL_USER`, `TERMINAL_PASSWORD`,
//!    `TERMINAL_HOST`, `QUALIFYD_API_KEY`, `QUALIFYD_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `broker.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! reap_interval_secs = 60
//!
//! [cluster]
//! namespace = "qualifyd-dev"
//! templates_path = "/app/templates"
//! default_image = "qualifyd-terminal:dev"
//! ready_timeout_secs = 120
//! poll_interval_secs = 2
//! poll_attempt_timeout_secs = 5
//! pod_ttl_secs = 7200
//! delete_timeout_secs = 30
//!
//! [ssh]
//! port = 22
//! user = "candidate"
//! password = "password"
//! connect_timeout_secs = 15
//! connect_attempts = 5
//! host_key = "accept-any"   # or a pinned "SHA256:..." fingerprint
//!
//! [terminal]
//! fallback_host = ""        # non-empty enables cluster-less fallback mode
//! heartbeat_interval_secs = 300
//!
//! [auth]
//! api_key = "change-me"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and background-task settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds between idle-reaper sweeps (default 60).
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

/// Cluster access and pod provisioning settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Namespace all terminal pods live in (default `qualifyd-dev`).
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Directory containing pod template manifests (default `/app/templates`).
    #[serde(default = "default_templates_path")]
    pub templates_path: String,
    /// Image used when the client supplies no override. Empty means "keep
    /// whatever the template says".
    #[serde(default)]
    pub default_image: String,
    /// Hard deadline for a pod to become ready, in seconds (default 120).
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Interval between readiness polls, in seconds (default 2).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Timeout for a single readiness poll attempt, in seconds (default 5).
    #[serde(default = "default_poll_attempt_timeout")]
    pub poll_attempt_timeout_secs: u64,
    /// Idle TTL written to the `qualifyd.io/ttl` annotation, in seconds
    /// (default 7200 = 2 h).
    #[serde(default = "default_pod_ttl")]
    pub pod_ttl_secs: u64,
    /// Timeout for an explicit pod deletion, in seconds (default 30).
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_secs: u64,
}

/// SSH connection settings for terminal pods.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// SSH port exposed by terminal pods (default 22).
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user inside the pod (default `candidate`).
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Shared password credential (default `password`; override with
    /// `TERMINAL_PASSWORD`).
    #[serde(default = "default_ssh_password")]
    pub password: String,
    /// Timeout for a single connect attempt, in seconds (default 15).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum connect attempts before giving up (default 5).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Host key verification policy: `accept-any` or a pinned `SHA256:...`
    /// fingerprint. Accept-any is only defensible in trusted development
    /// clusters; a startup warning is logged when it is in effect.
    #[serde(default = "default_host_key")]
    pub host_key: String,
}

/// Terminal session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Fixed terminal host used when the cluster client cannot initialise.
    /// Empty disables fallback mode. Override with `TERMINAL_HOST`.
    #[serde(default)]
    pub fallback_host: String,
    /// Seconds between pod activity heartbeats while a session is active
    /// (default 300).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Authentication settings for the admin REST surface.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `QUALIFYD_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_reap_interval() -> u64 {
    60
}
fn default_namespace() -> String {
    "qualifyd-dev".to_string()
}
fn default_templates_path() -> String {
    "/app/templates".to_string()
}
fn default_ready_timeout() -> u64 {
    120
}
fn default_poll_interval() -> u64 {
    2
}
fn default_poll_attempt_timeout() -> u64 {
    5
}
fn default_pod_ttl() -> u64 {
    2 * 60 * 60
}
fn default_delete_timeout() -> u64 {
    30
}
fn default_ssh_port() -> u16 {
    22
}
fn default_ssh_user() -> String {
    "candidate".to_string()
}
fn default_ssh_password() -> String {
    "password".to_string()
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_connect_attempts() -> u32 {
    5
}
fn default_host_key() -> String {
    "accept-any".to_string()
}
fn default_heartbeat_interval() -> u64 {
    5 * 60
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            templates_path: default_templates_path(),
            default_image: String::new(),
            ready_timeout_secs: default_ready_timeout(),
            poll_interval_secs: default_poll_interval(),
            poll_attempt_timeout_secs: default_poll_attempt_timeout(),
            pod_ttl_secs: default_pod_ttl(),
            delete_timeout_secs: default_delete_timeout(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            user: default_ssh_user(),
            password: default_ssh_password(),
            connect_timeout_secs: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            host_key: default_host_key(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            fallback_host: String::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `broker.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("broker.toml").exists() {
            let content =
                std::fs::read_to_string("broker.toml").expect("Failed to read broker.toml");
            toml::from_str(&content).expect("Failed to parse broker.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                cluster: ClusterConfig::default(),
                ssh: SshConfig::default(),
                terminal: TerminalConfig::default(),
                auth: AuthConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(ns) = std::env::var("K8S_NAMESPACE") {
            config.cluster.namespace = ns;
        }
        if let Ok(path) = std::env::var("TERMINAL_TEMPLATES_PATH") {
            config.cluster.templates_path = path;
        }
        if let Ok(image) = std::env::var("TERMINAL_IMAGE") {
            config.cluster.default_image = image;
        }
        if let Ok(port) = std::env::var("TERMINAL_PORT") {
            if let Ok(port) = port.parse() {
                config.ssh.port = port;
            }
        }
        if let Ok(user) = std::env::var("TERMINAL_USER") {
            config.ssh.user = user;
        }
        if let Ok(password) = std::env::var("TERMINAL_PASSWORD") {
            config.ssh.password = password;
        }
        if let Ok(host) = std::env::var("TERMINAL_HOST") {
            config.terminal.fallback_host = host;
        }
        if let Ok(key) = std::env::var("QUALIFYD_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("QUALIFYD_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cluster.ready_timeout_secs, 120);
        assert_eq!(config.cluster.poll_interval_secs, 2);
        assert_eq!(config.cluster.pod_ttl_secs, 7200);
        assert_eq!(config.ssh.connect_attempts, 5);
        assert_eq!(config.ssh.host_key, "accept-any");
        assert_eq!(config.terminal.heartbeat_interval_secs, 300);
        assert!(config.terminal.fallback_host.is_empty());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cluster]
            namespace = "assessments"

            [ssh]
            user = "shell"
            host_key = "SHA256:nThbg6kXUpJWGl7E1IGOCspRomTxdCARLviKw6E5SY8"
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.namespace, "assessments");
        assert_eq!(config.cluster.templates_path, "/app/templates");
        assert_eq!(config.ssh.user, "shell");
        assert!(config.ssh.host_key.starts_with("SHA256:"));
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.server.reap_interval_secs, 60);
    }
}
