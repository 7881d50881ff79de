mod bridge;
mod observability;
mod pairing;
mod server;
mod skills;

pub use bridge::*;
pub use observability::*;
pub use pairing::*;
pub use server::*;
pub use skills::*;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub voicewake: VoiceWakeConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// UI broadcast
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Per-subscriber outbound queue depth.  A subscriber whose queue is
    /// full is considered slow.
    #[serde(default = "d_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Interval of the periodic health tick.
    #[serde(default = "d_health_interval")]
    pub health_interval_secs: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: d_subscriber_buffer(),
            health_interval_secs: d_health_interval(),
        }
    }
}

fn d_subscriber_buffer() -> usize {
    256
}
fn d_health_interval() -> u64 {
    60
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Voice wake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trigger words pushed to nodes as `voicewake.changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceWakeConfig {
    #[serde(default = "d_triggers")]
    pub triggers: Vec<String>,
}

impl Default for VoiceWakeConfig {
    fn default() -> Self {
        Self {
            triggers: d_triggers(),
        }
    }
}

fn d_triggers() -> Vec<String> {
    vec!["clawd".into(), "claude".into()]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Load a TOML config file.  A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if self.bridge.enabled {
            // Bridge problems are warnings: the gateway runs without
            // remote-node features rather than refusing to start.
            if self.bridge.port == 0 {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "bridge.port".into(),
                    message: "port is 0; the node bridge binds an ephemeral port".into(),
                });
            }
            if self.bridge.bind == BindMode::Custom && self.bridge.resolve_bind_host().is_none() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Warning,
                    field: "bridge.host".into(),
                    message: "bind = \"custom\" requires an IP address in bridge.host".into(),
                });
            }
            if self.bridge.port != 0 && self.bridge.port == self.server.port {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "bridge.port".into(),
                    message: "bridge.port must differ from server.port".into(),
                });
            }
        }

        if self.bridge.invoke_timeout_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "bridge.invoke_timeout_ms".into(),
                message: "invoke timeout must be greater than 0".into(),
            });
        }

        if self.broadcast.subscriber_buffer == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "broadcast.subscriber_buffer".into(),
                message: "subscriber buffer must be greater than 0".into(),
            });
        }

        if self.pairing.auto_approve {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "pairing.auto_approve".into(),
                message: "every pairing request is accepted (not recommended outside development)"
                    .into(),
            });
        }

        if self.skills.workspaces.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "skills.workspaces".into(),
                message: "no skill workspaces configured; remote bin probes are skipped".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let issues = Config::default().validate();
        assert!(
            issues.iter().all(|i| i.severity == ConfigSeverity::Warning),
            "unexpected errors: {issues:?}"
        );
    }

    #[test]
    fn same_port_for_bridge_and_server_is_an_error() {
        let mut cfg = Config::default();
        cfg.bridge.port = cfg.server.port;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "bridge.port" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn custom_bind_without_host_warns() {
        let mut cfg = Config::default();
        cfg.bridge.bind = BindMode::Custom;
        cfg.bridge.host = String::new();
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "bridge.host" && i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn display_formats_severity_tag() {
        let e = ConfigError {
            severity: ConfigSeverity::Warning,
            field: "x".into(),
            message: "y".into(),
        };
        assert_eq!(e.to_string(), "[WARN] x: y");
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.bridge.port, 18790);
    }

    #[test]
    fn load_reports_parse_errors_as_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[bridge\n").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
