use std::path::PathBuf;

use nb_domain::config::{BindMode, Config};

#[test]
fn default_http_host_is_localhost() {
    let config = Config::default();
    assert_eq!(config.server.host, "127.0.0.1");
}

#[test]
fn default_bridge_listens_on_lan() {
    let config = Config::default();
    assert!(config.bridge.enabled);
    assert_eq!(config.bridge.bind, BindMode::Lan);
    assert_eq!(config.bridge.resolve_bind_host().as_deref(), Some("0.0.0.0"));
}

#[test]
fn full_file_parses() {
    let toml_str = r#"
[server]
port = 9000

[bridge]
enabled = false
bind = "custom"
host = "10.0.0.5"
port = 9001
display_name = "studio"

[pairing]
store_path = "/var/lib/nb/paired.json"
auto_approve = true

[skills]
workspaces = ["/srv/agent-a", "/srv/agent-b"]
probe_timeout_ms = 5000

[broadcast]
subscriber_buffer = 8

[voicewake]
triggers = ["computer"]
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.port, 9000);
    assert!(!config.bridge.enabled);
    assert_eq!(config.bridge.resolve_bind_host().as_deref(), Some("10.0.0.5"));
    assert_eq!(config.bridge.display_name, "studio");
    assert_eq!(
        config.pairing.store_path,
        Some(PathBuf::from("/var/lib/nb/paired.json"))
    );
    assert!(config.pairing.auto_approve);
    assert_eq!(config.skills.workspaces.len(), 2);
    assert_eq!(config.skills.probe_timeout_ms, 5000);
    assert_eq!(config.broadcast.subscriber_buffer, 8);
    assert_eq!(config.voicewake.triggers, vec!["computer".to_string()]);
}

#[test]
fn default_voicewake_triggers_are_set() {
    let config = Config::default();
    assert!(!config.voicewake.triggers.is_empty());
}
