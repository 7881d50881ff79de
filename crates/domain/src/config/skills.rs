use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Agent workspaces.  Each one is scanned for `skills/<name>/SKILL.md`.
    #[serde(default = "d_workspaces")]
    pub workspaces: Vec<PathBuf>,
    /// Timeout of the remote bin probe sent to a node.
    #[serde(default = "d_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            workspaces: d_workspaces(),
            probe_timeout_ms: d_probe_timeout(),
        }
    }
}

fn d_workspaces() -> Vec<PathBuf> {
    vec![PathBuf::from("./workspace")]
}
fn d_probe_timeout() -> u64 {
    15_000
}
