use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pairing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    /// JSON file holding paired-node records.  `None` keeps them in memory.
    #[serde(default = "d_store_path")]
    pub store_path: Option<PathBuf>,
    /// Accept every pairing request without operator approval.
    #[serde(default)]
    pub auto_approve: bool,
    /// Pending requests not approved within this window are rejected.
    #[serde(default = "d_request_ttl")]
    pub request_ttl_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            store_path: d_store_path(),
            auto_approve: false,
            request_ttl_secs: d_request_ttl(),
        }
    }
}

fn d_store_path() -> Option<PathBuf> {
    Some(PathBuf::from("./data/paired-nodes.json"))
}
fn d_request_ttl() -> u64 {
    300
}
