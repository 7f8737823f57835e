use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON file holding sessions, steps, turns and history.
    #[serde(default = "d_state_path")]
    pub state_path: PathBuf,
    /// Entries taken per drain; reaching this many pending entries forces
    /// an immediate drain.
    #[serde(default = "d_10")]
    pub batch_size: usize,
    /// Idle delay before a drain starts.
    #[serde(default = "d_50")]
    pub debounce_ms: u64,
    /// How often the store snapshot is written to disk.
    #[serde(default = "d_5")]
    pub flush_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: d_state_path(),
            batch_size: 10,
            debounce_ms: 50,
            flush_interval_secs: 5,
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data/chainstream.json")
}
fn d_10() -> usize {
    10
}
fn d_50() -> u64 {
    50
}
fn d_5() -> u64 {
    5
}
