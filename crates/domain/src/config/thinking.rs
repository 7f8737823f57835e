use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thinking display
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    /// Show scripted thinking phases until the first content arrives.
    /// Genuine reasoning traces are relayed either way.
    #[serde(default = "d_true")]
    pub simulate: bool,
    /// Multiplier applied to every scripted phase duration.
    #[serde(default = "d_scale")]
    pub phase_scale: f64,
    /// Target size of a relayed reasoning piece, in characters.
    #[serde(default = "d_200")]
    pub real_chunk_chars: usize,
}

impl Default for ThinkingConfig {
    fn default() -> Self {
        Self {
            simulate: true,
            phase_scale: 1.0,
            real_chunk_chars: 200,
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_scale() -> f64 {
    1.0
}
fn d_200() -> usize {
    200
}
