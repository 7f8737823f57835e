use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Model that writes the supervisor reply.
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_2048")]
    pub max_tokens: u32,
    /// Prior exchanges of an agent replayed into a delegated prompt.
    #[serde(default = "d_10")]
    pub history_turns: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            model: d_model(),
            max_tokens: 2048,
            history_turns: 10,
        }
    }
}

fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_2048() -> u32 {
    2048
}
fn d_10() -> usize {
    10
}
