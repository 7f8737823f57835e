use serde::Serialize;

/// Structured trace events emitted across all ChainStream crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    LlmRequest {
        provider: String,
        model: String,
        step_id: Option<String>,
        duration_ms: u64,
        prompt_tokens: u32,
        completion_tokens: u32,
        ok: bool,
    },
    StepCompleted {
        step_id: String,
        model: String,
        duration_ms: u64,
        estimated_cost: Option<f64>,
        skipped: bool,
        error: Option<String>,
    },
    PersistenceDrain {
        taken: usize,
        writes: usize,
        failed: usize,
    },
    SupervisorTurn {
        turn_id: String,
        session_id: String,
        mentions: usize,
        invalid_mentions: usize,
        failed: usize,
        duration_ms: u64,
    },
    SessionCreated {
        session_id: String,
        steps: usize,
    },
    SessionDeleted {
        session_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "cs_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_is_variant_name() {
        let ev = TraceEvent::PersistenceDrain {
            taken: 10,
            writes: 1,
            failed: 0,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "PersistenceDrain");
        assert_eq!(json["writes"], 1);
    }
}
