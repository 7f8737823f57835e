use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events emitted by a provider adapter while decoding its wire format.
///
/// This is the provider-facing shape. The stream adapter folds these into
/// the canonical [`Chunk`] sequence consumed by the execution runtime.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text token chunk.
    #[serde(rename = "token")]
    Token { text: String },

    /// A piece of a genuine reasoning trace reported by the model.
    #[serde(rename = "thinking")]
    Thinking { text: String },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// An error occurred during streaming.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Canonical chunk produced by the stream adapter.
///
/// A well-formed sequence is zero or more `Content`/`Thinking` chunks
/// followed by exactly one terminal chunk: `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Chunk {
    /// An incremental text delta of the visible answer.
    Content { text: String },
    /// An incremental delta of a genuine reasoning trace.
    Thinking { text: String },
    /// Terminal: the full answer and aggregated usage.
    Complete { content: String, usage: Usage },
    /// Terminal: a human-readable failure message.
    Error { message: String },
}

impl Chunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Chunk::Complete { .. } | Chunk::Error { .. })
    }
}

/// Token usage for a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Merge a (possibly partial) usage report into this one.
    ///
    /// Providers report usage in pieces (input tokens up front, output
    /// tokens at the end); non-zero fields overwrite.
    pub fn merge(&mut self, other: &Usage) {
        if other.prompt_tokens > 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens > 0 {
            self.completion_tokens = other.completion_tokens;
        }
        self.total_tokens = if other.total_tokens > 0 {
            other.total_tokens.max(self.prompt_tokens + self.completion_tokens)
        } else {
            self.prompt_tokens + self.completion_tokens
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_merge_keeps_prompt_tokens_from_start_frame() {
        let mut u = Usage::new(120, 0);
        u.merge(&Usage {
            prompt_tokens: 0,
            completion_tokens: 40,
            total_tokens: 0,
        });
        assert_eq!(u, Usage::new(120, 40));
    }

    #[test]
    fn usage_serializes_camel_case() {
        let json = serde_json::to_value(Usage::new(1, 2)).unwrap();
        assert_eq!(json["promptTokens"], 1);
        assert_eq!(json["completionTokens"], 2);
        assert_eq!(json["totalTokens"], 3);
    }

    #[test]
    fn terminal_chunks() {
        assert!(Chunk::Error { message: "x".into() }.is_terminal());
        assert!(!Chunk::Content { text: "x".into() }.is_terminal());
    }
}
