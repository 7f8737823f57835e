pub mod adapter;
pub mod anthropic;
pub mod google;
pub mod openai_compat;
pub mod registry;
pub mod traits;
pub(crate) mod sse;
pub(crate) mod util;

// Re-exports for convenience.
pub use adapter::{StreamAdapter, StreamRequest};
pub use registry::ProviderRegistry;
pub use traits::{ChatRequest, ClaudeOptions, GrokOptions, LlmProvider, ProviderOptions};
pub use util::resolve_api_key;
