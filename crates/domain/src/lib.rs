//! Shared types for ChainStream: errors, streaming chunks, provider
//! messages, agent steps and supervisor turns, configuration, pricing and
//! structured trace events.

pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod pricing;
pub mod step;
pub mod stream;
pub mod trace;
