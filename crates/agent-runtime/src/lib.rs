//! Agent runtime for delivering messages to lazily created agents
//!
//! This crate provides the [`Registry`] of agent factories and instances, and
//! the [`SingleThreadedAgentRuntime`] that routes messages to them, runs
//! handlers one at a time on a single dispatch task, and drains in-flight work
//! on shutdown.

mod inflight;
pub mod registry;
pub mod runtime;

// Re-export key types
pub use registry::Registry;
pub use runtime::{
    RuntimeBuilder, RuntimeConfig, RuntimeState, SendOptions, SingleThreadedAgentRuntime,
};
