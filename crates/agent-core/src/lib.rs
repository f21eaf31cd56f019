//! Core abstractions for the agent-rs actor runtime
//!
//! This crate defines the value types and traits shared by every runtime:
//! agent identifiers, type-erased messages, the per-dispatch
//! [`MessageContext`], the [`Agent`] trait with its [`Handlers`] routing
//! table, and the error taxonomy.

pub mod agent;
pub mod context;
pub mod error;
pub mod handler;
pub mod id;
pub mod message;

pub use agent::Agent;
pub use context::{MessageContext, MessageSender, Metadata, OutboundMessage};
pub use error::{BoxError, Error, Result};
pub use handler::{AgentInstance, HandlerFuture, Handlers, bind};
pub use id::{AgentId, AgentType};
pub use message::AnyMessage;

pub use tokio_util::sync::CancellationToken;
