//! Error types for agent-core

use crate::id::AgentId;
use thiserror::Error;

/// Result type alias for agent-core
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed cause carried by [`Error::HandlerFailure`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type for registration, routing and dispatch
///
/// Everything except `HandlerFailure` is detected by the runtime itself at the
/// dispatch boundary. `HandlerFailure` wraps whatever a handler body returned.
#[derive(Error, Debug)]
pub enum Error {
    /// An agent type or key is empty or contains the `/` separator
    #[error("Invalid agent identifier '{value}': {reason}")]
    InvalidIdentifier {
        /// The rejected input
        value: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// The agent type name is already registered with this runtime
    #[error("Agent type '{0}' is already registered")]
    DuplicateRegistration(String),

    /// No factory is registered for the agent type
    #[error("Unknown agent type '{0}'")]
    UnknownAgentType(String),

    /// The agent has no handler bound to the message's concrete type
    #[error("Agent {agent} has no handler for message type {message_type}")]
    NoHandlerForMessageType {
        /// Recipient of the message
        agent: AgentId,
        /// Rust type name of the payload
        message_type: &'static str,
    },

    /// A response-expecting send reached a handler that produces no response
    #[error("Handler for {message_type} on agent {agent} produced no response")]
    NoResponseProduced {
        /// Recipient of the message
        agent: AgentId,
        /// Rust type name of the payload
        message_type: &'static str,
    },

    /// The runtime is not accepting sends
    #[error("Runtime is not running")]
    RuntimeNotRunning,

    /// The handler body returned an error or panicked
    #[error("Handler for {message_type} on agent {agent} failed: {source}")]
    HandlerFailure {
        /// Recipient of the message
        agent: AgentId,
        /// Rust type name of the payload
        message_type: &'static str,
        /// Original cause
        #[source]
        source: BoxError,
    },

    /// The caller's cancellation token fired before a response arrived
    #[error("Send was cancelled")]
    Cancelled,

    /// A typed send received a response of another concrete type
    #[error("Expected response of type {expected}, got {actual}")]
    UnexpectedResponseType {
        /// Type requested by the caller
        expected: &'static str,
        /// Type the handler produced
        actual: &'static str,
    },
}

impl Error {
    /// Wrap a handler error, keeping it as the source
    pub fn handler_failure(
        agent: AgentId,
        message_type: &'static str,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::HandlerFailure {
            agent,
            message_type,
            source: source.into(),
        }
    }

    /// True for errors raised by the runtime rather than by a handler body
    pub fn is_routing_error(&self) -> bool {
        !matches!(self, Self::HandlerFailure { .. } | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_handler_failure_keeps_source() {
        let agent = AgentId::new("echo", "a").unwrap();
        let err = Error::handler_failure(agent, "alloc::string::String", "boom");

        assert!(!err.is_routing_error());
        assert_eq!(err.source().map(ToString::to_string), Some("boom".to_string()));
        assert!(err.to_string().contains("echo/a"));
    }

    #[test]
    fn test_routing_errors() {
        assert!(Error::RuntimeNotRunning.is_routing_error());
        assert!(Error::UnknownAgentType("x".into()).is_routing_error());
        assert!(!Error::Cancelled.is_routing_error());
    }
}
