//! Core Agent trait definition

use crate::Handlers;

/// Core trait that all agents must implement
///
/// An agent is a unit of behavior addressed by an [`AgentId`](crate::AgentId).
/// The runtime builds each instance lazily through the factory registered for
/// its type, then asks it once for its [`Handlers`]: the table that maps each
/// message type the agent understands to the closure handling it.
///
/// Handlers receive the instance as `Arc<Self>`. The runtime does not
/// serialize calls into one instance, so any state shared between handler
/// invocations needs its own synchronization.
///
/// # Example
///
/// ```
/// use agent_core::{Agent, Handlers};
///
/// struct Echo;
///
/// impl Agent for Echo {
///     fn handlers(&self) -> Handlers<Self> {
///         Handlers::new().on(|_agent, message: String, _ctx| async move { Ok(message) })
///     }
/// }
/// ```
pub trait Agent: Send + Sync + Sized + 'static {
    /// Build the routing table for this instance
    ///
    /// Called exactly once, right after the factory returns.
    fn handlers(&self) -> Handlers<Self>;

    /// Short description of what the agent does
    fn description(&self) -> &str {
        ""
    }
}
