//! Routing messages to handlers by concrete type
//!
//! [`Handlers`] is the per-instance table an [`Agent`] builds once. Each entry
//! is keyed by the [`TypeId`] of a message type and holds a type-erased
//! closure. [`bind`] pairs an agent with its table behind the object-safe
//! [`AgentInstance`] trait, which is what the runtime stores and dispatches to.

use crate::{Agent, AgentId, AnyMessage, Error, MessageContext, Result};
use futures::future::BoxFuture;
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Future produced by a routed handler
///
/// Resolves to `None` when the handler produces no response.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Option<AnyMessage>>>;

type ErasedHandler<A> =
    Box<dyn Fn(Arc<A>, AnyMessage, MessageContext) -> HandlerFuture + Send + Sync>;

struct Route<A> {
    message_type: &'static str,
    handler: ErasedHandler<A>,
}

/// Message-type to handler table for agents of type `A`
///
/// Registering a second handler for the same message type replaces the first.
pub struct Handlers<A> {
    routes: HashMap<TypeId, Route<A>>,
}

impl<A> Default for Handlers<A> {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }
}

impl<A: Send + Sync + 'static> Handlers<A> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler that answers messages of type `M` with an `R`
    pub fn on<M, R, F, Fut>(mut self, handler: F) -> Self
    where
        M: Send + 'static,
        R: Send + 'static,
        F: Fn(Arc<A>, M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.insert::<M>(Box::new(
            move |agent: Arc<A>, message: AnyMessage, ctx: MessageContext| -> HandlerFuture {
                match message.downcast::<M>() {
                    Ok(message) => {
                        let fut = handler(agent, message, ctx);
                        Box::pin(async move {
                            Ok::<_, anyhow::Error>(Some(AnyMessage::new(fut.await?)))
                        })
                    }
                    Err(other) => mismatched::<M>(&other),
                }
            },
        ));
        self
    }

    /// Bind a handler for `M` that produces no response
    ///
    /// Such a handler can only be reached by fire-and-forget sends; a
    /// response-expecting send fails with [`Error::NoResponseProduced`].
    pub fn on_notify<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: Send + 'static,
        F: Fn(Arc<A>, M, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.insert::<M>(Box::new(
            move |agent: Arc<A>, message: AnyMessage, ctx: MessageContext| -> HandlerFuture {
                match message.downcast::<M>() {
                    Ok(message) => {
                        let fut = handler(agent, message, ctx);
                        Box::pin(async move {
                            fut.await?;
                            Ok::<_, anyhow::Error>(None)
                        })
                    }
                    Err(other) => mismatched::<M>(&other),
                }
            },
        ));
        self
    }

    /// Check whether a handler is bound for `M`
    pub fn handles<M: 'static>(&self) -> bool {
        self.routes.contains_key(&TypeId::of::<M>())
    }

    /// Type names of all bound message types
    pub fn message_types(&self) -> Vec<&'static str> {
        self.routes.values().map(|route| route.message_type).collect()
    }

    /// Number of bound message types
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if no handler is bound
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn insert<M: 'static>(&mut self, handler: ErasedHandler<A>) {
        self.routes.insert(
            TypeId::of::<M>(),
            Route {
                message_type: type_name::<M>(),
                handler,
            },
        );
    }
}

// Routes are keyed by TypeId, so a mismatch here means the table is corrupt.
fn mismatched<M>(other: &AnyMessage) -> HandlerFuture {
    let error = anyhow::anyhow!(
        "handler for {} received {}",
        type_name::<M>(),
        other.type_name()
    );
    Box::pin(async move { Err::<Option<AnyMessage>, _>(error) })
}

/// An agent instance as seen by the runtime
pub trait AgentInstance: Send + Sync {
    /// Id this instance was created for
    fn id(&self) -> &AgentId;

    /// Description reported by the agent
    fn description(&self) -> &str;

    /// Check whether a handler is bound for the given message type
    fn handles(&self, message_type: TypeId) -> bool;

    /// Select the handler for the message's concrete type and start it
    ///
    /// Fails with [`Error::NoHandlerForMessageType`] before anything runs when
    /// no handler is bound.
    fn dispatch(&self, message: AnyMessage, ctx: MessageContext) -> Result<HandlerFuture>;

    /// The agent itself, for typed access
    fn as_any(&self) -> Arc<dyn Any + Send + Sync>;
}

struct BoundAgent<A> {
    id: AgentId,
    agent: Arc<A>,
    handlers: Handlers<A>,
}

impl<A: Agent> AgentInstance for BoundAgent<A> {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn description(&self) -> &str {
        self.agent.description()
    }

    fn handles(&self, message_type: TypeId) -> bool {
        self.handlers.routes.contains_key(&message_type)
    }

    fn dispatch(&self, message: AnyMessage, ctx: MessageContext) -> Result<HandlerFuture> {
        let Some(route) = self.handlers.routes.get(&message.type_id()) else {
            return Err(Error::NoHandlerForMessageType {
                agent: self.id.clone(),
                message_type: message.type_name(),
            });
        };
        Ok((route.handler)(self.agent.clone(), message, ctx))
    }

    fn as_any(&self) -> Arc<dyn Any + Send + Sync> {
        self.agent.clone()
    }
}

/// Pair a freshly built agent with its handler table
pub fn bind<A: Agent>(id: AgentId, agent: A) -> Arc<dyn AgentInstance> {
    let handlers = agent.handlers();
    Arc::new(BoundAgent {
        id,
        agent: Arc::new(agent),
        handlers,
    })
}
