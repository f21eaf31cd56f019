//! Single-threaded agent runtime
//!
//! The runtime owns a [`Registry`], a queue of pending messages and one
//! dispatch task. Sends are queued as envelopes; the dispatch task takes them
//! in order, resolves (or lazily creates) the recipient, selects the handler by
//! the message's concrete type and polls the handler future itself. All
//! handler futures of one runtime are polled by that single task, so at most
//! one handler body runs at any instant while any number may be suspended on
//! nested sends or I/O.
//!
//! Lifecycle: `Created -> Running -> Stopping -> Stopped`, and `Stopped` can be
//! started again. Stopping is a barrier: it waits for every queued and
//! executing message, including nested sends issued by handlers.

use crate::inflight::{InFlight, InFlightGuard};
use crate::registry::Registry;
use agent_core::{
    Agent, AgentId, AgentType, AnyMessage, CancellationToken, Error, MessageContext,
    MessageSender, Metadata, OutboundMessage, Result,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the agent runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name used in log output
    pub name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "agent-runtime".to_string(),
        }
    }
}

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Built but never started
    Created,
    /// Accepting and executing sends
    Running,
    /// Draining in-flight work; only nested sends are accepted
    Stopping,
    /// Drained; accepts registrations and can be started again
    Stopped,
}

/// Options for a top-level send
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Agent to report as the sender
    pub sender: Option<AgentId>,
    /// Token the caller can cancel; a fresh one is used when absent
    pub cancellation: Option<CancellationToken>,
    /// Correlation data for the dispatch and its nested sends
    pub metadata: Metadata,
}

impl SendOptions {
    /// Create default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sender
    pub fn with_sender(mut self, sender: AgentId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Set the metadata
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn into_outbound(self, message: AnyMessage, recipient: AgentId) -> OutboundMessage {
        OutboundMessage {
            message,
            recipient,
            sender: self.sender,
            cancellation: self.cancellation.unwrap_or_default(),
            metadata: self.metadata,
            nested: false,
        }
    }
}

type Reply = oneshot::Sender<Result<AnyMessage>>;

/// A queued message plus where its result goes
struct Envelope {
    outbound: OutboundMessage,
    /// `None` for fire-and-forget sends
    reply: Option<Reply>,
    guard: InFlightGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainMode {
    /// Reject top-level envelopes still waiting in the queue
    RejectQueued,
    /// Let everything already queued run
    CompleteQueued,
}

struct Dispatcher {
    queue: mpsc::UnboundedSender<Envelope>,
    task: JoinHandle<()>,
}

enum Lifecycle {
    Created,
    Running(Dispatcher),
    Stopping(Dispatcher, DrainMode),
    Stopped,
}

struct Inner {
    config: RuntimeConfig,
    registry: Registry,
    lifecycle: Mutex<Lifecycle>,
    in_flight: InFlight,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, outbound: OutboundMessage, reply: Option<Reply>) -> Result<()> {
        let lifecycle = self.lifecycle();
        let queue = match &*lifecycle {
            Lifecycle::Running(dispatcher) => &dispatcher.queue,
            Lifecycle::Stopping(dispatcher, _) if outbound.nested => &dispatcher.queue,
            _ => return Err(Error::RuntimeNotRunning),
        };
        let envelope = Envelope {
            outbound,
            reply,
            guard: self.in_flight.enter(),
        };
        queue.send(envelope).map_err(|_| Error::RuntimeNotRunning)
    }

    async fn request(&self, mut outbound: OutboundMessage) -> Result<AnyMessage> {
        // A child token, so dropping this future cancels the dispatch without
        // touching a token the caller may share with other sends.
        let cancellation = outbound.cancellation.child_token();
        outbound.cancellation = cancellation.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.enqueue(outbound, Some(reply_tx))?;

        let on_drop = cancellation.clone().drop_guard();
        let result = tokio::select! {
            biased;
            // The dispatch task only drops a reply sender when it exits.
            reply = reply_rx => reply.unwrap_or(Err(Error::RuntimeNotRunning)),
            () = cancellation.cancelled() => Err(Error::Cancelled),
        };
        on_drop.disarm();
        result
    }

    /// Whether an envelope taken off the queue may still run
    fn admits(&self, nested: bool) -> bool {
        match &*self.lifecycle() {
            Lifecycle::Running(_) => true,
            Lifecycle::Stopping(_, DrainMode::CompleteQueued) => true,
            Lifecycle::Stopping(_, DrainMode::RejectQueued) => nested,
            Lifecycle::Created | Lifecycle::Stopped => false,
        }
    }
}

/// The handle contexts use for nested sends
///
/// Holds the runtime weakly so in-flight handlers never keep it alive.
struct RuntimeLink(Weak<Inner>);

#[async_trait]
impl MessageSender for RuntimeLink {
    async fn send(&self, outbound: OutboundMessage) -> Result<AnyMessage> {
        let inner = self.0.upgrade().ok_or(Error::RuntimeNotRunning)?;
        inner.request(outbound).await
    }

    fn notify(&self, outbound: OutboundMessage) -> Result<()> {
        let inner = self.0.upgrade().ok_or(Error::RuntimeNotRunning)?;
        inner.enqueue(outbound, None)
    }
}

/// In-process agent runtime with cooperative, single-task dispatch
///
/// Cloning yields another handle to the same runtime.
///
/// # Example
///
/// ```
/// use agent_core::{Agent, AgentId, Handlers};
/// use agent_runtime::SingleThreadedAgentRuntime;
///
/// struct Echo;
///
/// impl Agent for Echo {
///     fn handlers(&self) -> Handlers<Self> {
///         Handlers::new().on(|_agent, message: String, _ctx| async move { Ok(message) })
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> agent_core::Result<()> {
/// let runtime = SingleThreadedAgentRuntime::new();
/// runtime.register_agent_type("echo", |_id: &AgentId| Echo)?;
/// runtime.start();
///
/// let reply: String = runtime
///     .send_message("hi".to_string(), &AgentId::new("echo", "a")?)
///     .await?;
/// assert_eq!(reply, "hi");
///
/// runtime.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SingleThreadedAgentRuntime {
    inner: Arc<Inner>,
}

impl Default for SingleThreadedAgentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedAgentRuntime {
    /// Create a runtime with the default configuration
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a runtime with the given configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Registry::new(),
                lifecycle: Mutex::new(Lifecycle::Created),
                in_flight: InFlight::default(),
            }),
        }
    }

    /// Create a new runtime builder
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Get a reference to the runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Get a reference to the registry
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Current lifecycle state
    pub fn state(&self) -> RuntimeState {
        match &*self.inner.lifecycle() {
            Lifecycle::Created => RuntimeState::Created,
            Lifecycle::Running(_) => RuntimeState::Running,
            Lifecycle::Stopping(..) => RuntimeState::Stopping,
            Lifecycle::Stopped => RuntimeState::Stopped,
        }
    }

    /// Check if the runtime accepts top-level sends
    pub fn is_running(&self) -> bool {
        self.state() == RuntimeState::Running
    }

    /// Number of messages queued or executing
    pub fn pending_count(&self) -> usize {
        self.inner.in_flight.count()
    }

    // =========== Registration ===========

    /// Register a factory for an agent type
    ///
    /// Accepted in every lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRegistration` if the type is already registered and
    /// `InvalidIdentifier` if the name is not a valid agent type.
    pub fn register_agent_type<A, F>(
        &self,
        agent_type: impl Into<String>,
        factory: F,
    ) -> Result<AgentType>
    where
        A: Agent,
        F: Fn(&AgentId) -> A + Send + Sync + 'static,
    {
        self.inner.registry.register(agent_type, factory)
    }

    /// Remove an agent type and evict its instances
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgentType` if the type is not registered.
    pub fn unregister_agent_type(&self, agent_type: &str) -> Result<()> {
        self.inner.registry.unregister(agent_type).map(|_| ())
    }

    /// Evict one instance; the next message to its id creates a new one
    pub fn remove_agent(&self, id: &AgentId) -> bool {
        self.inner.registry.remove(id)
    }

    /// Names of all registered agent types
    pub fn agent_types(&self) -> Vec<String> {
        self.inner.registry.agent_types()
    }

    /// Ids of all live agent instances
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.inner.registry.agent_ids()
    }

    /// Get a live instance as its concrete type
    ///
    /// Returns `None` if the instance has not been created yet or is not an `A`.
    pub fn try_get_agent<A: Agent>(&self, id: &AgentId) -> Option<Arc<A>> {
        self.inner.registry.get(id)?.as_any().downcast::<A>().ok()
    }

    // =========== Lifecycle ===========

    /// Start dispatching messages
    ///
    /// Does nothing if the runtime is already running or stopping.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle();
        match &*lifecycle {
            Lifecycle::Created | Lifecycle::Stopped => {}
            Lifecycle::Running(_) | Lifecycle::Stopping(..) => {
                debug!("Runtime '{}' already started", self.inner.config.name);
                return;
            }
        }

        let (queue, queue_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_dispatch_loop(Arc::downgrade(&self.inner), queue_rx));
        *lifecycle = Lifecycle::Running(Dispatcher { queue, task });
        info!("Runtime '{}' started", self.inner.config.name);
    }

    /// Stop the runtime after in-flight work completes
    ///
    /// New top-level sends are rejected from the moment this is called, and
    /// so are top-level messages still waiting in the queue. Messages already
    /// executing run to completion, along with any nested sends they issue.
    /// Calling this while stopping or stopped does nothing.
    pub async fn stop(&self) {
        self.shutdown(DrainMode::RejectQueued).await;
    }

    /// Stop the runtime once everything already queued has been handled
    ///
    /// Like [`stop`](Self::stop), but messages accepted before the call are
    /// executed instead of rejected.
    pub async fn stop_when_idle(&self) {
        self.shutdown(DrainMode::CompleteQueued).await;
    }

    async fn shutdown(&self, mode: DrainMode) {
        let name = &self.inner.config.name;
        {
            let mut lifecycle = self.inner.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(dispatcher) => {
                    *lifecycle = Lifecycle::Stopping(dispatcher, mode);
                }
                other => {
                    *lifecycle = other;
                    debug!("Runtime '{}' is not running, stop ignored", name);
                    return;
                }
            }
        }
        info!(
            "Stopping runtime '{}' ({} messages in flight)",
            name,
            self.inner.in_flight.count()
        );

        self.inner.in_flight.wait_idle().await;

        let dispatcher = {
            let mut lifecycle = self.inner.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Stopping(dispatcher, _) => Some(dispatcher),
                other => {
                    *lifecycle = other;
                    None
                }
            }
        };

        if let Some(Dispatcher { queue, task }) = dispatcher {
            // Closing the queue lets the dispatch task finish.
            drop(queue);
            if let Err(e) = task.await {
                warn!("Dispatch task for runtime '{}' ended abnormally: {}", name, e);
            }
        }
        info!("Runtime '{}' stopped", name);
    }

    // =========== Messaging ===========

    /// Send a message and wait for the handler's response
    ///
    /// # Errors
    ///
    /// Returns `RuntimeNotRunning` unless the runtime is running,
    /// `UnknownAgentType`, `NoHandlerForMessageType` or `NoResponseProduced`
    /// for routing failures, `HandlerFailure` if the handler failed, and
    /// `UnexpectedResponseType` if the response is not an `R`.
    pub async fn send_message<M, R>(&self, message: M, recipient: &AgentId) -> Result<R>
    where
        M: Send + 'static,
        R: Send + 'static,
    {
        self.send_message_with(message, recipient, SendOptions::default())
            .await
    }

    /// Send a message with explicit sender, cancellation or metadata
    ///
    /// # Errors
    ///
    /// As [`send_message`](Self::send_message), plus `Cancelled` if the
    /// token fires before the response arrives.
    pub async fn send_message_with<M, R>(
        &self,
        message: M,
        recipient: &AgentId,
        options: SendOptions,
    ) -> Result<R>
    where
        M: Send + 'static,
        R: Send + 'static,
    {
        let outbound = options.into_outbound(AnyMessage::new(message), recipient.clone());
        debug!(
            "Sending {} to {}",
            outbound.message.type_name(),
            outbound.recipient
        );
        self.inner.request(outbound).await?.into_response()
    }

    /// Queue a message without waiting for it to be handled
    ///
    /// Routing and handler failures are logged, not returned.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeNotRunning` unless the runtime is running.
    pub fn send_notification<M>(&self, message: M, recipient: &AgentId) -> Result<()>
    where
        M: Send + 'static,
    {
        self.send_notification_with(message, recipient, SendOptions::default())
    }

    /// Queue a message with explicit options, without waiting for it
    ///
    /// # Errors
    ///
    /// Returns `RuntimeNotRunning` unless the runtime is running.
    pub fn send_notification_with<M>(
        &self,
        message: M,
        recipient: &AgentId,
        options: SendOptions,
    ) -> Result<()>
    where
        M: Send + 'static,
    {
        let outbound = options.into_outbound(AnyMessage::new(message), recipient.clone());
        self.inner.enqueue(outbound, None)
    }
}

/// Builder for SingleThreadedAgentRuntime
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    /// Create a new runtime builder
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    /// Set the runtime configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the runtime name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Build the runtime
    pub fn build(self) -> SingleThreadedAgentRuntime {
        SingleThreadedAgentRuntime::with_config(self.config)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Dispatch
// ============================================================================

async fn run_dispatch_loop(runtime: Weak<Inner>, mut queue: mpsc::UnboundedReceiver<Envelope>) {
    let link: Arc<dyn MessageSender> = Arc::new(RuntimeLink(runtime.clone()));
    let mut executing: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();
    let mut open = true;

    loop {
        tokio::select! {
            envelope = queue.recv(), if open => match envelope {
                Some(envelope) => {
                    if let Some(task) = dispatch(&runtime, &link, envelope) {
                        executing.push(task);
                    }
                }
                None => open = false,
            },
            Some(()) = executing.next(), if !executing.is_empty() => {}
            else => break,
        }
    }
    debug!("Dispatch loop exited");
}

/// Route one envelope and return its handler task
///
/// Routing failures are answered immediately and produce no task.
fn dispatch(
    runtime: &Weak<Inner>,
    link: &Arc<dyn MessageSender>,
    envelope: Envelope,
) -> Option<BoxFuture<'static, ()>> {
    let Envelope {
        outbound,
        reply,
        guard,
    } = envelope;

    let Some(inner) = runtime.upgrade() else {
        respond(reply, Err(Error::RuntimeNotRunning));
        return None;
    };
    if !inner.admits(outbound.nested) {
        debug!(
            "Rejecting queued {} for {} during shutdown",
            outbound.message.type_name(),
            outbound.recipient
        );
        respond(reply, Err(Error::RuntimeNotRunning));
        return None;
    }
    if outbound.cancellation.is_cancelled() {
        respond(reply, Err(Error::Cancelled));
        return None;
    }

    let OutboundMessage {
        message,
        recipient,
        sender,
        cancellation,
        metadata,
        nested: _,
    } = outbound;
    let message_type = message.type_name();
    let ctx = MessageContext::new(recipient.clone(), sender, cancellation, metadata, link.clone());

    // The factory and the synchronous part of a handler closure run on the
    // dispatch task itself, so a panic there must not unwind it.
    let routed = std::panic::catch_unwind(AssertUnwindSafe(|| {
        inner
            .registry
            .get_or_create(&recipient)
            .and_then(|instance| instance.dispatch(message, ctx))
    }));
    drop(inner);

    let handler = match routed {
        Ok(Ok(handler)) => handler,
        Ok(Err(e)) => {
            respond(reply, Err(e));
            return None;
        }
        Err(panic) => {
            respond(
                reply,
                Err(Error::handler_failure(
                    recipient,
                    message_type,
                    panic_message(panic.as_ref()),
                )),
            );
            return None;
        }
    };

    Some(Box::pin(async move {
        let result = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(error)) => Err(Error::handler_failure(
                recipient.clone(),
                message_type,
                error,
            )),
            Err(panic) => Err(Error::handler_failure(
                recipient.clone(),
                message_type,
                panic_message(panic.as_ref()),
            )),
        };

        match reply {
            Some(reply) => {
                let result = result.and_then(|response| {
                    response.ok_or(Error::NoResponseProduced {
                        agent: recipient,
                        message_type,
                    })
                });
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("Notification handler failed: {}", e);
                }
            }
        }
        drop(guard);
    }))
}

fn respond(reply: Option<Reply>, result: Result<AnyMessage>) {
    match reply {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                warn!("Dropped notification: {}", e);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
