//! Per-dispatch message context
//!
//! Every handler invocation receives a fresh [`MessageContext`] describing who
//! sent the message, how to observe cancellation, and the correlation data the
//! dispatch carries. Handlers reach other agents through the context, which
//! derives the nested send (sender, child token, inherited metadata) for them.

use crate::{AgentId, AnyMessage, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Well-known metadata keys
pub mod keys {
    /// Trace id shared by every dispatch spawned from one top-level send
    pub const TRACE_ID: &str = "trace_id";
    /// Session ID for tracking
    pub const SESSION_ID: &str = "session_id";
    /// User ID for personalization
    pub const USER_ID: &str = "user_id";
}

/// Correlation data attached to a send and inherited by nested sends
///
/// # Example
///
/// ```
/// use agent_core::Metadata;
///
/// let meta = Metadata::new().with_session_id("session-123");
/// assert_eq!(meta.session_id(), Some("session-123"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    data: HashMap<String, serde_json::Value>,
}

impl Metadata {
    /// Create empty metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the trace id
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.insert(keys::TRACE_ID, serde_json::json!(trace_id.into()));
        self
    }

    /// Set the session ID
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.insert(keys::SESSION_ID, serde_json::json!(session_id.into()));
        self
    }

    /// Set the user ID
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.insert(keys::USER_ID, serde_json::json!(user_id.into()));
        self
    }

    /// Get the trace id
    pub fn trace_id(&self) -> Option<&str> {
        self.get(keys::TRACE_ID).and_then(|v| v.as_str())
    }

    /// Get the session ID
    pub fn session_id(&self) -> Option<&str> {
        self.get(keys::SESSION_ID).and_then(|v| v.as_str())
    }

    /// Get the user ID
    pub fn user_id(&self) -> Option<&str> {
        self.get(keys::USER_ID).and_then(|v| v.as_str())
    }

    /// Insert a value
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Get a value
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Insert a typed value, serialized to JSON
    pub fn insert_typed<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> serde_json::Result<()> {
        self.data.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Get a typed value, deserialized from JSON
    pub fn get_typed<T: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
    ) -> serde_json::Result<Option<T>> {
        self.data
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Remove a value
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if there are no entries
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Merge another map into this one (other values override)
    pub fn merge(&mut self, other: Metadata) {
        self.data.extend(other.data);
    }
}

/// A message on its way into the runtime's queue
#[derive(Debug)]
pub struct OutboundMessage {
    /// The payload
    pub message: AnyMessage,
    /// Target agent
    pub recipient: AgentId,
    /// Sending agent, absent for top-level sends
    pub sender: Option<AgentId>,
    /// Token the recipient's handler observes
    pub cancellation: CancellationToken,
    /// Correlation data
    pub metadata: Metadata,
    /// True when issued from inside a handler
    ///
    /// Nested sends are still accepted while the runtime drains.
    pub nested: bool,
}

/// The seam a [`MessageContext`] uses to put nested sends back into a runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Enqueue a message and wait for its handler's response
    async fn send(&self, outbound: OutboundMessage) -> Result<AnyMessage>;

    /// Enqueue a message without waiting for it to be handled
    fn notify(&self, outbound: OutboundMessage) -> Result<()>;
}

/// Metadata handed to every handler invocation
///
/// Built fresh by the runtime for each dispatch. Handlers read it but never
/// mutate it; nested sends go through [`MessageContext::send_message`], which
/// derives a new context for the recipient.
#[derive(Clone)]
pub struct MessageContext {
    recipient: AgentId,
    sender: Option<AgentId>,
    message_id: Uuid,
    cancellation: CancellationToken,
    metadata: Metadata,
    runtime: Arc<dyn MessageSender>,
}

impl MessageContext {
    /// Create a context for one dispatch
    pub fn new(
        recipient: AgentId,
        sender: Option<AgentId>,
        cancellation: CancellationToken,
        metadata: Metadata,
        runtime: Arc<dyn MessageSender>,
    ) -> Self {
        Self {
            recipient,
            sender,
            message_id: Uuid::new_v4(),
            cancellation,
            metadata,
            runtime,
        }
    }

    /// The agent handling this message
    pub fn recipient(&self) -> &AgentId {
        &self.recipient
    }

    /// The agent that sent this message, if any
    pub fn sender(&self) -> Option<&AgentId> {
        self.sender.as_ref()
    }

    /// Unique id of this dispatch
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Cancellation token for this dispatch
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Check whether the sender cancelled this dispatch
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Correlation data carried by this dispatch
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Send a message to another agent and wait for its typed response
    ///
    /// The nested dispatch is sent from this context's recipient, inherits the
    /// metadata and observes a child of this context's cancellation token.
    pub async fn send_message<M, R>(&self, message: M, recipient: &AgentId) -> Result<R>
    where
        M: Send + 'static,
        R: Send + 'static,
    {
        let response = self.runtime.send(self.outbound(message, recipient)).await?;
        response.into_response()
    }

    /// Send a message to another agent without waiting for it to be handled
    pub fn send_notification<M>(&self, message: M, recipient: &AgentId) -> Result<()>
    where
        M: Send + 'static,
    {
        self.runtime.notify(self.outbound(message, recipient))
    }

    fn outbound<M: Send + 'static>(&self, message: M, recipient: &AgentId) -> OutboundMessage {
        OutboundMessage {
            message: AnyMessage::new(message),
            recipient: recipient.clone(),
            sender: Some(self.recipient.clone()),
            cancellation: self.cancellation.child_token(),
            metadata: self.metadata.clone(),
            nested: true,
        }
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("recipient", &self.recipient)
            .field("sender", &self.sender)
            .field("message_id", &self.message_id)
            .field("cancelled", &self.is_cancelled())
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        value: i32,
        text: String,
    }

    fn id(ty: &str, key: &str) -> AgentId {
        AgentId::new(ty, key).unwrap()
    }

    fn context(runtime: MockMessageSender, token: CancellationToken) -> MessageContext {
        MessageContext::new(
            id("relay", "a"),
            None,
            token,
            Metadata::new().with_session_id("sess-1"),
            Arc::new(runtime),
        )
    }

    #[test]
    fn test_metadata_basic_operations() {
        let mut meta = Metadata::new();
        assert!(meta.is_empty());

        meta.insert("key", serde_json::json!("value"));
        assert_eq!(meta.len(), 1);
        assert!(meta.contains_key("key"));
        assert_eq!(meta.get("key"), Some(&serde_json::json!("value")));

        meta.remove("key");
        assert!(meta.is_empty());
    }

    #[test]
    fn test_metadata_typed_insert_get() {
        let mut meta = Metadata::new();
        let data = TestData {
            value: 42,
            text: "hello".to_string(),
        };

        meta.insert_typed("test", &data).unwrap();

        let retrieved: TestData = meta.get_typed("test").unwrap().unwrap();
        assert_eq!(retrieved, data);
        assert!(meta.get_typed::<TestData>("missing").unwrap().is_none());
    }

    #[test]
    fn test_metadata_builder_and_merge() {
        let mut meta = Metadata::new().with_trace_id("t-1").with_user_id("u-1");
        meta.merge(Metadata::new().with_trace_id("t-2").with_session_id("s"));

        assert_eq!(meta.trace_id(), Some("t-2")); // overridden
        assert_eq!(meta.user_id(), Some("u-1"));
        assert_eq!(meta.session_id(), Some("s")); // merged
    }

    #[tokio::test]
    async fn test_nested_send_is_derived_from_context() {
        let mut runtime = MockMessageSender::new();
        runtime
            .expect_send()
            .withf(|out| {
                out.nested
                    && out.recipient.to_string() == "echo/a"
                    && out.sender.as_ref().map(ToString::to_string).as_deref() == Some("relay/a")
                    && out.metadata.session_id() == Some("sess-1")
                    && out.message.downcast_ref::<String>().map(String::as_str) == Some("hi")
            })
            .times(1)
            .returning(|out| Ok(out.message));

        let ctx = context(runtime, CancellationToken::new());
        let reply: String = ctx
            .send_message("hi".to_string(), &id("echo", "a"))
            .await
            .unwrap();
        assert_eq!(reply, "hi");
    }

    #[tokio::test]
    async fn test_nested_send_observes_child_token() {
        let parent = CancellationToken::new();
        let mut runtime = MockMessageSender::new();
        let observed = parent.clone();
        runtime.expect_notify().times(1).returning(move |out| {
            assert!(!out.cancellation.is_cancelled());
            observed.cancel();
            assert!(out.cancellation.is_cancelled());
            Ok(())
        });

        let ctx = context(runtime, parent);
        ctx.send_notification(1_u32, &id("echo", "a")).unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_typed_send_rejects_other_response_type() {
        let mut runtime = MockMessageSender::new();
        runtime
            .expect_send()
            .returning(|_| Ok(AnyMessage::new(3_i64)));

        let ctx = context(runtime, CancellationToken::new());
        let result: Result<String> = ctx.send_message(1_u8, &id("echo", "a")).await;
        assert!(matches!(result, Err(Error::UnexpectedResponseType { .. })));
    }

    #[tokio::test]
    async fn test_errors_from_runtime_pass_through() {
        let mut runtime = MockMessageSender::new();
        runtime
            .expect_send()
            .returning(|_| Err(Error::RuntimeNotRunning));

        let ctx = context(runtime, CancellationToken::new());
        let result: Result<()> = ctx.send_message((), &id("echo", "a")).await;
        tokio_test::assert_err!(result);
    }

    #[test]
    fn test_contexts_get_distinct_message_ids() {
        let a = context(MockMessageSender::new(), CancellationToken::new());
        let b = context(MockMessageSender::new(), CancellationToken::new());
        assert_ne!(a.message_id(), b.message_id());
        assert!(a.sender().is_none());
        assert_eq!(a.recipient().agent_type(), "relay");
    }
}
