//! Type-erased message payloads

use crate::{Error, Result};
use std::any::{Any, TypeId, type_name};
use std::fmt;

/// An application message with its concrete type erased
///
/// The runtime never inspects the payload. It only reads the [`TypeId`] to pick
/// a handler, and the type name for error reporting.
pub struct AnyMessage {
    type_id: TypeId,
    type_name: &'static str,
    payload: Box<dyn Any + Send>,
}

impl AnyMessage {
    /// Erase a concrete message
    pub fn new<M: Send + 'static>(message: M) -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            type_name: type_name::<M>(),
            payload: Box::new(message),
        }
    }

    /// Type id of the concrete payload
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Type name of the concrete payload
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Check whether the payload is an `M`
    pub fn is<M: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    /// Borrow the payload as an `M`
    pub fn downcast_ref<M: 'static>(&self) -> Option<&M> {
        self.payload.downcast_ref()
    }

    /// Recover the concrete payload, handing the message back on mismatch
    pub fn downcast<M: 'static>(self) -> std::result::Result<M, Self> {
        let Self {
            type_id,
            type_name,
            payload,
        } = self;
        payload.downcast::<M>().map(|boxed| *boxed).map_err(|payload| Self {
            type_id,
            type_name,
            payload,
        })
    }

    /// Recover a response payload as `R`
    pub fn into_response<R: 'static>(self) -> Result<R> {
        self.downcast::<R>()
            .map_err(|other| Error::UnexpectedResponseType {
                expected: type_name::<R>(),
                actual: other.type_name(),
            })
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    #[test]
    fn test_type_tag_is_concrete_type() {
        let msg = AnyMessage::new(Ping(1));
        assert_eq!(msg.type_id(), TypeId::of::<Ping>());
        assert!(msg.is::<Ping>());
        assert!(!msg.is::<u32>());
        assert!(msg.type_name().ends_with("Ping"));
    }

    #[test]
    fn test_downcast_mismatch_returns_message() {
        let msg = AnyMessage::new(Ping(7));
        let msg = msg.downcast::<String>().unwrap_err();
        assert_eq!(msg.downcast_ref::<Ping>(), Some(&Ping(7)));
        assert_eq!(msg.downcast::<Ping>().unwrap(), Ping(7));
    }

    #[test]
    fn test_into_response_mismatch() {
        let err = AnyMessage::new(5_u8).into_response::<String>().unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedResponseType { actual: "u8", .. }
        ));
    }
}
