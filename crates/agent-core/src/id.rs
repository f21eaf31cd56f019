//! Agent identifiers
//!
//! An [`AgentId`] names one agent instance: the registered type it was built
//! from plus a key that tells instances of that type apart. Its string form is
//! `type/key`, so neither part may contain the separator.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator used by the `type/key` string form
pub const SEPARATOR: char = '/';

/// Name under which an agent factory is registered
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentType(String);

impl AgentType {
    /// Validate and wrap a type name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_part(&name, "agent type must not be empty")?;
        Ok(Self(name))
    }

    /// Get the type name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<AgentType> for String {
    fn from(ty: AgentType) -> Self {
        ty.0
    }
}

/// Identifier of one agent instance
///
/// Two ids are equal iff both the type and the key match. Ids are immutable
/// once built and are used as the runtime's instance cache key.
///
/// # Example
///
/// ```
/// use agent_core::AgentId;
///
/// let id = AgentId::new("echo", "a").unwrap();
/// assert_eq!(id.to_string(), "echo/a");
/// assert_eq!("echo/a".parse::<AgentId>().unwrap(), id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    agent_type: String,
    key: String,
}

impl AgentId {
    /// Create an id from a type name and key
    pub fn new(agent_type: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let agent_type = agent_type.into();
        let key = key.into();
        validate_part(&agent_type, "agent type must not be empty")?;
        validate_part(&key, "agent key must not be empty")?;
        Ok(Self { agent_type, key })
    }

    /// Create an id for an already validated agent type
    pub fn for_type(agent_type: &AgentType, key: impl Into<String>) -> Result<Self> {
        Self::new(agent_type.as_str(), key)
    }

    /// Get the agent type name
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    /// Get the instance key
    pub fn key(&self) -> &str {
        &self.key
    }
}

fn validate_part(value: &str, empty_reason: &'static str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidIdentifier {
            value: value.to_string(),
            reason: empty_reason,
        });
    }
    if value.contains(SEPARATOR) {
        return Err(Error::InvalidIdentifier {
            value: value.to_string(),
            reason: "identifier must not contain '/'",
        });
    }
    Ok(())
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.agent_type, self.key)
    }
}

impl FromStr for AgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (agent_type, key) = s.split_once(SEPARATOR).ok_or_else(|| Error::InvalidIdentifier {
            value: s.to_string(),
            reason: "expected 'type/key'",
        })?;
        Self::new(agent_type, key)
    }
}

impl TryFrom<String> for AgentId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_uses_both_parts() {
        let a = AgentId::new("echo", "a").unwrap();
        assert_eq!(a, AgentId::new("echo", "a").unwrap());
        assert_ne!(a, AgentId::new("echo", "b").unwrap());
        assert_ne!(a, AgentId::new("relay", "a").unwrap());
    }

    #[test]
    fn test_rejects_empty_parts() {
        assert!(matches!(
            AgentId::new("", "a"),
            Err(Error::InvalidIdentifier { .. })
        ));
        assert!(matches!(
            AgentId::new("echo", ""),
            Err(Error::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn test_rejects_separator() {
        assert!(AgentId::new("ec/ho", "a").is_err());
        assert!(AgentId::new("echo", "a/b").is_err());
        assert!(AgentType::new("a/b").is_err());
    }

    #[test]
    fn test_parse() {
        let id: AgentId = "relay/main".parse().unwrap();
        assert_eq!(id.agent_type(), "relay");
        assert_eq!(id.key(), "main");

        assert!("relay".parse::<AgentId>().is_err());
        assert!("relay/a/b".parse::<AgentId>().is_err());
        assert!("/a".parse::<AgentId>().is_err());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let id = AgentId::new("echo", "a").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"echo/a\"");

        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<AgentId>("\"echo\"").is_err());
    }

    #[test]
    fn test_for_type() {
        let ty = AgentType::new("echo").unwrap();
        let id = AgentId::for_type(&ty, "k").unwrap();
        assert_eq!(id.agent_type(), ty.as_str());
    }
}
