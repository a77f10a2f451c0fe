//! Strongly-typed identifiers for Vigil entities
//!
//! Identifiers arrive as opaque strings from executors and the control plane,
//! so they are wrapped rather than parsed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an application (droplet)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DropletId(String);

impl DropletId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DropletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DropletId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identity of one running process of an instance.
///
/// Changes every time the instance is restarted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceGuid(String);

impl InstanceGuid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InstanceGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceGuid {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of an executor (DEA) reporting heartbeats
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutorId(String);

impl ExecutorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dea:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let id = DropletId::new("app-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"app-1\"");

        let guid: InstanceGuid = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(guid.as_str(), "abc");
    }

    #[test]
    fn test_executor_id_display() {
        let id = ExecutorId::new("dea-7");
        assert_eq!(format!("{}", id), "dea:dea-7");
    }
}
