//! Shared scalar types for subscriber identity, stream mode, and the
//! verbatim transaction payload fanned out to subscribers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Non-empty subscriber name, unique among live subscribers of either mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberName(String);

impl SubscriberName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidName> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidName);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("subscriber name must not be empty")]
pub struct InvalidName;

/// Which upstream stream a subscriber is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Head,
    Irreversible,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Head => "head",
            Mode::Irreversible => "irreversible",
        }
    }

    pub fn all() -> [Mode; 2] {
        [Mode::Head, Mode::Irreversible]
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A transaction carried verbatim from the upstream stream.
///
/// Modeled as an opaque JSON object rather than a fixed struct: the only
/// fields the broker ever inspects are `block_num` and `type`, everything
/// else is forwarded to the subscriber unexamined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transaction(pub serde_json::Value);

impl Transaction {
    pub fn block_num(&self) -> Option<u64> {
        self.0.get("block_num").and_then(serde_json::Value::as_u64)
    }

    pub fn op_type(&self) -> Option<&str> {
        self.0.get("type").and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(SubscriberName::new("").is_err());
        assert!(SubscriberName::new("alice").is_ok());
    }

    #[test]
    fn transaction_exposes_block_num_and_type() {
        let tx = Transaction(serde_json::json!({"block_num": 42, "type": "transfer", "id": "x"}));
        assert_eq!(tx.block_num(), Some(42));
        assert_eq!(tx.op_type(), Some("transfer"));
    }
}
