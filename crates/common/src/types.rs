use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when constructing an identifier from an empty string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdError {
    pub kind: &'static str,
}

impl std::fmt::Display for IdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} must not be empty", self.kind)
    }
}

impl std::error::Error for IdError {}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Creates a new random identifier (UUID v4 rendered as text).
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Wraps an existing identifier, rejecting blank values.
            pub fn parse(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(IdError { kind: $kind });
                }
                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid.to_string())
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(
    /// Identifier of a global transaction (one saga).
    ///
    /// Opaque to the coordinator: omegas may send any non-empty string.
    /// It doubles as the stream key of the event log.
    GlobalTxId,
    "globalTxId"
);

string_id!(
    /// Identifier of a local transaction (one branch) inside a saga.
    LocalTxId,
    "localTxId"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_tx_id_new_creates_unique_ids() {
        let id1 = GlobalTxId::new();
        let id2 = GlobalTxId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn parse_rejects_blank_values() {
        assert_eq!(
            GlobalTxId::parse("  ").unwrap_err(),
            IdError { kind: "globalTxId" }
        );
        assert!(LocalTxId::parse("").is_err());
        assert_eq!(LocalTxId::parse("tx-1").unwrap().as_str(), "tx-1");
    }

    #[test]
    fn from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = GlobalTxId::from(uuid);
        assert_eq!(id.as_str(), uuid.to_string());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = LocalTxId::parse("local-1").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"local-1\"");
        let deserialized: LocalTxId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn deserializing_a_blank_id_fails() {
        let result: Result<GlobalTxId, _> = serde_json::from_str("\"  \"");
        assert!(result.is_err());
    }
}
