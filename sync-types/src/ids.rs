//! Identity types for chatsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a backend-assigned string identifier.
macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from any string-like value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Backend-assigned channel identifier.
    ChannelSid
}

string_id! {
    /// Backend-assigned message identifier.
    ///
    /// Only confirmed messages carry one.
    MessageSid
}

string_id! {
    /// A user identity, unique across the messaging service.
    Identity
}

/// Client-generated identifier for a message that has not been sent yet.
///
/// UUID v4 format (16 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalId(uuid::Uuid);

impl LocalId {
    /// Create a new random LocalId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_display_raw_value() {
        let sid = ChannelSid::new("CH123");
        assert_eq!(sid.to_string(), "CH123");
        assert_eq!(format!("{:?}", sid), "ChannelSid(CH123)");
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let identity = Identity::from("alice");
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, "\"alice\"");

        let restored: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, identity);
    }

    #[test]
    fn local_id_is_uuid_v4() {
        let id = LocalId::new();
        assert_eq!(id.as_uuid().get_version_num(), 4);
        assert_ne!(id, LocalId::new());
    }
}
