//! Branded ID newtypes.
//!
//! Rooms, viewers, and session tokens are all strings on the wire. Wrapping
//! them keeps a viewer id from being passed where a room id is expected.
//! Room ids are opaque: the document store hands them out and nothing here
//! checks that they name a real document.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of a room (one shared document).
    RoomId
}

branded_id! {
    /// Identifier of a viewer within a room.
    ///
    /// Either the stable account id of an authenticated caller or a
    /// room-scoped anonymous id such as `anon-3`.
    ViewerId
}

branded_id! {
    /// Opaque token a client presents to resume its session after a
    /// transport drop.
    SessionToken
}

impl ViewerId {
    /// Room-scoped id for the `n`th anonymous viewer.
    #[must_use]
    pub fn anonymous(n: u64) -> Self {
        Self(format!("anon-{n}"))
    }
}

impl SessionToken {
    /// Create a new random token (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn session_tokens_are_unique() {
        let a = SessionToken::new();
        let b = SessionToken::new();
        assert_ne!(a, b);
    }

    #[test]
    fn anonymous_viewer_id_format() {
        assert_eq!(ViewerId::anonymous(3).as_str(), "anon-3");
    }

    #[test]
    fn serde_is_transparent() {
        let id = RoomId::from("doc-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"doc-1\"");
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn viewer_ids_key_json_maps() {
        let mut map = BTreeMap::new();
        let _ = map.insert(ViewerId::from("alice"), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"alice":1}"#);
    }

    #[test]
    fn display_and_deref() {
        let id = ViewerId::from("bob");
        assert_eq!(format!("{id}"), "bob");
        assert_eq!(id.len(), 3);
        assert_eq!(String::from(id), "bob");
    }
}
