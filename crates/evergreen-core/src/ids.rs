use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefixed, time-ordered string id. Ids received from the peer are kept
/// verbatim through `from_raw`, so the prefix is only a convention.
macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!("{}_{}", Self::PREFIX, Uuid::now_v7()))
            }

            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Ok(Self::from_raw(raw))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Scope of one connection and its pipes.
    SessionId,
    "sess"
);
branded_id!(
    /// Local handle id inside a [`SessionRegistry`](crate::SessionRegistry).
    PipeId,
    "pipe"
);
branded_id!(
    /// Wire id of one logical stream or tree node.
    StreamId,
    "strm"
);
branded_id!(InvocationId, "inv");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix() {
        assert!(SessionId::new().as_str().starts_with("sess_"));
        assert!(PipeId::new().as_str().starts_with("pipe_"));
        let id = StreamId::new();
        assert!(id.as_str().starts_with(&format!("{}_", StreamId::PREFIX)), "got: {id}");
        assert_eq!(InvocationId::PREFIX, "inv");
    }

    #[test]
    fn ids_are_unique() {
        let a = StreamId::new();
        let b = StreamId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_is_transparent() {
        let id = StreamId::from_raw("child-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"child-7\"");
        let parsed: StreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<PipeId> = (0..50).map(|_| PipeId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0] < w[1], "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
