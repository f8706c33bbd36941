use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
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
    };
}

branded_id!(PeerId, "peer");
branded_id!(ProcessId, "proc");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_prefix() {
        let id = PeerId::new();
        assert!(id.as_str().starts_with("peer_"), "got: {id}");
    }

    #[test]
    fn process_id_has_prefix() {
        let id = ProcessId::new();
        assert!(id.as_str().starts_with("proc_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(PeerId::new(), PeerId::new());
        assert_ne!(ProcessId::new(), ProcessId::new());
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = PeerId::from_raw("peer_custom");
        assert_eq!(id.as_str(), "peer_custom");
        assert_eq!(id.to_string(), "peer_custom");
    }

    #[test]
    fn serializes_transparently() {
        let id = ProcessId::from_raw("proc_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""proc_1""#);
    }
}
