//! Strongly-typed identifiers for Breeder entities
//!
//! All IDs are UUID-based but wrapped in newtype structs so a `SystemId` can
//! never be passed where a `ClusterId` is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Short display form (first 8 hex chars).
            pub fn short(&self) -> String {
                self.0.simple().to_string().chars().take(8).collect()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s.strip_prefix(concat!($prefix, ":")).unwrap_or(s);
                Uuid::parse_str(raw).map(Self)
            }
        }
    };
}

entity_id!(
    /// Identifier of a discovery run.
    PopulationId,
    "population"
);
entity_id!(
    /// Identifier of one pass of the evolutionary loop.
    GenerationId,
    "generation"
);
entity_id!(
    /// Identifier of a behavioural niche within a generation.
    ClusterId,
    "cluster"
);
entity_id!(
    /// Identifier of a candidate multi-agent program.
    SystemId,
    "system"
);
entity_id!(MeetingId, "meeting");
entity_id!(AgentId, "agent");
entity_id!(ChatId, "chat");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(SystemId::generate(), SystemId::generate());
    }

    #[test]
    fn parse_accepts_prefixed_and_bare() {
        let id = PopulationId::generate();
        let bare: PopulationId = id.to_string().parse().unwrap();
        let prefixed: PopulationId = format!("population:{}", id).parse().unwrap();
        assert_eq!(bare, id);
        assert_eq!(prefixed, id);
    }

    #[test]
    fn serde_is_transparent() {
        let id = ClusterId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn short_form_has_eight_chars() {
        assert_eq!(SystemId::generate().short().len(), 8);
    }
}
