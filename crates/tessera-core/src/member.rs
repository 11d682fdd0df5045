//! Member identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// Identifies a member (replica) of the distributed system.
///
/// Members stamp the versions they originate, and version vectors are
/// keyed by member id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id from an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        MemberId(id.into())
    }

    /// Mint a fresh member id for a locally started member.
    pub fn generate() -> Self {
        MemberId(Ulid::new().to_string())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        MemberId(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_roundtrip() {
        let id = MemberId::new("m1");
        assert_eq!(id.as_str(), "m1");
        assert_eq!(id.to_string(), "m1");
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        assert_ne!(MemberId::generate(), MemberId::generate());
    }
}
