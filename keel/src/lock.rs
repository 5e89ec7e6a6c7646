use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Identifier of the mutual-exclusion resource replicas compete for.
///
/// Must stay constant for the lifetime of a deployment and must not collide
/// with any other lock taken on the same backing store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub i64);

impl LockId {
    /// Well-known key used by control-plane replicas unless configured otherwise.
    pub const DEFAULT: LockId = LockId(7_526_700_533_049);

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of this replica for a given lock.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LeadershipState {
    #[default]
    Follower,
    Leader,
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadershipState::Follower => "follower",
            LeadershipState::Leader => "leader",
        }
    }
}

impl Display for LeadershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
