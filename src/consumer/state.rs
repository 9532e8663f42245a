use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle of a consumer.
///
/// ```text
/// Joining -> Idle <-> Assigned -> Leaving -> Dead
///    ^________________|  (lease lost)
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConsumerState {
    /// Registering in the group (initially and after a lease loss).
    #[default]
    Joining,
    /// Member of the group without partitions.
    Idle,
    /// Reading the listed partitions.
    Assigned { partitions: BTreeSet<u32> },
    /// Stopping workers, releasing claims and leaving the group.
    Leaving,
    /// Terminal.
    Dead,
}

impl ConsumerState {
    pub(crate) fn from_partitions(partitions: BTreeSet<u32>) -> Self {
        if partitions.is_empty() {
            ConsumerState::Idle
        } else {
            ConsumerState::Assigned { partitions }
        }
    }

    /// Partitions being read in this state.
    pub fn partitions(&self) -> BTreeSet<u32> {
        match self {
            ConsumerState::Assigned { partitions } => partitions.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn is_member(&self) -> bool {
        matches!(self, ConsumerState::Idle | ConsumerState::Assigned { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Joining => "joining",
            ConsumerState::Idle => "idle",
            ConsumerState::Assigned { .. } => "assigned",
            ConsumerState::Leaving => "leaving",
            ConsumerState::Dead => "dead",
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Assigned { partitions } => write!(f, "assigned{partitions:?}"),
            other => f.write_str(other.as_str()),
        }
    }
}
