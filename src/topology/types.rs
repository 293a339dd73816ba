use serde::{Deserialize, Serialize};
use std::fmt;

/// Process identifier.
///
/// Assigned once for the lifetime of a process. The ordering is significant:
/// the lowest pid of the founding group leads first, the highest live pid
/// wins an election.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub String);

impl Pid {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Pid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Pid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Pid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Direction of travel around the ring.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}
