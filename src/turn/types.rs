use crate::topology::types::{Direction, Pid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// How the holder finishes its turn.
///
/// `Reverse` never travels on the wire: it flips the ring direction for good
/// and is sent as a `Normal` pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TurnKind {
    Normal,
    Skip,
    Reverse,
}

/// Turn kinds a receiver can see.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PassKind {
    /// Take the turn.
    Normal,
    /// Forward the turn straight away without acting.
    Skip,
}

/// Application state guarded by the turn token.
///
/// The core only reads and writes `turn_owner` and `turns_taken`; `data_json`
/// belongs to the game layer and is carried as opaque JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedState {
    pub turn_owner: Option<Pid>,
    pub turns_taken: u64,
    pub data_json: String,
}

impl SharedState {
    pub fn new(owner: Pid) -> Self {
        Self {
            turn_owner: Some(owner),
            turns_taken: 0,
            data_json: "null".to_string(),
        }
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> serde_json::Result<Self> {
        self.data_json = serde_json::to_string(data)?;
        Ok(self)
    }

    pub fn data<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.data_json)
    }
}

/// Payload of a `TURN` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnPass {
    pub kind: PassKind,
    pub state: SharedState,
    pub extra_draw: u32,
    pub direction: Direction,
    /// Position of this pass in the token's history.
    pub sequence: u64,
}

/// The last turn this process forwarded, kept so it can be re-issued after
/// the token is lost downstream. Kind and direction are already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassRecord {
    pub kind: PassKind,
    pub direction: Direction,
    pub state: SharedState,
    pub extra_draw: u32,
    pub sequence: u64,
}

impl PassRecord {
    /// The `TURN` payload addressed to `next`.
    pub fn to_pass(&self, next: &Pid) -> TurnPass {
        let mut state = self.state.clone();
        state.turn_owner = Some(next.clone());

        TurnPass {
            kind: self.kind,
            state,
            extra_draw: self.extra_draw,
            direction: self.direction,
            sequence: self.sequence,
        }
    }
}
