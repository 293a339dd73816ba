//! Ring mutex over the turn token.
//!
//! Two states. Idle becomes Active when a `TURN` naming this process is
//! accepted; Active becomes Idle when the turn is finished and forwarded.
//! Accepting while Active means two holders exist, which is a protocol bug.

use super::types::{PassKind, PassRecord, SharedState, TurnKind, TurnPass};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::topology::types::{Direction, Pid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Idle,
    Active { sequence: u64 },
}

/// What the receiver must do with an accepted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepted {
    /// Hand the turn to the game layer.
    Play(SharedState),
    /// Draw `extra_draw` cards (if any) and forward a normal turn at once.
    AutoForward { state: SharedState, extra_draw: u32 },
    /// Duplicate of a pass already seen.
    Stale,
}

#[derive(Debug)]
pub struct TurnMutex {
    status: TurnStatus,
    direction: Direction,
    sequence: u64,
    last_pass: Option<PassRecord>,
}

impl TurnMutex {
    pub fn new() -> Self {
        Self {
            status: TurnStatus::Idle,
            direction: Direction::Forward,
            sequence: 0,
            last_pass: None,
        }
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, TurnStatus::Active { .. })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Sequence of the last pass accepted here.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn last_pass(&self) -> Option<&PassRecord> {
        self.last_pass.as_ref()
    }

    /// Takes the opening turn of a session.
    pub fn first_turn(&mut self, me: &Pid) -> CoordinatorResult<SharedState> {
        if self.is_active() {
            return Err(CoordinatorError::ProtocolViolation(
                "first turn taken while already holding the token".to_string(),
            ));
        }

        self.status = TurnStatus::Active {
            sequence: self.sequence,
        };

        Ok(SharedState::new(me.clone()))
    }

    /// Idle -> Active on an incoming `TURN`.
    pub fn accept(&mut self, me: &Pid, pass: TurnPass) -> CoordinatorResult<Accepted> {
        if pass.sequence <= self.sequence {
            return Ok(Accepted::Stale);
        }

        if let TurnStatus::Active { sequence } = self.status {
            return Err(CoordinatorError::ProtocolViolation(format!(
                "received turn {} while holding turn {}",
                pass.sequence, sequence
            )));
        }

        self.direction = pass.direction;
        self.sequence = pass.sequence;
        self.status = TurnStatus::Active {
            sequence: pass.sequence,
        };

        let mut state = pass.state;
        state.turn_owner = Some(me.clone());

        match pass.kind {
            PassKind::Skip => Ok(Accepted::AutoForward {
                state,
                extra_draw: pass.extra_draw,
            }),
            PassKind::Normal if pass.extra_draw > 0 => Ok(Accepted::AutoForward {
                state,
                extra_draw: pass.extra_draw,
            }),
            PassKind::Normal => Ok(Accepted::Play(state)),
        }
    }

    /// Active -> Idle. Resolves `Reverse` into a direction flip, caches the
    /// outgoing pass for recovery, and returns it.
    pub fn release(
        &mut self,
        me: &Pid,
        kind: TurnKind,
        mut state: SharedState,
        extra_draw: u32,
    ) -> CoordinatorResult<PassRecord> {
        if !self.is_active() {
            return Err(CoordinatorError::ProtocolViolation(
                "tried to finish a turn while not holding the token".to_string(),
            ));
        }

        if state.turn_owner.as_ref() != Some(me) {
            return Err(CoordinatorError::ProtocolViolation(format!(
                "tried to finish a turn owned by {:?}",
                state.turn_owner
            )));
        }

        let kind = match kind {
            TurnKind::Normal => PassKind::Normal,
            TurnKind::Skip => PassKind::Skip,
            TurnKind::Reverse => {
                self.direction = self.direction.flip();
                PassKind::Normal
            }
        };

        state.turns_taken += 1;
        self.status = TurnStatus::Idle;

        let record = PassRecord {
            kind,
            direction: self.direction,
            state,
            extra_draw,
            sequence: self.sequence + 1,
        };
        self.last_pass = Some(record.clone());

        Ok(record)
    }
}

impl Default for TurnMutex {
    fn default() -> Self {
        Self::new()
    }
}
