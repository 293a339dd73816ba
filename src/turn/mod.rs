//! Turn-Passing Module
//!
//! A ring-based mutual exclusion protocol: exactly one process holds the turn
//! token, and holding it authorises mutating the shared game state.
//!
//! ## Submodules
//! - **`types`**: turn kinds, the shared state and the `TURN` payload.
//! - **`mutex`**: the Idle/Active state machine.
//! - **`recovery`**: the backup chain used to re-issue a turn lost to crashes.

pub mod mutex;
pub mod recovery;
pub mod types;

pub use mutex::{Accepted, TurnMutex, TurnStatus};
pub use recovery::{RecoveryChain, RecoveryTarget};
pub use types::{PassKind, PassRecord, SharedState, TurnKind, TurnPass};
