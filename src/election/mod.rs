//! Leader Election Module
//!
//! Bully algorithm: when the leader is suspected, the highest live pid takes
//! over, announces itself with LEADER, and re-broadcasts a ring without the
//! old leader.
//!
//! Two winners can briefly coexist when timers fire on both sides of a slow
//! link. The window is bounded by the long timeout; the last topology a
//! process receives wins.

pub mod bully;

pub use bully::{Election, ElectionTimer};
