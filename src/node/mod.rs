//! Node Module
//!
//! The tokio runtime around the sans-IO coordinator.
//!
//! ## Components
//! - **`service`**: `NodeService`, the single actor task that owns the `Coordinator`,
//!   performs its actions and runs its timers; `NodeHandle` for the game layer.
//! - **`handlers`** / **`protocol`**: the local HTTP control surface (axum).

pub mod handlers;
pub mod protocol;
pub mod service;
#[cfg(test)]
mod tests;

pub use service::{Command, NodeHandle, NodeService};
