//! Worker pool management.
//!
//! ## Structure
//!
//! - [`manager`] - [`WorkerPoolManager`], the map of targets and the lifecycle.
//! - [`target`] - [`TargetManager`], the workers of a single target.
//! - [`distribution`] - [`distribute`], how many workers each target gets.
//! - [`state`] - [`State`], the manager lifecycle.

pub mod distribution;
pub mod manager;
pub mod state;
pub mod target;

#[cfg(test)]
mod tests;

pub use distribution::distribute;
pub use manager::WorkerPoolManager;
pub use state::State;
pub use target::TargetManager;
