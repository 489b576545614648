//! Workflow orchestration for regnet.
//!
//! [`NetworkManager`] owns the persisted network descriptors. [`Orchestrator`]
//! runs the multi-step Lightning workflows against them, caching node state
//! in a [`LightningStore`] and announcing mined blocks on [`MineEvents`].

mod events;
mod network_manager;
mod orchestrator;
mod store;

pub use events::{BlocksMined, MineEvents};
pub use network_manager::{NetworkManager, NetworkSpec};
pub use orchestrator::Orchestrator;
pub use store::LightningStore;
