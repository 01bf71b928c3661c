//! Agent processes: discovery timers plus event handlers around the store.
//!
//! Each agent follows the same shape: a periodic discovery pass that claims
//! rows and turns them into events, and per-event handlers that do one
//! locked read-modify-write and emit the next event up or down the chain.

pub mod base;
pub mod carrier;
pub mod clerk;
pub mod conductor;
pub mod transformer;

pub use base::{spawn_agent, Agent, AgentCore};
pub use carrier::Carrier;
pub use clerk::Clerk;
pub use conductor::Conductor;
pub use transformer::Transformer;
