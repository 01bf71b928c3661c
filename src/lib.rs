//! Cascade: a workload orchestration engine for data-derivation workflows.
//!
//! A submitted request carries a DAG of works. The clerk expands it into
//! transforms, the transformer maps contents and opens processings, the
//! carrier drives each processing against an external back-end, and the
//! conductor fans finished-work notifications out to subscribers. Agents
//! coordinate through a mergeable, prioritized event bus and a shared entity
//! store with cooperative row locking.

pub mod agents;
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod store;
pub mod work;

pub use agents::{spawn_agent, Agent, Carrier, Clerk, Conductor, Transformer};
pub use api::{
    abort_request, get_request_status, resume_request, submit_request, RequestStatusView,
    RequestSubmission,
};
pub use config::{AgentConfig, CoordinatorConfig, ServerConfig};
pub use error::{CascadeError, Result};
pub use events::{Coordinator, CoordinatorHandle, Event, EventBus, EventPriority, EventType};
pub use store::{EntityStore, MemoryStore, SledStore};
pub use work::{
    register_generic_work, resolve_work, ExecutionBackend, ScriptedBackend, Work, WorkSpec,
    WorkType,
};
