//! The agent loop: observe the page, ask the oracle, act, repeat.

pub mod config;
pub mod errors;
pub mod events;
pub mod orchestrator;

pub use config::AgentConfig;
pub use errors::AgentError;
pub use events::{AgentEvent, EventRole};
pub use orchestrator::AgentOrchestrator;
