//! Events the loop emits towards whoever is watching the run.

use serde::{Deserialize, Serialize};

use autosurf_core_types::LogEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    /// Something the oracle wanted the user to read.
    Assistant,
    /// Something the loop itself reports.
    System,
}

#[derive(Clone, Debug)]
pub enum AgentEvent {
    /// One-way message for the user.
    Message { role: EventRole, content: String },
    /// The run is paused until `provide_user_response` is called.
    Question { content: String },
    /// Console output captured while oracle code ran on the page.
    Log(LogEntry),
    /// The run ended abnormally.
    Error { message: String },
    /// The instruction finished.
    Completed,
}
