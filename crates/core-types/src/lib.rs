//! Shared vocabulary for the autosurf workspace.
//!
//! This crate carries the identifiers and small value types that cross crate
//! boundaries: page/surface handles, captured console output, and the
//! instruction record the agent loop works on.

pub mod ids;
pub mod instruction;
pub mod log;

pub use ids::{InstructionId, PageId, SurfaceId};
pub use instruction::Instruction;
pub use log::{LogEntry, LogEntryId, LogSeverity};
