use thiserror::Error;

use autosurf_oracle::OracleError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// An instruction is already running on this orchestrator.
    #[error("an instruction is already running")]
    Busy,
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("reached maximum steps limit: {steps}")]
    MaxSteps { steps: u32 },
    #[error("internal agent error: {0}")]
    Internal(String),
}
