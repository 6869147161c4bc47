use thiserror::Error;

use crate::actions::ActionParseError;

#[derive(Debug, Error)]
pub enum OracleError {
    /// The backend could not be reached or refused the request.
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    /// The backend answered with something we cannot use.
    #[error("invalid oracle response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Action(#[from] ActionParseError),
}
