//! Scripted oracle for tests and offline runs: replays canned turns.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::{DecisionOracle, OracleTurn};
use crate::errors::OracleError;
use crate::transcript::TranscriptMessage;

pub struct ScriptedOracle {
    turns: Mutex<VecDeque<OracleTurn>>,
}

impl ScriptedOracle {
    pub fn new(turns: Vec<OracleTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }
}

#[async_trait]
impl DecisionOracle for ScriptedOracle {
    async fn complete(
        &self,
        _messages: &[TranscriptMessage],
        _tools: &[Value],
    ) -> Result<OracleTurn, OracleError> {
        self.turns
            .lock()
            .map_err(|_| OracleError::Unavailable("scripted oracle poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| OracleError::Unavailable("scripted oracle exhausted".to_string()))
    }
}
