use serde::{Deserialize, Serialize};

/// Tuning knobs for the loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on oracle consultations per instruction.
    pub max_steps: u32,
    /// Pause between consecutive dispatched actions.
    pub wait_between_actions_ms: u64,
    /// Pause before re-observing when the oracle returned no actions.
    pub idle_poll_ms: u64,
    /// Attach a viewport screenshot to each observation.
    pub enable_vision: bool,
    /// Line cap for the page outline sent to the oracle.
    pub outline_max_nodes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            wait_between_actions_ms: 100,
            idle_poll_ms: 250,
            enable_vision: true,
            outline_max_nodes: 200,
        }
    }
}

impl AgentConfig {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_vision(mut self, enabled: bool) -> Self {
        self.enable_vision = enabled;
        self
    }

    pub fn with_wait_between_actions_ms(mut self, ms: u64) -> Self {
        self.wait_between_actions_ms = ms;
        self
    }

    pub fn with_idle_poll_ms(mut self, ms: u64) -> Self {
        self.idle_poll_ms = ms;
        self
    }
}
