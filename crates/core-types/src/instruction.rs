use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::InstructionId;

/// One user-issued natural-language task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Instruction {
    pub id: InstructionId,
    /// Raw instruction text as entered by the user.
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Instruction {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: InstructionId::new(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_text_and_timestamp() {
        let before = Utc::now();
        let instruction = Instruction::new("go to example.com");
        assert_eq!(instruction.text, "go to example.com");
        assert!(instruction.created_at >= before);
    }
}
