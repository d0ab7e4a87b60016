use serde::{Deserialize, Serialize};

/// One recorded (prompt, review) pair. Immutable once appended to history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub prompt: String,
    pub review: String,
}

impl Attempt {
    pub fn new(prompt: impl Into<String>, review: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            review: review.into(),
        }
    }
}

/// Append-only, insertion-ordered record of prior attempts for one run.
///
/// Order is significant: the revision transcript numbers entries by append
/// position, starting at 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptHistory {
    attempts: Vec<Attempt>,
}

impl AttemptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn contains_prompt(&self, candidate: &str) -> bool {
        self.attempts
            .iter()
            .any(|attempt| attempt.prompt == candidate)
    }
}
