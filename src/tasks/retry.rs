//! Retry policy shared by every task type

use super::TaskRecord;
use serde::{Deserialize, Serialize};

fn default_max_attempts() -> usize {
    3
}

/// How many times a task may run before a retryable failure becomes final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self { max_attempts }
    }

    /// Whether a task whose history already includes the latest attempt
    /// may run again
    pub fn should_retry(&self, task: &TaskRecord) -> bool {
        task.history.len() < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{ExecutionAttempt, TaskType};
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;

    fn with_attempts(n: usize) -> TaskRecord {
        let mut task = TaskRecord::new(TaskType::PullFile, json!({}));
        task.history = (0..n)
            .map(|_| ExecutionAttempt {
                started_at: Utc::now(),
                finished_at: Utc::now(),
                error: Some("timeout".into()),
            })
            .collect();
        task
    }

    #[rstest]
    #[case(1, true)]
    #[case(2, true)]
    #[case(3, false)]
    #[case(4, false)]
    fn test_default_policy(#[case] attempts: usize, #[case] retry: bool) {
        assert_eq!(RetryPolicy::default().should_retry(&with_attempts(attempts)), retry);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        assert!(!RetryPolicy::new(1).should_retry(&with_attempts(1)));
    }
}
