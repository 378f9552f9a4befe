//! Workflow commands and activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;

/// Commands a workflow issues in response to history events
///
/// The worker returns these to the backend at the end of a workflow task;
/// the backend decides when and where they are carried out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Identifier of this activity within the workflow
        activity_id: String,

        /// Registered activity type
        activity_type: String,

        /// Activity input (JSON)
        input: serde_json::Value,

        /// Execution options
        options: ActivityOptions,
    },

    /// Start a timer
    StartTimer {
        timer_id: String,

        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Complete the workflow with a result
    CompleteWorkflow { result: serde_json::Value },

    /// Fail the workflow
    FailWorkflow { error: WorkflowError },
}

impl WorkflowAction {
    /// Schedule an activity with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Whether this command ends the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. }
        )
    }
}

/// Options for activity execution
///
/// Retries and timeouts are enforced by the backend; the worker only
/// forwards them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Maximum attempts, including the first
    pub max_attempts: u32,

    /// Maximum time from start to completion
    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,

    /// Heartbeat timeout for long-running activities
    #[serde(default, with = "option_duration_millis")]
    pub heartbeat_timeout: Option<Duration>,

    /// Higher values are claimed first
    #[serde(default)]
    pub priority: i32,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
            priority: 0,
        }
    }
}

impl ActivityOptions {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
