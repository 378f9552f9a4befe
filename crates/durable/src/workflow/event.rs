//! Workflow history events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;

/// External signal delivered to a running workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    pub signal_type: String,
    pub payload: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

impl WorkflowSignal {
    pub fn new(signal_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            signal_type: signal_type.into(),
            payload,
            sent_at: Utc::now(),
        }
    }
}

/// History entries delivered with a workflow task
///
/// The backend owns the history; the worker replays it in order after
/// `on_start`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ActivityCompleted {
        activity_id: String,
        result: serde_json::Value,
    },

    ActivityFailed {
        activity_id: String,
        error: ActivityError,
    },

    TimerFired {
        timer_id: String,
    },

    SignalReceived {
        signal: WorkflowSignal,
    },
}

impl WorkflowEvent {
    /// Activity id for activity events
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }
}
