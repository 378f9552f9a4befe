//! Activity trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Failure reported for an activity attempt
///
/// Serialized as-is into the backend so the scheduling workflow sees the
/// same value in its `ActivityFailed` history event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether the backend may schedule another attempt
    pub retryable: bool,

    pub details: Option<serde_json::Value>,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Input that does not match the activity's input type
    pub fn invalid_input(err: serde_json::Error) -> Self {
        Self::non_retryable(format!("invalid activity input: {err}")).with_type("INVALID_INPUT")
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(kind) => write!(f, "{kind}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// A unit of work scheduled by a workflow
///
/// ```ignore
/// struct ProcessImage { client: ServiceClient }
///
/// #[async_trait]
/// impl Activity for ProcessImage {
///     const TYPE: &'static str = "process_image";
///     type Input = serde_json::Value;
///     type Output = serde_json::Value;
///
///     async fn execute(&self, ctx: &ActivityContext, input: Self::Input)
///         -> Result<Self::Output, ActivityError>
///     {
///         self.client.post(&input).await
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Registered activity type name
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    /// Execute one attempt
    ///
    /// Return [`ActivityError::retryable`] for transient failures and
    /// [`ActivityError::non_retryable`] for permanent ones.
    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
