//! Activity abstractions
//!
//! Activities are the side-effecting units of work a workflow schedules.
//! The worker runs them inside execution pool slots; retries are the
//! backend's business.

mod context;
mod definition;

pub use context::{ActivityContext, CancellationHandle, HeartbeatError, HeartbeatPayload};
pub use definition::{Activity, ActivityError};
