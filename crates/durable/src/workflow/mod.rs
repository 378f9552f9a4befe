//! Workflow abstractions
//!
//! - [`Workflow`] trait for deterministic workflow state machines
//! - [`WorkflowAction`] commands returned to the backend
//! - [`WorkflowEvent`] history entries replayed into a workflow

mod action;
mod definition;
mod event;

pub use action::{ActivityOptions, WorkflowAction};
pub use definition::{Workflow, WorkflowError};
pub use event::{WorkflowEvent, WorkflowSignal};
