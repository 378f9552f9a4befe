//! Handler registration and replay
//!
//! The engine module holds the frozen [`HandlerRegistry`] the dispatch loop
//! routes work items through.

mod registry;

pub use registry::{
    AnyActivity, AnyWorkflow, HandlerKind, HandlerRegistry, HandlerRegistryBuilder, RegistryError,
    WorkflowFactory,
};
