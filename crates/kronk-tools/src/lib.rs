//! The tool registry and built-in tool handlers.

pub mod confirm;
pub mod handlers;
mod registry;
pub mod skills;

pub use confirm::{ConfirmBroker, ConfirmRequest};
pub use registry::{
    build_dynamic_handler, DynamicDeps, ToolHandler, ToolRegistry, ToolSearchOpts,
};
