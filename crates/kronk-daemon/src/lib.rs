//! The kronk daemon: supervisor, IPC server, CLI, and project
//! bootstrap. The binary in `main.rs` is a thin wrapper over this.

pub mod bootstrap;
pub mod cli;
pub mod ipc;
pub mod llm_bridge;
pub mod logging;
pub mod paths;
pub mod pid;
pub mod supervisor;
