//! Background model worker.
//!
//! The model normally runs in a separate child process for:
//! - Memory reclaim: kill the process to free all model memory
//! - Crash isolation: a model crash doesn't take the host down

pub mod ipc_types;
pub mod launcher;
pub mod process_manager;
pub mod worker_bridge;
pub mod worker_main;
