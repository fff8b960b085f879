// Dispatch-and-correlation bridge between the foreground and the model worker

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod host;
pub mod logger;
pub mod models;
pub mod registry;
pub mod runtime;
pub mod supervisor;
pub mod system;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{load_config, BridgeConfig, WorkerMode};
pub use dispatcher::{Dispatcher, Reply};
pub use error::{BridgeError, BridgeResult};
pub use models::*;
pub use registry::{CallRegistry, DeliveryState, PendingResponse};
pub use runtime::{Bridge, SharedBridge};
pub use supervisor::{Liveness, WorkerHandle, WorkerSupervisor};
