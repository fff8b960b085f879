// Library interface for the cortex bridge
//
// The binary (`src/main.rs`) is a thin host around `bridge::runtime`; the
// integration tests drive the worker through this crate.

pub mod bridge;

pub use bridge::{
    BridgeConfig, BridgeError, BridgeResult, Channel, Operation, PendingResponse, Reply,
};
