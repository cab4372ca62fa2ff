pub mod bridge;
pub mod cache;
pub mod proto;
pub mod serial;
pub mod types;
pub mod writebuf;

pub use bridge::{BridgeConfig, ControllerSelect, DriveTypeId, FluxBridge};
