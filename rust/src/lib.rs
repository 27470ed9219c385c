//! LE Link Layer connection engine implemented in Rust

pub mod config;
pub mod llcp;
pub mod ops;
pub mod packets;

pub use config::LlConfig;
pub use llcp::conn::{ConnId, ConnSpec, ConnectionParams};
pub use llcp::manager::{LinkLayer, LinkLayerError};
pub use ops::{ControllerOps, TimerKind};
