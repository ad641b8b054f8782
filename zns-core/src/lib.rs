// vim: tw=80
//! Block-aligned, zone-aware I/O channels over a zoned storage device

pub mod channel;
pub mod channel_factory;
pub mod config;
pub mod device;
pub mod file_device;
pub mod types;
pub mod util;
pub mod zone;

pub use crate::types::*;
pub use crate::util::*;
