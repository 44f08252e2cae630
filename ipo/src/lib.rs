#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod path;
pub mod receiver;
pub mod reorder;

pub use receiver::{IpoPathConfig, IpoReceivedPacket, IpoStats, IpoStream, IpoStreamConfig};
pub use reorder::{InsertOutcome, ReorderBuffer, ReorderConfig};

/// Default maximum path differential: SMPTE ST 2022-7 class B
/// (moderate skew) receivers.
pub const DEFAULT_MAX_PATH_DIFFERENTIAL_US: u64 = 50_000;
