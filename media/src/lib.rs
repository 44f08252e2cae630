#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod convert;
pub mod frame;
pub mod pipeline;
pub mod queue;
pub mod schedule;
pub mod sender;
pub mod sync;

pub use frame::{AudioBuffer, SampleFormat, VideoFrame};
pub use pipeline::{MediaPipeline, PipelineConfig, PipelineCores, StreamSelection};
pub use queue::{BoundedQueue, QueueItem};
pub use schedule::{TxSchedule, COMMIT_GUARD_NS};
pub use sync::LoopSync;
