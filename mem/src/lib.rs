#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod allocator;
pub mod gpu;
pub mod region;

pub use allocator::{
    allocate_with_fallback, new_allocator, Allocator, MemoryBlock, MemoryKind, MemoryUtils,
};
pub use gpu::{set_gpu_runtime, GpuRuntime};
pub use region::{deregister, registration_balance, DeviceIface, MemKey, Region};
