#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod affinity;
pub mod clock;
mod error;
pub mod marshal;
pub mod rational;
pub mod shutdown;

pub use error::{Error, Result};
pub use rational::Rational;

/// Cache-line size used to pad packet strides. Queried from the OS once,
/// 64 bytes when the query is unavailable.
pub fn cache_line_size() -> usize {
    #[cfg(target_os = "linux")]
    {
        let linesize = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
        if linesize > 0 {
            return linesize as usize;
        }
    }
    64
}

/// Base page size of the running kernel.
pub fn page_size() -> usize {
    #[cfg(not(windows))]
    {
        let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if pagesize > 0 {
            return pagesize as usize;
        }
    }
    4096
}

/// Rounds `n` up to the next multiple of a power-of-two `alignment`.
pub fn align_up_pow2(n: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (n + alignment - 1) & !(alignment - 1)
}

/// Rounds `n` up to the next multiple of `round` (not necessarily a power
/// of two).
pub fn round_up(n: usize, round: usize) -> usize {
    (n + round - 1) / round * round
}
