#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod checksum;
pub mod config;
pub mod report;

pub use ipo;
pub use media;
pub use mem;
pub use rtp;
pub use transport;
pub use util;

/// Process exit codes: success (including signal-driven shutdown),
/// runtime failure, usage error.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

/// Maps a run result onto the exit code contract: cooperative shutdown
/// is a success.
pub fn exit_code(result: &util::Result<()>) -> i32 {
    match result {
        Ok(()) | Err(util::Error::Signal) => EXIT_SUCCESS,
        Err(_) => EXIT_FAILURE,
    }
}

#[cfg(test)]
mod lib_test {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&Ok(())), EXIT_SUCCESS);
        assert_eq!(exit_code(&Err(util::Error::Signal)), EXIT_SUCCESS);
        assert_eq!(exit_code(&Err(util::Error::HwCompletionIssue)), EXIT_FAILURE);
    }
}
