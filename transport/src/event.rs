use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use util::{Error, Result};

/// Upper bound on any single blocking wait, so cancellation is never
/// more than a second away.
pub const MAX_WAIT: Duration = Duration::from_secs(1);

/// Stream event channel. The "hardware" side (the stream worker) kicks
/// it whenever it advances: a TX chunk freed, RX packets produced. The
/// application side arms a wait and blocks until the next kick.
#[derive(Default)]
pub struct EventChannel {
    generation: Mutex<u64>,
    cv: Condvar,
}

impl EventChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(EventChannel::default())
    }

    /// Hardware-side notification.
    pub fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        drop(generation);
        self.cv.notify_all();
    }

    /// Blocks until the channel is kicked, `timeout` elapses, or
    /// shutdown is requested (`Signal`). A timeout is not an error;
    /// callers re-poll their ring and wait again.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        let mut generation = self.generation.lock();
        let armed = *generation;
        while *generation == armed {
            if util::shutdown::exit_requested() {
                return Err(Error::Signal);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let step = (deadline - now).min(MAX_WAIT);
            self.cv.wait_for(&mut generation, step);
        }
        Ok(())
    }
}

#[cfg(test)]
mod event_test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_notify_wakes_waiter() {
        let channel = EventChannel::new();
        let waiter = channel.clone();
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        channel.notify();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let channel = EventChannel::new();
        let start = Instant::now();
        channel.wait(Duration::from_millis(30)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
