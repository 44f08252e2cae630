use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use util::{Error, Result};

use crate::schedule::LOOP_REALIGN_MARGIN_NS;

struct SyncState {
    registered: usize,
    eof_count: usize,
    generation: u64,
    next_times: Vec<u64>,
    realigned_ns: u64,
    closed: bool,
}

/// Loop-mode EOF rendezvous. Every participating sender reports EOF with
/// its next send time and blocks; once all have arrived, the
/// synchronizer thread realigns them to `max(next sends) + 100 ms` and
/// releases the whole group, so video, audio and ancillary re-enter the
/// next iteration together.
pub struct LoopSync {
    state: Mutex<SyncState>,
    eof_cv: Condvar,
    release_cv: Condvar,
}

/// A registered participant slot.
#[derive(Debug, Clone, Copy)]
pub struct SyncHandle {
    index: usize,
}

impl LoopSync {
    pub fn new() -> Arc<Self> {
        Arc::new(LoopSync {
            state: Mutex::new(SyncState {
                registered: 0,
                eof_count: 0,
                generation: 0,
                next_times: Vec::new(),
                realigned_ns: 0,
                closed: false,
            }),
            eof_cv: Condvar::new(),
            release_cv: Condvar::new(),
        })
    }

    /// Adds a stream to the rendezvous. All registrations must happen
    /// before the first EOF is signalled.
    pub fn register(&self) -> SyncHandle {
        let mut state = self.state.lock();
        let index = state.registered;
        state.registered += 1;
        state.next_times.push(0);
        SyncHandle { index }
    }

    pub fn participants(&self) -> usize {
        self.state.lock().registered
    }

    /// Sender side: report EOF and block until the group is released.
    /// Returns the realigned next-send time.
    pub fn rendezvous(&self, handle: &SyncHandle, next_send_ns: u64) -> Result<u64> {
        let mut state = self.state.lock();
        state.next_times[handle.index] = next_send_ns;
        state.eof_count += 1;
        let generation = state.generation;
        self.eof_cv.notify_one();
        while state.generation == generation {
            if util::shutdown::exit_requested() || state.closed {
                return Err(Error::Signal);
            }
            self.release_cv
                .wait_for(&mut state, Duration::from_secs(1));
        }
        Ok(state.realigned_ns)
    }

    /// Ends the rendezvous; blocked senders are released with `Signal`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.eof_cv.notify_all();
        self.release_cv.notify_all();
    }

    /// Synchronizer thread body: serve rendezvous rounds until closed.
    pub fn run(self: Arc<Self>) {
        let mut rounds = 0u64;
        loop {
            let mut state = self.state.lock();
            while state.eof_count < state.registered || state.registered == 0 {
                if util::shutdown::exit_requested() || state.closed {
                    log::info!("loop synchronizer closing");
                    return;
                }
                self.eof_cv.wait_for(&mut state, Duration::from_secs(1));
            }
            let latest = state.next_times.iter().copied().max().unwrap_or(0);
            state.realigned_ns = latest + LOOP_REALIGN_MARGIN_NS;
            state.eof_count = 0;
            state.generation += 1;
            rounds += 1;
            drop(state);
            log::info!("end of loop #{rounds}");
            self.release_cv.notify_all();
        }
    }
}

#[cfg(test)]
mod sync_test {
    use super::*;

    #[test]
    fn test_rendezvous_realigns_to_latest_plus_margin() {
        let sync = LoopSync::new();
        let a = sync.register();
        let b = sync.register();
        let c = sync.register();

        let runner = sync.clone();
        let runner_handle = std::thread::spawn(move || runner.run());

        let mut joins = Vec::new();
        for (handle, next) in [(a, 500), (b, 900), (c, 700)] {
            let sync = sync.clone();
            joins.push(std::thread::spawn(move || sync.rendezvous(&handle, next)));
        }
        for join in joins {
            let realigned = join.join().unwrap().unwrap();
            assert_eq!(realigned, 900 + LOOP_REALIGN_MARGIN_NS);
        }

        sync.close();
        runner_handle.join().unwrap();
    }

    #[test]
    fn test_second_round_uses_fresh_times() {
        let sync = LoopSync::new();
        let a = sync.register();
        let runner = sync.clone();
        let runner_handle = std::thread::spawn(move || runner.run());

        let first = sync.rendezvous(&a, 1_000).unwrap();
        assert_eq!(first, 1_000 + LOOP_REALIGN_MARGIN_NS);
        let second = sync.rendezvous(&a, 2_000_000).unwrap();
        assert_eq!(second, 2_000_000 + LOOP_REALIGN_MARGIN_NS);

        sync.close();
        runner_handle.join().unwrap();
    }

    #[test]
    fn test_close_releases_blocked_sender() {
        let sync = LoopSync::new();
        let a = sync.register();
        let _b = sync.register(); // never arrives

        let blocked = sync.clone();
        let join = std::thread::spawn(move || blocked.rendezvous(&a, 1));
        std::thread::sleep(Duration::from_millis(30));
        sync.close();
        assert_eq!(join.join().unwrap().unwrap_err(), Error::Signal);
    }
}
