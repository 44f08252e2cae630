#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod event;
pub mod flow;
pub mod layout;
mod ring;
pub mod rx;
pub mod stats;
pub mod tx;

use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use portable_atomic::AtomicU64;

use util::affinity::CPU_NONE;
use util::clock::Clock;
use util::{Error, Result};

pub use event::EventChannel;
pub use flow::FourTupleFlow;
pub use layout::{BlockLayout, PacketLayout, SubBlock};
pub use rx::{Completion, CompletionModeration, RxMemory, RxPacket, RxStream, RxStreamConfig};
pub use stats::{StatsSnapshot, StreamStats};
pub use tx::{ChunkSlot, TxStream, TxStreamConfig};

/// Opaque per-stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub fn new(raw: u64) -> Self {
        StreamId(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide transport configuration.
pub struct TransportConfig {
    pub clock: Clock,
    /// CPU for the per-stream hardware-side workers; `CPU_NONE` leaves
    /// them floating.
    pub internal_core: i64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            clock: Clock::system_tai(),
            internal_core: CPU_NONE,
        }
    }
}

/// The one transport context of the process. Streams are created
/// through it so they share the clock, the worker affinity policy and
/// the stream-id space.
pub struct TransportContext {
    clock: Clock,
    internal_core: i64,
    next_stream_id: AtomicU64,
}

lazy_static! {
    static ref CONTEXT: RwLock<Option<Arc<TransportContext>>> = RwLock::new(None);
}

/// Initializes the process-wide context. A second initialization while
/// one is live is an argument error; `cleanup` makes room for a fresh
/// one.
pub fn initialize(config: TransportConfig) -> Result<Arc<TransportContext>> {
    let mut slot = CONTEXT.write();
    if slot.is_some() {
        return Err(Error::invalid_argument("transport already initialized"));
    }
    let context = Arc::new(TransportContext {
        clock: config.clock,
        internal_core: config.internal_core,
        next_stream_id: AtomicU64::new(1),
    });
    *slot = Some(context.clone());
    log::info!("transport context initialized");
    Ok(context)
}

/// The live context, or `NotInitialized`.
pub fn context() -> Result<Arc<TransportContext>> {
    CONTEXT.read().clone().ok_or(Error::NotInitialized)
}

/// Drops the process-wide context. Streams already created stay valid;
/// a non-zero memory registration balance at this point is a leak and
/// is logged.
pub fn cleanup() {
    let mut slot = CONTEXT.write();
    if slot.take().is_some() {
        let balance = mem::registration_balance();
        if balance != 0 {
            log::warn!("transport cleanup with {balance} memory registrations outstanding");
        } else {
            log::info!("transport context cleaned up");
        }
    }
}

impl TransportContext {
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    fn allocate_stream_id(&self) -> StreamId {
        StreamId(self.next_stream_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
    }

    pub fn create_tx_stream(&self, config: TxStreamConfig) -> Result<TxStream> {
        TxStream::new(
            self.allocate_stream_id(),
            config,
            self.clock.clone(),
            self.internal_core,
        )
    }

    pub fn create_rx_stream(&self, config: RxStreamConfig) -> Result<RxStream> {
        RxStream::new(
            self.allocate_stream_id(),
            config,
            self.clock.clone(),
            self.internal_core,
        )
    }
}

#[cfg(test)]
mod lib_test {
    use super::*;

    #[test]
    fn test_context_lifecycle() {
        // runs isolated from stream tests, which construct streams
        // directly with explicit ids
        cleanup();
        assert!(matches!(context(), Err(Error::NotInitialized)));
        let ctx = initialize(TransportConfig::default()).unwrap();
        assert!(initialize(TransportConfig::default()).is_err());
        let a = ctx.allocate_stream_id();
        let b = ctx.allocate_stream_id();
        assert_ne!(a, b);
        cleanup();
        assert!(matches!(context(), Err(Error::NotInitialized)));
    }
}
