//! Packet transport over a notify/write characteristic pair.
//!
//! Inbound notifications are queued in arrival order by the platform callback
//! ([`TransportHandle::on_packet_arrived`]) and drained by the line framer.
//! Outbound data is split into chunks of at most the link's write length; each
//! chunk waits for its write acknowledgment before the next one is submitted,
//! so at most one write is ever outstanding.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::{oneshot, Notify};

use crate::errors::{DriverError, Result};

/// Acknowledgment wait per chunk when nothing else is configured.
pub const DEFAULT_WRITE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

type AckSender = oneshot::Sender<std::result::Result<(), String>>;

/// Outbound side of the link, implemented by the platform layer.
pub trait ChunkSink: Send + Sync {
    /// Submit a single chunk for a write-with-response.
    ///
    /// Must return without waiting; completion is reported through
    /// [`TransportHandle::on_write_acked`].
    fn submit(&self, chunk: &[u8]) -> Result<()>;

    /// Largest chunk the link accepts in one write.
    fn max_chunk_len(&self) -> usize;
}

/// The outstanding chunk write, plus acks still owed for writes the sender
/// gave up on. Acks arrive in submission order, so those are discarded first.
#[derive(Default)]
struct AckSlot {
    waiting: Option<AckSender>,
    abandoned: u32,
}

#[derive(Default)]
struct Shared {
    inbound: Mutex<VecDeque<Vec<u8>>>,
    arrived: Notify,
    pending: Mutex<AckSlot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Platform-facing callbacks for one device link.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl TransportHandle {
    /// Queue a received notification. Never blocks.
    pub fn on_packet_arrived(&self, packet: Vec<u8>) {
        trace!("packet arrived: {} bytes", packet.len());
        lock(&self.shared.inbound).push_back(packet);
        self.shared.arrived.notify_one();
    }

    /// Resolve the outstanding chunk write.
    pub fn on_write_acked(&self, result: std::result::Result<(), String>) {
        let mut slot = lock(&self.shared.pending);
        if slot.abandoned > 0 {
            slot.abandoned -= 1;
            debug!("late acknowledgment of an abandoned write: {:?}", result);
            return;
        }
        match slot.waiting.take() {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!("write acknowledgment with no pending write: {:?}", result),
        }
    }

    pub fn queued_packets(&self) -> usize {
        lock(&self.shared.inbound).len()
    }

    pub fn has_pending_write(&self) -> bool {
        lock(&self.shared.pending).waiting.is_some()
    }

    /// Drop every queued packet and abandon the pending write, if any.
    pub fn reset(&self) {
        lock(&self.shared.inbound).clear();
        *lock(&self.shared.pending) = AckSlot::default();
    }
}

/// Clears the pending-write slot when a send is abandoned mid-wait. The ack
/// for that chunk may still come and must not complete a later write.
struct PendingWrite<'a> {
    shared: &'a Shared,
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        let mut slot = lock(&self.shared.pending);
        if slot.waiting.take().is_some() {
            slot.abandoned += 1;
        }
    }
}

/// Byte stream endpoint consumed by the line framer.
pub struct ByteTransport {
    shared: Arc<Shared>,
    sink: Arc<dyn ChunkSink>,
    ack_timeout: Duration,
}

impl ByteTransport {
    /// Create a transport and the callback handle the platform feeds.
    pub fn new(sink: Arc<dyn ChunkSink>, ack_timeout: Duration) -> (Self, TransportHandle) {
        let shared = Arc::new(Shared::default());
        let handle = TransportHandle {
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                sink,
                ack_timeout,
            },
            handle,
        )
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn max_chunk_len(&self) -> usize {
        self.sink.max_chunk_len()
    }

    /// Send `bytes` in chunks of at most `max_chunk_size`, one acknowledged write at a time.
    pub async fn send_chunked(&mut self, bytes: &[u8], max_chunk_size: usize) -> Result<()> {
        for chunk in chunk_payload(bytes, max_chunk_size) {
            let (tx, rx) = oneshot::channel();
            lock(&self.shared.pending).waiting = Some(tx);
            let _pending = PendingWrite {
                shared: &self.shared,
            };

            if let Err(e) = self.sink.submit(chunk) {
                // Nothing was queued, so no acknowledgment will follow.
                lock(&self.shared.pending).waiting = None;
                return Err(e);
            }

            match tokio::time::timeout(self.ack_timeout, rx).await {
                Ok(Ok(Ok(()))) => debug!("chunk acknowledged: {} bytes", chunk.len()),
                Ok(Ok(Err(reason))) => return Err(DriverError::Write(reason)),
                Ok(Err(_)) => return Err(DriverError::Write("pending write abandoned".into())),
                Err(_) => return Err(DriverError::WriteTimeout(self.ack_timeout)),
            }
        }
        Ok(())
    }

    /// Oldest queued packet, waiting for one if the queue is empty.
    pub async fn next_packet(&mut self) -> Vec<u8> {
        loop {
            if let Some(packet) = self.poll_packet() {
                return packet;
            }
            self.shared.arrived.notified().await;
        }
    }

    pub fn poll_packet(&mut self) -> Option<Vec<u8>> {
        lock(&self.shared.inbound).pop_front()
    }
}

/// Split a payload into write-sized chunks. A zero size is treated as one byte.
pub fn chunk_payload(bytes: &[u8], max_chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    bytes.chunks(max_chunk_size.max(1))
}
