//! Line framing over the reassembled notification stream.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, trace};
use tokio::time::Instant;

use crate::transport::ByteTransport;

/// Turns queued packets into characters and sentinel-terminated lines.
pub struct LineFramer {
    transport: ByteTransport,
    buffer: VecDeque<char>,
}

impl LineFramer {
    pub fn new(transport: ByteTransport) -> Self {
        Self {
            transport,
            buffer: VecDeque::new(),
        }
    }

    pub fn transport(&mut self) -> &mut ByteTransport {
        &mut self.transport
    }

    /// Characters decoded but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn decode(&mut self, packet: &[u8]) {
        // Adapter output is ASCII; bytes map one-to-one onto chars.
        self.buffer.extend(packet.iter().map(|&b| b as char));
    }

    /// Next character of the stream.
    ///
    /// Drains everything already queued before suspending, then waits for
    /// packets only while the buffer is still empty.
    pub async fn next_char(&mut self) -> char {
        if self.buffer.is_empty() {
            while let Some(packet) = self.transport.poll_packet() {
                self.decode(&packet);
            }
        }
        loop {
            if let Some(c) = self.buffer.pop_front() {
                return c;
            }
            let packet = self.transport.next_packet().await;
            self.decode(&packet);
        }
    }

    /// Accumulate characters until `terminator` (included) or `deadline`.
    ///
    /// Hitting the deadline is not an error: whatever arrived so far is returned.
    pub async fn read_until(&mut self, terminator: char, deadline: Instant) -> String {
        let mut line = String::new();
        loop {
            match tokio::time::timeout_at(deadline, self.next_char()).await {
                Ok(c) => {
                    line.push(c);
                    if c == terminator {
                        trace!("line complete: {:?}", line);
                        break;
                    }
                }
                Err(_) => {
                    debug!("read deadline reached with partial line: {:?}", line);
                    break;
                }
            }
        }
        line
    }

    /// Wait `delay`, then discard all queued packets and the partial line.
    pub async fn flush(&mut self, delay: Duration) {
        tokio::time::sleep(delay).await;
        let mut dropped = 0usize;
        while self.transport.poll_packet().is_some() {
            dropped += 1;
        }
        if dropped > 0 || !self.buffer.is_empty() {
            debug!(
                "flushed {} packets and {} buffered chars",
                dropped,
                self.buffer.len()
            );
        }
        self.buffer.clear();
    }
}
