//! Text command protocol spoken by ELM327/STN-style adapters.
//!
//! Commands are ASCII terminated by a carriage return. Responses end with a
//! `>` prompt. Adapters with local echo enabled repeat the command (and its
//! carriage return) before the answer, and every response ends with a fixed
//! three character trailer (`\r\r>`), which is discarded.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use crate::errors::{DriverError, Result};
use crate::framer::LineFramer;
use crate::scope::Scope;

/// Prompt character that ends every response.
pub const PROMPT: char = '>';

/// Appended to every outbound command.
pub const COMMAND_TERMINATOR: char = '\r';

/// Fixed-width tail of each response: two carriage returns and the prompt.
pub const TRAILER_LEN: usize = 3;

/// Response wait used when a caller has no better estimate.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Command/response contract consumed by the poller and the handshake.
///
/// Calls for one device must be serialized; implementations are not
/// re-entrant.
#[async_trait]
pub trait Commander: Send {
    /// Send `command` without waiting for a response.
    async fn send_command(&mut self, command: &str) -> Result<()>;

    /// Send `command` and return its response payload.
    async fn send_command_with_response(&mut self, command: &str, timeout: Duration)
        -> Result<String>;

    /// Wait `delay`, then drop any output still queued, such as the late
    /// answer to a command whose read already gave up.
    async fn flush(&mut self, delay: Duration) -> Result<()>;
}

/// [`Commander`] over a device's line framer, bound to that device's session scope.
pub struct CommandProtocol {
    framer: LineFramer,
    scope: Scope,
    response_timeout: Duration,
}

impl CommandProtocol {
    pub fn new(framer: LineFramer, response_timeout: Duration) -> Self {
        Self {
            framer,
            scope: Scope::new(),
            response_timeout,
        }
    }

    /// Register all further operations under `scope`.
    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = scope;
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }
}

#[async_trait]
impl Commander for CommandProtocol {
    async fn send_command(&mut self, command: &str) -> Result<()> {
        let frame = format!("{command}{COMMAND_TERMINATOR}");
        debug!("-> {:?}", frame);
        let scope = self.scope.clone();
        let transport = self.framer.transport();
        let max_chunk = transport.max_chunk_len();
        scope
            .run(transport.send_chunked(frame.as_bytes(), max_chunk))
            .await
    }

    async fn send_command_with_response(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<String> {
        let scope = self.scope.clone();
        scope
            .run(async {
                self.send_command(command).await?;
                let deadline = Instant::now() + timeout;
                let raw = self.framer.read_until(PROMPT, deadline).await;
                debug!("<- {:?}", raw);
                strip_response(command, &raw)
            })
            .await
    }

    async fn flush(&mut self, delay: Duration) -> Result<()> {
        let scope = self.scope.clone();
        scope
            .run(async {
                self.framer.flush(delay).await;
                Ok(())
            })
            .await
    }
}

/// Remove the command echo and the fixed trailer from a raw response.
///
/// A response shorter than the trailer (typically an empty read after the
/// deadline) is reported as [`DriverError::MalformedResponse`].
pub fn strip_response(command: &str, raw: &str) -> Result<String> {
    let body = match raw.strip_prefix(command) {
        Some(rest) => rest.strip_prefix(COMMAND_TERMINATOR).unwrap_or(rest),
        None => raw,
    };
    let keep = body
        .chars()
        .count()
        .checked_sub(TRAILER_LEN)
        .ok_or_else(|| DriverError::MalformedResponse {
            command: command.to_string(),
            raw: raw.to_string(),
        })?;
    Ok(body.chars().take(keep).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ScriptedSink, SimResponder};
    use crate::transport::{ByteTransport, ChunkSink};
    use std::sync::Arc;

    /// Accepts writes and never acknowledges them.
    struct SilentSink;

    impl ChunkSink for SilentSink {
        fn submit(&self, _chunk: &[u8]) -> Result<()> {
            Ok(())
        }

        fn max_chunk_len(&self) -> usize {
            20
        }
    }

    fn protocol(responder: SimResponder) -> (CommandProtocol, Arc<ScriptedSink>) {
        let sink = ScriptedSink::new(responder, 20);
        let (transport, handle) = ByteTransport::new(sink.clone(), Duration::from_secs(1));
        sink.attach(handle);
        (
            CommandProtocol::new(LineFramer::new(transport), DEFAULT_RESPONSE_TIMEOUT),
            sink,
        )
    }

    #[test]
    fn strips_echo_and_trailer() {
        let payload = strip_response("010C1", "010C1\r41 0C 1A F8\r\r>").unwrap();
        assert_eq!(payload, "41 0C 1A F8");
    }

    #[test]
    fn strips_trailer_without_echo() {
        assert_eq!(strip_response("ATH 0", "OK\r\r>").unwrap(), "OK");
        assert_eq!(strip_response("ATD", "OK>").unwrap(), "");
    }

    #[test]
    fn short_response_is_malformed() {
        let err = strip_response("0100", "").unwrap_err();
        assert!(matches!(err, DriverError::MalformedResponse { .. }));
        assert!(strip_response("0100", "0100\r>").is_err());
    }

    #[tokio::test]
    async fn command_is_framed_with_carriage_return() {
        let (mut protocol, sink) = protocol(SimResponder::default());
        protocol.send_command("ATZ").await.unwrap();
        assert_eq!(sink.written(), b"ATZ\r".to_vec());
    }

    #[tokio::test]
    async fn long_command_is_split_into_chunks() {
        let (mut protocol, sink) = protocol(SimResponder::default());
        let command = "AT".repeat(15);
        protocol.send_command(&command).await.unwrap();
        assert_eq!(sink.chunk_sizes(), vec![20, 11]);
    }

    #[tokio::test]
    async fn response_from_echoing_adapter() {
        let responder = SimResponder::default()
            .with_echo(true)
            .respond("010C1", "41 0C 1A F8");
        let (mut protocol, _sink) = protocol(responder);

        let response = protocol
            .send_command_with_response("010C1", DEFAULT_RESPONSE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(response, "41 0C 1A F8");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_adapter_yields_malformed_response() {
        let responder = SimResponder::default().mute("0100");
        let (mut protocol, _sink) = protocol(responder);

        let err = protocol
            .send_command_with_response("0100", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn cancelled_scope_fails_pending_reads() {
        let (mut protocol, _sink) = protocol(SimResponder::default().mute("0100"));
        let scope = Scope::new();
        protocol.set_scope(scope.clone());

        let pending = tokio::spawn(async move {
            protocol
                .send_command_with_response("0100", Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        scope.cancel();

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(DriverError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_releases_pending_send_and_read_together() {
        let scope = Scope::new();

        let (transport, writer) = ByteTransport::new(Arc::new(SilentSink), Duration::from_secs(30));
        let mut sending = CommandProtocol::new(LineFramer::new(transport), DEFAULT_RESPONSE_TIMEOUT);
        sending.set_scope(scope.clone());

        let (mut reading, _sink) = protocol(SimResponder::default().mute("0100"));
        reading.set_scope(scope.clone());

        let send = tokio::spawn(async move { sending.send_command("ATZ").await });
        let read = tokio::spawn(async move {
            reading
                .send_command_with_response("0100", Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(writer.has_pending_write());

        scope.cancel();

        assert!(matches!(send.await.unwrap(), Err(DriverError::Cancelled)));
        assert!(matches!(read.await.unwrap(), Err(DriverError::Cancelled)));
        assert!(!writer.has_pending_write());
    }

    #[tokio::test]
    async fn flush_discards_stray_output() {
        let (mut protocol, _sink) = protocol(SimResponder::default().respond("ATZ", "ELM327 v1.5"));
        protocol.send_command("ATZ").await.unwrap();

        protocol.flush(Duration::from_millis(1)).await.unwrap();

        let response = protocol
            .send_command_with_response("ATD", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(response, "OK");
    }
}
