//! Simulated adapter for running without hardware.
//!
//! [`SimResponder`] answers commands the way an ELM327-compatible adapter
//! does. [`SimulatedAdapter`] wraps it in a [`BlePlatform`] that advertises a
//! peripheral and speaks the GATT side of the link; [`ScriptedSink`] plugs the
//! responder straight into a transport.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::errors::{BluetoothError, DriverError, Result};
use crate::platform::{BlePlatform, CharacteristicHandle, DeviceId, PlatformEvent};
use crate::transport::{ChunkSink, TransportHandle};

/// Notification payload size of a default ATT MTU.
const NOTIFY_LEN: usize = 20;

/// Tail the adapter appends after every response payload.
const RESPONSE_TRAILER: &str = "\r\r>";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Canned command responses.
#[derive(Debug, Clone, Default)]
pub struct SimResponder {
    echo: bool,
    frames: HashMap<String, String>,
    muted: HashSet<String>,
}

impl SimResponder {
    /// Answers for the demo: supported PIDs, engine and vehicle speed.
    pub fn demo() -> Self {
        Self::default()
            .respond("0100", "41 00 BE 3F B8 13")
            .respond("010C1", "41 0C 1A F8")
            .respond("010D1", "41 0D 32")
    }

    /// Repeat each command back before the answer.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Answer `command` with `payload` plus the usual trailer.
    pub fn respond(self, command: &str, payload: &str) -> Self {
        self.respond_raw(command, &format!("{payload}{RESPONSE_TRAILER}"))
    }

    /// Answer `command` with exactly `frame`.
    pub fn respond_raw(mut self, command: &str, frame: &str) -> Self {
        self.frames.insert(command.to_string(), frame.to_string());
        self
    }

    /// Never answer `command`.
    pub fn mute(mut self, command: &str) -> Self {
        self.muted.insert(command.to_string());
        self
    }

    /// Full response frame for `command`, or `None` if the adapter stays silent.
    pub fn reply(&self, command: &str) -> Option<String> {
        if self.muted.contains(command) {
            return None;
        }
        let frame = match self.frames.get(command) {
            Some(frame) => frame.clone(),
            None if command.starts_with("AT") => format!("OK{RESPONSE_TRAILER}"),
            None if command.chars().all(|c| c.is_ascii_hexdigit()) => {
                format!("NO DATA{RESPONSE_TRAILER}")
            }
            None => format!("?{RESPONSE_TRAILER}"),
        };
        if self.echo {
            Some(format!("{command}\r{frame}"))
        } else {
            Some(frame)
        }
    }
}

/// Splits outbound bytes into carriage-return terminated commands.
#[derive(Debug, Default)]
struct CommandLine {
    partial: String,
}

impl CommandLine {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut commands = Vec::new();
        for &b in bytes {
            if b == b'\r' {
                commands.push(std::mem::take(&mut self.partial));
            } else {
                self.partial.push(b as char);
            }
        }
        commands
    }
}

fn notifications(frame: &str) -> Vec<Vec<u8>> {
    frame
        .as_bytes()
        .chunks(NOTIFY_LEN)
        .map(<[u8]>::to_vec)
        .collect()
}

/// A [`ChunkSink`] that acknowledges every chunk and answers complete commands
/// through the transport handle it is attached to.
pub struct ScriptedSink {
    responder: SimResponder,
    max_chunk: usize,
    handle: Mutex<Option<TransportHandle>>,
    line: Mutex<CommandLine>,
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedSink {
    pub fn new(responder: SimResponder, max_chunk: usize) -> Arc<Self> {
        Arc::new(Self {
            responder,
            max_chunk,
            handle: Mutex::new(None),
            line: Mutex::new(CommandLine::default()),
            chunks: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, handle: TransportHandle) {
        *lock(&self.handle) = Some(handle);
    }

    /// Every byte written so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.chunks).concat()
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        lock(&self.chunks).iter().map(Vec::len).collect()
    }
}

impl ChunkSink for ScriptedSink {
    fn submit(&self, chunk: &[u8]) -> Result<()> {
        lock(&self.chunks).push(chunk.to_vec());
        let handle = lock(&self.handle)
            .clone()
            .ok_or_else(|| DriverError::NotReady("sink not attached".into()))?;
        handle.on_write_acked(Ok(()));
        for command in lock(&self.line).feed(chunk) {
            if let Some(frame) = self.responder.reply(&command) {
                for packet in notifications(&frame) {
                    handle.on_packet_arrived(packet);
                }
            }
        }
        Ok(())
    }

    fn max_chunk_len(&self) -> usize {
        self.max_chunk
    }
}

#[derive(Debug, Clone)]
struct SimPeripheral {
    id: DeviceId,
    name: Option<String>,
    rssi: i16,
}

#[derive(Debug, Default)]
struct SimState {
    scanning: bool,
    connected: Option<DeviceId>,
    notifying: bool,
    line: CommandLine,
    commands: Vec<String>,
}

/// In-process stand-in for the platform Bluetooth stack.
pub struct SimulatedAdapter {
    events: UnboundedSender<PlatformEvent>,
    link: LinkConfig,
    peripherals: Vec<SimPeripheral>,
    responder: SimResponder,
    max_write_len: usize,
    refuse_connect: bool,
    state: Mutex<SimState>,
}

impl SimulatedAdapter {
    pub fn new(events: UnboundedSender<PlatformEvent>, link: LinkConfig) -> Self {
        Self {
            events,
            link,
            peripherals: Vec::new(),
            responder: SimResponder::demo(),
            max_write_len: NOTIFY_LEN,
            refuse_connect: false,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_peripheral(mut self, id: &str, name: Option<&str>, rssi: i16) -> Self {
        self.peripherals.push(SimPeripheral {
            id: id.into(),
            name: name.map(str::to_string),
            rssi,
        });
        self
    }

    pub fn with_responder(mut self, responder: SimResponder) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_max_write_len(mut self, len: usize) -> Self {
        self.max_write_len = len;
        self
    }

    /// Report every connection attempt as failed.
    pub fn refusing_connections(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    /// Announce that the radio is up.
    pub fn power_on(&self) {
        self.emit(PlatformEvent::PoweredOn);
    }

    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    pub fn connected(&self) -> Option<DeviceId> {
        lock(&self.state).connected.clone()
    }

    fn emit(&self, event: PlatformEvent) {
        if self.events.send(event).is_err() {
            debug!("simulated event dropped: receiver closed");
        }
    }

    fn require_connected(&self, id: &DeviceId) -> Result<()> {
        match &lock(&self.state).connected {
            Some(current) if current == id => Ok(()),
            _ => Err(DriverError::Bluetooth(BluetoothError::NotConnected(
                id.to_string(),
            ))),
        }
    }
}

impl BlePlatform for SimulatedAdapter {
    fn start_scan(&self, service: Uuid, _allow_duplicates: bool) -> Result<()> {
        lock(&self.state).scanning = true;
        if service != self.link.service_uuid {
            return Ok(());
        }
        for peripheral in &self.peripherals {
            self.emit(PlatformEvent::PeripheralDiscovered {
                id: peripheral.id.clone(),
                name: peripheral.name.clone(),
                rssi: peripheral.rssi,
            });
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        lock(&self.state).scanning = false;
        Ok(())
    }

    fn connect(&self, id: &DeviceId) -> Result<()> {
        let known = self.peripherals.iter().any(|p| &p.id == id);
        if self.refuse_connect || !known {
            self.emit(PlatformEvent::ConnectFailed {
                id: id.clone(),
                reason: "peripheral unreachable".into(),
            });
            return Ok(());
        }
        lock(&self.state).connected = Some(id.clone());
        info!("simulated link up: {}", id);
        self.emit(PlatformEvent::ConnectSucceeded { id: id.clone() });
        Ok(())
    }

    fn disconnect(&self, id: &DeviceId) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.connected.as_ref() != Some(id) {
                return Ok(());
            }
            state.connected = None;
            state.notifying = false;
            state.line = CommandLine::default();
        }
        self.emit(PlatformEvent::Disconnected { id: id.clone() });
        Ok(())
    }

    fn discover_services(&self, id: &DeviceId, _services: &[Uuid]) -> Result<()> {
        let result = self
            .require_connected(id)
            .map(|_| vec![self.link.service_uuid])
            .map_err(|e| e.to_string());
        self.emit(PlatformEvent::ServicesDiscovered {
            id: id.clone(),
            result,
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
        _characteristics: &[Uuid],
    ) -> Result<()> {
        let result = self
            .require_connected(id)
            .map(|_| {
                if service == self.link.service_uuid {
                    vec![self.link.read_characteristic, self.link.write_characteristic]
                } else {
                    Vec::new()
                }
            })
            .map_err(|e| e.to_string());
        self.emit(PlatformEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service,
            result,
        });
        Ok(())
    }

    fn enable_notifications(
        &self,
        id: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<()> {
        self.require_connected(id)?;
        if characteristic.uuid == self.link.read_characteristic {
            lock(&self.state).notifying = true;
        }
        Ok(())
    }

    fn write_value(
        &self,
        id: &DeviceId,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()> {
        self.require_connected(id)?;
        if characteristic.uuid != self.link.write_characteristic {
            self.emit(PlatformEvent::WriteCompleted {
                id: id.clone(),
                characteristic: characteristic.uuid,
                result: Err("write not permitted".into()),
            });
            return Ok(());
        }

        let (commands, notifying) = {
            let mut state = lock(&self.state);
            let commands = state.line.feed(value);
            state.commands.extend(commands.iter().cloned());
            (commands, state.notifying)
        };

        self.emit(PlatformEvent::WriteCompleted {
            id: id.clone(),
            characteristic: characteristic.uuid,
            result: Ok(()),
        });

        if !notifying {
            return Ok(());
        }
        for command in commands {
            let Some(frame) = self.responder.reply(&command) else {
                debug!("simulated adapter ignores {:?}", command);
                continue;
            };
            for packet in notifications(&frame) {
                self.emit(PlatformEvent::ValueUpdated {
                    id: id.clone(),
                    characteristic: self.link.read_characteristic,
                    value: packet,
                });
            }
        }
        Ok(())
    }

    fn max_write_len(&self, _id: &DeviceId) -> usize {
        self.max_write_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_defaults_follow_adapter_conventions() {
        let responder = SimResponder::default();
        assert_eq!(responder.reply("ATZ").as_deref(), Some("OK\r\r>"));
        assert_eq!(responder.reply("0902").as_deref(), Some("NO DATA\r\r>"));
        assert_eq!(responder.reply("???").as_deref(), Some("?\r\r>"));
    }

    #[test]
    fn responder_echoes_and_mutes() {
        let responder = SimResponder::demo().with_echo(true).mute("0100");
        assert_eq!(
            responder.reply("010D1").as_deref(),
            Some("010D1\r41 0D 32\r\r>")
        );
        assert_eq!(responder.reply("0100"), None);
    }

    #[test]
    fn command_line_handles_split_writes() {
        let mut line = CommandLine::default();
        assert!(line.feed(b"ATS").is_empty());
        assert_eq!(line.feed(b"P 00\rATH"), vec!["ATSP 00".to_string()]);
        assert_eq!(line.feed(b" 0\r"), vec!["ATH 0".to_string()]);
    }

    #[test]
    fn long_frames_become_several_notifications() {
        let frame = "41 00 BE 3F B8 13\r41 00 98 18 80 11\r\r>";
        let packets = notifications(frame);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets.concat(), frame.as_bytes());
    }
}
