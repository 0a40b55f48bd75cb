//! Link lifecycle: discovery, connect, GATT setup and dialect detection.
//!
//! ```text
//! NotConnected -> Connecting -> (services, characteristics) -> Detecting -> Connected
//!       ^______________ cancellation / any failure ______________|
//! ```
//!
//! The manager is driven by [`PlatformEvent`]s (see [`ConnectionManager::run`])
//! and by the user-facing calls [`ConnectionManager::connect`],
//! [`ConnectionManager::cancel_connection`] and
//! [`ConnectionManager::set_scanning`]. Every protocol operation on the
//! active device runs under the link's session [`Scope`], which is cancelled
//! before any state is reverted.

use std::fmt::Display;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::config::{ClientConfig, HandshakeConfig, LinkConfig};
use crate::device::DeviceRegistry;
use crate::errors::{BluetoothError, DriverError, Result};
use crate::framer::LineFramer;
use crate::platform::{BlePlatform, CharacteristicHandle, DeviceId, PlatformEvent, PlatformSink};
use crate::protocol::{CommandProtocol, Commander};
use crate::scope::Scope;
use crate::transport::{ByteTransport, TransportHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Detecting,
    Connected,
}

/// Published when the active link becomes usable or goes away.
pub enum LinkEvent {
    /// Handshake done; the protocol is bound to the link's session scope.
    Ready {
        id: DeviceId,
        protocol: CommandProtocol,
    },
    Lost {
        id: DeviceId,
    },
}

#[derive(Default)]
struct LinkState {
    active: Option<DeviceId>,
    session: Scope,
    transport: Option<TransportHandle>,
    scanning: bool,
    scan_scope: Scope,
}

struct Inner {
    platform: Arc<dyn BlePlatform>,
    link: LinkConfig,
    handshake: HandshakeConfig,
    devices: DeviceRegistry,
    status: watch::Sender<ConnectionStatus>,
    state: Mutex<LinkState>,
    links: mpsc::UnboundedSender<LinkEvent>,
}

/// Connection state machine for a single adapter link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        config: &ClientConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (links, links_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        let manager = Self {
            inner: Arc::new(Inner {
                platform,
                link: config.link.clone(),
                handshake: config.handshake.clone(),
                devices: DeviceRegistry::new(),
                status,
                state: Mutex::new(LinkState::default()),
                links,
            }),
        };
        (manager, links_rx)
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.inner.devices
    }

    /// Device currently being connected or connected.
    pub fn active_device(&self) -> Option<DeviceId> {
        self.state().active.clone()
    }

    /// Callback handle of the active link's transport, once GATT setup is done.
    pub fn transport_handle(&self) -> Option<TransportHandle> {
        self.state().transport.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            debug!("connection status: {:?} -> {:?}", previous, status);
        }
    }

    /// Consume platform events until the platform drops its sender.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<PlatformEvent>) {
        info!("connection manager started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!("platform event stream closed");
    }

    /// Turn discovery on or off.
    ///
    /// Turning it on arms an auto-stop countdown under a fresh scope; turning
    /// it off cancels that countdown.
    pub fn set_scanning(&self, enabled: bool) {
        let mut state = self.state();
        if state.scanning == enabled {
            return;
        }

        if enabled {
            if let Err(e) = self
                .inner
                .platform
                .start_scan(self.inner.link.service_uuid, true)
            {
                warn!("failed to start discovery: {}", e);
                return;
            }
            state.scanning = true;
            let countdown = state.scan_scope.replace();
            drop(state);

            let duration = self.inner.link.scan_duration();
            info!("discovery started, stopping in {:?}", duration);
            let this = self.clone();
            tokio::spawn(async move {
                let expired = countdown
                    .run(async {
                        tokio::time::sleep(duration).await;
                        Ok(())
                    })
                    .await;
                if expired.is_ok() {
                    this.expire_scan(&countdown);
                }
            });
        } else {
            state.scan_scope.cancel();
            state.scanning = false;
            drop(state);
            self.stop_scan();
        }
    }

    fn expire_scan(&self, countdown: &Scope) {
        let mut state = self.state();
        if countdown.is_cancelled() || !state.scanning {
            return;
        }
        state.scan_scope.cancel();
        state.scanning = false;
        drop(state);
        debug!("discovery countdown elapsed");
        self.stop_scan();
    }

    fn stop_scan(&self) {
        if let Err(e) = self.inner.platform.stop_scan() {
            warn!("failed to stop discovery: {}", e);
        }
        info!("discovery stopped");
    }

    /// Start connecting to a discovered device. Returns once the request is issued.
    pub fn connect(&self, id: &DeviceId) -> Result<()> {
        if !self.inner.devices.contains(id) {
            return Err(BluetoothError::NotFound { id: id.to_string() }.into());
        }
        {
            let mut state = self.state();
            if let Some(active) = &state.active {
                return Err(DriverError::NotReady(format!(
                    "link to {active} already in progress"
                )));
            }
            state.active = Some(id.clone());
        }
        self.set_status(ConnectionStatus::Connecting);
        info!("connecting to {}", id);

        if let Err(e) = self.inner.platform.connect(id) {
            warn!("connect request for {} rejected: {}", id, e);
            self.teardown(false);
            self.set_scanning(true);
            return Err(e);
        }
        Ok(())
    }

    /// Abandon the current link at whatever stage it is and resume discovery.
    pub fn cancel_connection(&self) {
        info!("cancelling connection");
        self.teardown(true);
        self.set_scanning(true);
    }

    /// Cancel the session scope, drop queued link data and revert to `NotConnected`.
    fn teardown(&self, disconnect: bool) {
        let (active, transport) = {
            let mut state = self.state();
            state.session.cancel();
            (state.active.take(), state.transport.take())
        };
        if let Some(transport) = transport {
            transport.reset();
        }
        if let Some(id) = active {
            if disconnect {
                if let Err(e) = self.inner.platform.disconnect(&id) {
                    warn!("disconnect of {} failed: {}", id, e);
                }
            }
            self.inner.devices.set_connected(&id, false);
            if self.inner.links.send(LinkEvent::Lost { id }).is_err() {
                debug!("link event dropped: no consumer");
            }
        }
        self.set_status(ConnectionStatus::NotConnected);
    }

    fn fail(&self, id: &DeviceId, reason: impl Display) {
        warn!("connection to {} failed: {}", id, reason);
        self.teardown(true);
        self.set_scanning(true);
    }

    fn is_active(&self, id: &DeviceId) -> bool {
        self.state().active.as_ref() == Some(id)
    }

    fn route(&self, id: &DeviceId) -> Option<TransportHandle> {
        let state = self.state();
        match &state.active {
            Some(active) if active == id => state.transport.clone(),
            _ => None,
        }
    }

    /// Apply one event reported by the platform stack.
    pub fn handle_event(&self, event: PlatformEvent) {
        let link = &self.inner.link;
        match event {
            PlatformEvent::PoweredOn => {
                info!("bluetooth powered on");
                self.set_scanning(true);
            }
            PlatformEvent::PoweredOff => {
                warn!("bluetooth powered off");
                self.teardown(false);
                self.set_scanning(false);
            }
            PlatformEvent::PeripheralDiscovered { id, name, rssi } => {
                let label = name.clone();
                if self.inner.devices.upsert_discovered(id.clone(), name, rssi) {
                    info!("discovered {} ({:?}, {} dBm)", id, label, rssi);
                }
            }
            PlatformEvent::ConnectSucceeded { id } => {
                if !self.is_active(&id) || self.status() != ConnectionStatus::Connecting {
                    return;
                }
                debug!("link up to {}, discovering services", id);
                if let Err(e) = self
                    .inner
                    .platform
                    .discover_services(&id, &[link.service_uuid])
                {
                    self.fail(&id, e);
                }
            }
            PlatformEvent::ConnectFailed { id, reason } => {
                if self.is_active(&id) {
                    warn!("connection to {} failed: {}", id, reason);
                    self.teardown(false);
                    self.set_scanning(true);
                }
            }
            PlatformEvent::ServicesDiscovered { id, result } => {
                if !self.is_active(&id) {
                    return;
                }
                match result {
                    Ok(services) if services.contains(&link.service_uuid) => {
                        let wanted = [link.read_characteristic, link.write_characteristic];
                        if let Err(e) = self.inner.platform.discover_characteristics(
                            &id,
                            link.service_uuid,
                            &wanted,
                        ) {
                            self.fail(&id, e);
                        }
                    }
                    Ok(_) => self.fail(
                        &id,
                        BluetoothError::Discovery(format!(
                            "service {} not offered",
                            link.service_uuid
                        )),
                    ),
                    Err(reason) => self.fail(&id, BluetoothError::Discovery(reason)),
                }
            }
            PlatformEvent::CharacteristicsDiscovered {
                id,
                service,
                result,
            } => {
                if !self.is_active(&id) {
                    return;
                }
                match result {
                    Ok(found)
                        if found.contains(&link.read_characteristic)
                            && found.contains(&link.write_characteristic) =>
                    {
                        self.begin_detect(id, service);
                    }
                    Ok(_) => self.fail(
                        &id,
                        BluetoothError::Discovery("adapter characteristics missing".into()),
                    ),
                    Err(reason) => self.fail(&id, BluetoothError::Discovery(reason)),
                }
            }
            PlatformEvent::ValueUpdated {
                id,
                characteristic,
                value,
            } => {
                if characteristic != link.read_characteristic {
                    return;
                }
                if let Some(transport) = self.route(&id) {
                    transport.on_packet_arrived(value);
                }
            }
            PlatformEvent::WriteCompleted {
                id,
                characteristic,
                result,
            } => {
                if characteristic != link.write_characteristic {
                    return;
                }
                if let Some(transport) = self.route(&id) {
                    transport.on_write_acked(result);
                }
            }
            PlatformEvent::Disconnected { id } => {
                if self.is_active(&id) {
                    warn!("link to {} dropped", id);
                    self.teardown(false);
                    self.set_scanning(true);
                }
            }
        }
    }

    /// Subscribe to adapter output and run the detection handshake.
    fn begin_detect(&self, id: DeviceId, service: Uuid) {
        let link = &self.inner.link;
        let read = CharacteristicHandle {
            service,
            uuid: link.read_characteristic,
        };
        let write = CharacteristicHandle {
            service,
            uuid: link.write_characteristic,
        };
        self.inner.devices.set_characteristics(&id, read, write);

        if let Err(e) = self.inner.platform.enable_notifications(&id, &read) {
            self.fail(&id, e);
            return;
        }

        let sink = Arc::new(PlatformSink::new(
            self.inner.platform.clone(),
            id.clone(),
            write,
        ));
        let (transport, handle) = ByteTransport::new(sink, link.write_ack_timeout());
        let mut protocol = CommandProtocol::new(LineFramer::new(transport), link.response_timeout());
        let session = {
            let mut state = self.state();
            state.transport = Some(handle);
            state.session.replace()
        };
        protocol.set_scope(session.clone());

        self.set_scanning(false);
        self.set_status(ConnectionStatus::Detecting);
        info!("detecting adapter protocol on {}", id);

        let this = self.clone();
        let handshake = self.inner.handshake.clone();
        tokio::spawn(async move {
            let outcome = session
                .run(detect_protocol(&mut protocol, &handshake))
                .await;
            this.finish_detect(id, &session, outcome, protocol);
        });
    }

    fn finish_detect(
        &self,
        id: DeviceId,
        session: &Scope,
        outcome: Result<String>,
        protocol: CommandProtocol,
    ) {
        match outcome {
            Ok(answer) => {
                let state = self.state();
                if session.is_cancelled() || state.active.as_ref() != Some(&id) {
                    debug!("handshake for {} finished after teardown", id);
                    return;
                }
                self.inner.devices.set_connected(&id, true);
                self.set_status(ConnectionStatus::Connected);
                info!("adapter on {} ready, status answer {:?}", id, answer);
                // Queued under the state lock so a teardown's `Lost` always follows it.
                if self
                    .inner
                    .links
                    .send(LinkEvent::Ready { id, protocol })
                    .is_err()
                {
                    debug!("link event dropped: no consumer");
                }
                drop(state);
            }
            Err(e) if e.is_cancelled() => debug!("handshake on {} cancelled", id),
            Err(e) => {
                if !session.is_cancelled() && self.is_active(&id) {
                    self.fail(&id, format_args!("handshake failed: {e}"));
                }
            }
        }
    }
}

/// Wake-up command, flush, configuration commands, then the status request.
pub async fn detect_protocol(
    protocol: &mut CommandProtocol,
    handshake: &HandshakeConfig,
) -> Result<String> {
    protocol.send_command(&handshake.wake).await?;
    protocol.flush(handshake.flush_delay()).await?;

    let timeout = protocol.response_timeout();
    for command in &handshake.commands {
        let answer = protocol.send_command_with_response(command, timeout).await?;
        debug!("{} -> {:?}", command, answer);
    }

    protocol
        .send_command_with_response(&handshake.status_command, handshake.status_timeout())
        .await
}
