//! BlueZ backend over D-Bus, built on `bluer`.
//!
//! Every [`BlePlatform`] call returns immediately; the D-Bus round trip runs
//! on the tokio runtime the platform was created on and its outcome comes back
//! as a [`PlatformEvent`].

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bluer::gatt::remote::Characteristic;
use bluer::{
    AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport, Session,
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::errors::{BluetoothError, DriverError, Result};
use crate::platform::{BlePlatform, CharacteristicHandle, DeviceId, PlatformEvent};

/// ATT header bytes subtracted from the negotiated MTU.
const ATT_HEADER_LEN: usize = 3;
/// Write length before the MTU is known.
const DEFAULT_WRITE_LEN: usize = 20;

fn connection_error(e: bluer::Error) -> DriverError {
    DriverError::Bluetooth(BluetoothError::Connection(e.to_string()))
}

#[derive(Default)]
struct BluezState {
    scan: Option<JoinHandle<()>>,
    characteristics: HashMap<(DeviceId, Uuid), Characteristic>,
    write_len: HashMap<DeviceId, usize>,
    /// Notification and link watchers per device, aborted on disconnect.
    tasks: HashMap<DeviceId, Vec<JoinHandle<()>>>,
}

struct Shared {
    adapter: bluer::Adapter,
    events: UnboundedSender<PlatformEvent>,
    state: Mutex<BluezState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BluezState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PlatformEvent) {
        if self.events.send(event).is_err() {
            debug!("bluez event dropped: receiver closed");
        }
    }

    fn device(&self, id: &DeviceId) -> std::result::Result<bluer::Device, String> {
        let address = Address::from_str(&id.0).map_err(|e| format!("invalid address {id}: {e}"))?;
        self.adapter.device(address).map_err(|e| e.to_string())
    }

    fn track(&self, id: &DeviceId, task: JoinHandle<()>) {
        self.state().tasks.entry(id.clone()).or_default().push(task);
    }

    fn forget(&self, id: &DeviceId) {
        let mut state = self.state();
        if let Some(tasks) = state.tasks.remove(id) {
            for task in tasks {
                task.abort();
            }
        }
        state.characteristics.retain(|(device, _), _| device != id);
        state.write_len.remove(id);
    }
}

/// [`BlePlatform`] on the default BlueZ adapter.
pub struct BluezPlatform {
    runtime: Handle,
    _session: Session,
    shared: Arc<Shared>,
    power_watch: JoinHandle<()>,
}

impl BluezPlatform {
    /// Open the default adapter, power it on and report its power state.
    pub async fn new(events: UnboundedSender<PlatformEvent>) -> Result<Self> {
        let session = Session::new().await.map_err(connection_error)?;
        let adapter = session.default_adapter().await.map_err(connection_error)?;
        adapter.set_powered(true).await.map_err(connection_error)?;
        info!("using bluetooth adapter: name={}", adapter.name());

        let shared = Arc::new(Shared {
            adapter,
            events,
            state: Mutex::new(BluezState::default()),
        });

        let mut changes = Box::pin(shared.adapter.events().await.map_err(connection_error)?);
        if shared.adapter.is_powered().await.map_err(connection_error)? {
            shared.emit(PlatformEvent::PoweredOn);
        }
        let watcher = shared.clone();
        let power_watch = tokio::spawn(async move {
            while let Some(event) = changes.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    watcher.emit(if powered {
                        PlatformEvent::PoweredOn
                    } else {
                        PlatformEvent::PoweredOff
                    });
                }
            }
        });

        Ok(Self {
            runtime: Handle::current(),
            _session: session,
            shared,
            power_watch,
        })
    }

    fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(fut)
    }
}

impl BlePlatform for BluezPlatform {
    fn start_scan(&self, service: Uuid, allow_duplicates: bool) -> Result<()> {
        let shared = self.shared.clone();
        let task = self.spawn(async move {
            let filter = DiscoveryFilter {
                uuids: HashSet::from([service]),
                duplicate_data: allow_duplicates,
                transport: DiscoveryTransport::Le,
                ..Default::default()
            };
            if let Err(e) = shared.adapter.set_discovery_filter(filter).await {
                warn!("failed to set discovery filter: {}", e);
            }
            let mut found = match shared.adapter.discover_devices_with_changes().await {
                Ok(stream) => Box::pin(stream),
                Err(e) => {
                    warn!("discovery failed to start: {}", e);
                    return;
                }
            };
            while let Some(event) = found.next().await {
                let address = match event {
                    AdapterEvent::DeviceAdded(address) => address,
                    _ => continue,
                };
                let Ok(device) = shared.adapter.device(address) else {
                    continue;
                };
                let name = device.name().await.ok().flatten();
                let rssi = device.rssi().await.ok().flatten().unwrap_or_default();
                shared.emit(PlatformEvent::PeripheralDiscovered {
                    id: DeviceId(address.to_string()),
                    name,
                    rssi,
                });
            }
        });
        if let Some(previous) = self.shared.state().scan.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<()> {
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(scan) = self.shared.state().scan.take() {
            scan.abort();
        }
        Ok(())
    }

    fn connect(&self, id: &DeviceId) -> Result<()> {
        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn(async move {
            let device = match shared.device(&id) {
                Ok(device) => device,
                Err(reason) => {
                    shared.emit(PlatformEvent::ConnectFailed { id, reason });
                    return;
                }
            };
            if let Err(e) = device.connect().await {
                shared.emit(PlatformEvent::ConnectFailed {
                    id,
                    reason: e.to_string(),
                });
                return;
            }

            match device.events().await {
                Ok(changes) => {
                    let mut changes = Box::pin(changes);
                    let watcher = shared.clone();
                    let watched = id.clone();
                    let task = tokio::spawn(async move {
                        while let Some(event) = changes.next().await {
                            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) =
                                event
                            {
                                info!("device disconnected: mac={}", watched);
                                watcher.emit(PlatformEvent::Disconnected { id: watched });
                                break;
                            }
                        }
                    });
                    shared.track(&id, task);
                }
                Err(e) => warn!("cannot watch link state of {}: {}", id, e),
            }
            info!("device connected: mac={}", id);
            shared.emit(PlatformEvent::ConnectSucceeded { id });
        });
        Ok(())
    }

    fn disconnect(&self, id: &DeviceId) -> Result<()> {
        self.shared.forget(id);
        let shared = self.shared.clone();
        let id = id.clone();
        self.spawn(async move {
            let result = match shared.device(&id) {
                Ok(device) => device.disconnect().await.map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };
            match result {
                Ok(()) => shared.emit(PlatformEvent::Disconnected { id }),
                Err(e) => warn!("disconnect failed: mac={}, error={}", id, e),
            }
        });
        Ok(())
    }

    fn discover_services(&self, id: &DeviceId, services: &[Uuid]) -> Result<()> {
        let shared = self.shared.clone();
        let id = id.clone();
        let wanted = services.to_vec();
        self.spawn(async move {
            let result = async {
                let device = shared.device(&id)?;
                let mut offered = Vec::new();
                for service in device.services().await.map_err(|e| e.to_string())? {
                    let uuid = service.uuid().await.map_err(|e| e.to_string())?;
                    if wanted.is_empty() || wanted.contains(&uuid) {
                        offered.push(uuid);
                    }
                }
                Ok::<_, String>(offered)
            }
            .await;
            shared.emit(PlatformEvent::ServicesDiscovered { id, result });
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()> {
        let shared = self.shared.clone();
        let id = id.clone();
        let wanted = characteristics.to_vec();
        self.spawn(async move {
            let result = async {
                let device = shared.device(&id)?;
                let mut found = Vec::new();
                for remote in device.services().await.map_err(|e| e.to_string())? {
                    if remote.uuid().await.map_err(|e| e.to_string())? != service {
                        continue;
                    }
                    for characteristic in
                        remote.characteristics().await.map_err(|e| e.to_string())?
                    {
                        let uuid = characteristic.uuid().await.map_err(|e| e.to_string())?;
                        if !wanted.is_empty() && !wanted.contains(&uuid) {
                            continue;
                        }
                        if let Ok(mtu) = characteristic.mtu().await {
                            let len = mtu.saturating_sub(ATT_HEADER_LEN).max(1);
                            shared.state().write_len.insert(id.clone(), len);
                        }
                        shared
                            .state()
                            .characteristics
                            .insert((id.clone(), uuid), characteristic);
                        found.push(uuid);
                    }
                }
                Ok::<_, String>(found)
            }
            .await;
            shared.emit(PlatformEvent::CharacteristicsDiscovered {
                id,
                service,
                result,
            });
        });
        Ok(())
    }

    fn enable_notifications(
        &self,
        id: &DeviceId,
        characteristic: &CharacteristicHandle,
    ) -> Result<()> {
        let remote = self.characteristic(id, characteristic)?;
        let shared = self.shared.clone();
        let device = id.clone();
        let uuid = characteristic.uuid;
        let task = self.spawn(async move {
            let mut values = match remote.notify().await {
                Ok(stream) => Box::pin(stream),
                Err(e) => {
                    warn!("notifications refused: mac={}, error={}", device, e);
                    return;
                }
            };
            while let Some(value) = values.next().await {
                shared.emit(PlatformEvent::ValueUpdated {
                    id: device.clone(),
                    characteristic: uuid,
                    value,
                });
            }
            debug!("notification stream ended: mac={}", device);
        });
        self.shared.track(id, task);
        Ok(())
    }

    fn write_value(
        &self,
        id: &DeviceId,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()> {
        let remote = self.characteristic(id, characteristic)?;
        let shared = self.shared.clone();
        let id = id.clone();
        let uuid = characteristic.uuid;
        let value = value.to_vec();
        self.spawn(async move {
            let result = remote.write(&value).await.map_err(|e| e.to_string());
            shared.emit(PlatformEvent::WriteCompleted {
                id,
                characteristic: uuid,
                result,
            });
        });
        Ok(())
    }

    fn max_write_len(&self, id: &DeviceId) -> usize {
        self.shared
            .state()
            .write_len
            .get(id)
            .copied()
            .unwrap_or(DEFAULT_WRITE_LEN)
    }
}

impl BluezPlatform {
    fn characteristic(
        &self,
        id: &DeviceId,
        handle: &CharacteristicHandle,
    ) -> Result<Characteristic> {
        self.shared
            .state()
            .characteristics
            .get(&(id.clone(), handle.uuid))
            .cloned()
            .ok_or_else(|| {
                DriverError::Bluetooth(BluetoothError::NotConnected(format!(
                    "{id}: characteristic {} not discovered",
                    handle.uuid
                )))
            })
    }
}

impl Drop for BluezPlatform {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        if let Some(scan) = state.scan.take() {
            scan.abort();
        }
        for task in state.tasks.drain().flat_map(|(_, tasks)| tasks) {
            task.abort();
        }
        drop(state);
        self.power_watch.abort();
    }
}
