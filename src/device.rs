//! Observable list of discovered peripherals.

use tokio::sync::watch;

use crate::platform::{CharacteristicHandle, DeviceId};

/// Name shown for peripherals that advertise none.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// Last reported signal strength in dBm.
    pub rssi: i16,
    pub connected: bool,
    pub read_characteristic: Option<CharacteristicHandle>,
    pub write_characteristic: Option<CharacteristicHandle>,
}

/// Devices in discovery order. Entries live as long as the registry.
pub struct DeviceRegistry {
    tx: watch::Sender<Vec<Device>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Device>> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.tx.borrow().clone()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.tx.borrow().iter().find(|d| &d.id == id).cloned()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.tx.borrow().iter().any(|d| &d.id == id)
    }

    /// Record an advertisement. Returns true when the device is new.
    pub fn upsert_discovered(&self, id: DeviceId, name: Option<String>, rssi: i16) -> bool {
        let mut added = false;
        self.tx.send_modify(|devices| {
            if let Some(device) = devices.iter_mut().find(|d| d.id == id) {
                device.rssi = rssi;
            } else {
                devices.push(Device {
                    id,
                    name: name.unwrap_or_else(|| UNKNOWN_NAME.to_string()),
                    rssi,
                    connected: false,
                    read_characteristic: None,
                    write_characteristic: None,
                });
                added = true;
            }
        });
        added
    }

    pub fn set_characteristics(
        &self,
        id: &DeviceId,
        read: CharacteristicHandle,
        write: CharacteristicHandle,
    ) {
        self.update(id, |device| {
            device.read_characteristic = Some(read);
            device.write_characteristic = Some(write);
        });
    }

    pub fn set_connected(&self, id: &DeviceId, connected: bool) {
        self.update(id, |device| device.connected = connected);
    }

    fn update(&self, id: &DeviceId, f: impl FnOnce(&mut Device)) {
        self.tx.send_if_modified(|devices| match devices.iter_mut().find(|d| &d.id == id) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rediscovery_updates_signal_in_place() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert_discovered("AA:01".into(), Some("OBDLink CX".into()), -70));
        assert!(registry.upsert_discovered("AA:02".into(), None, -80));
        assert!(!registry.upsert_discovered("AA:01".into(), Some("renamed".into()), -55));

        let devices = registry.snapshot();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "OBDLink CX");
        assert_eq!(devices[0].rssi, -55);
        assert_eq!(devices[1].name, UNKNOWN_NAME);
    }

    #[test]
    fn subscribers_see_connection_flag() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        registry.upsert_discovered("AA:01".into(), None, -60);
        rx.mark_unchanged();

        registry.set_connected(&"AA:01".into(), true);

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update()[0].connected);
    }

    #[test]
    fn unknown_device_updates_are_ignored() {
        let registry = DeviceRegistry::new();
        let rx = registry.subscribe();
        registry.set_connected(&"AA:09".into(), true);
        assert!(!rx.has_changed().unwrap());
        assert!(registry.get(&"AA:09".into()).is_none());
    }
}
