//! Boundary with the platform Bluetooth stack.
//!
//! The stack is driven through [`BlePlatform`] requests that return at once;
//! everything it reports back arrives as [`PlatformEvent`]s on the channel
//! handed to the implementation at construction time.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::errors::Result;
use crate::transport::ChunkSink;

/// Opaque, stable identifier of a peripheral (a MAC address under BlueZ).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

/// A GATT characteristic, addressed by its service and its own UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Expand a 16-bit assigned number into a full Bluetooth base UUID.
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Outcome reported by the platform, with its error rendered as text.
pub type PlatformResult<T> = std::result::Result<T, String>;

#[derive(Debug, Clone)]
pub enum PlatformEvent {
    PoweredOn,
    PoweredOff,
    PeripheralDiscovered {
        id: DeviceId,
        name: Option<String>,
        rssi: i16,
    },
    ConnectSucceeded {
        id: DeviceId,
    },
    ConnectFailed {
        id: DeviceId,
        reason: String,
    },
    ServicesDiscovered {
        id: DeviceId,
        result: PlatformResult<Vec<Uuid>>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        result: PlatformResult<Vec<Uuid>>,
    },
    ValueUpdated {
        id: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteCompleted {
        id: DeviceId,
        characteristic: Uuid,
        result: PlatformResult<()>,
    },
    Disconnected {
        id: DeviceId,
    },
}

/// Requests the core issues to the platform stack.
pub trait BlePlatform: Send + Sync {
    /// Scan for peripherals advertising `service`; with `allow_duplicates`
    /// every advertisement is reported so signal strength stays live.
    fn start_scan(&self, service: Uuid, allow_duplicates: bool) -> Result<()>;
    fn stop_scan(&self) -> Result<()>;
    fn connect(&self, id: &DeviceId) -> Result<()>;
    fn disconnect(&self, id: &DeviceId) -> Result<()>;
    fn discover_services(&self, id: &DeviceId, services: &[Uuid]) -> Result<()>;
    fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Result<()>;
    fn enable_notifications(&self, id: &DeviceId, characteristic: &CharacteristicHandle)
        -> Result<()>;
    /// Write-with-response; completion is reported as [`PlatformEvent::WriteCompleted`].
    fn write_value(
        &self,
        id: &DeviceId,
        characteristic: &CharacteristicHandle,
        value: &[u8],
    ) -> Result<()>;
    /// Largest value accepted by one write-with-response on this device.
    fn max_write_len(&self, id: &DeviceId) -> usize;
}

/// Routes transport chunks to a device's write characteristic.
pub struct PlatformSink {
    platform: Arc<dyn BlePlatform>,
    device: DeviceId,
    characteristic: CharacteristicHandle,
}

impl PlatformSink {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        device: DeviceId,
        characteristic: CharacteristicHandle,
    ) -> Self {
        Self {
            platform,
            device,
            characteristic,
        }
    }
}

impl ChunkSink for PlatformSink {
    fn submit(&self, chunk: &[u8]) -> Result<()> {
        self.platform
            .write_value(&self.device, &self.characteristic, chunk)
    }

    fn max_chunk_len(&self) -> usize {
        self.platform.max_write_len(&self.device)
    }
}
