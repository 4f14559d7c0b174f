//! Boundary between the connection state machine and the wireless stack.
//!
//! [`Radio`] is implemented over btleplug in [`crate::bluetooth`] and by a
//! scripted fake in the connection tests.

use async_trait::async_trait;
use mac_address::MacAddress;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::RawFrame;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bluetooth: {0}")]
    Bluetooth(#[from] btleplug::Error),
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("scan ended without a matching advertisement")]
    ScanEnded,
    #[error("peripheral {0} is not known to the adapter")]
    UnknownPeripheral(String),
    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),
    #[error("{0}")]
    Other(String),
}

/// Which advertisement to connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameFilter {
    pub name: String,
    pub address: Option<MacAddress>,
}

impl NameFilter {
    pub fn new(name: impl Into<String>) -> Self {
        NameFilter {
            name: name.into(),
            address: None,
        }
    }

    pub fn matches(&self, local_name: &str, address: &str) -> bool {
        if local_name != self.name {
            return false;
        }
        match self.address {
            Some(pinned) => pinned.to_string().eq_ignore_ascii_case(address),
            None => true,
        }
    }
}

/// The one peripheral the state machine is tracking.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Stable identifier, the device address where the platform exposes one.
    pub id: String,
    pub name: String,
}

/// A resolved service/characteristic pair on a connected peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub notify: bool,
}

/// Radio operations, one per handshake stage.
///
/// Every method may be cancelled by dropping its future; implementations
/// must leave the adapter usable afterwards.
#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// Scan until an advertisement matches `filter`. Scanning is stopped
    /// before returning.
    async fn scan(&self, filter: &NameFilter) -> Result<PeripheralHandle, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;

    /// UUIDs of the services the peripheral exposes.
    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<Uuid>, TransportError>;

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, TransportError>;

    /// Enable notifications on `endpoint`. Frames arrive on the returned
    /// queue in order; the queue closes when the link is lost.
    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        endpoint: ServiceEndpoint,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RawFrame>, TransportError>;

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_filter() {
        let filter = NameFilter::new("Galaxy");
        assert!(filter.matches("Galaxy", "11:22:33:44:55:66"));
        assert!(!filter.matches("galaxy", "11:22:33:44:55:66"));
        assert!(!filter.matches("Galaxy S", "11:22:33:44:55:66"));
    }

    #[test]
    fn test_name_filter_with_address() {
        let filter = NameFilter {
            name: "Galaxy".into(),
            address: Some("AA:BB:CC:DD:EE:FF".parse().unwrap()),
        };
        assert!(filter.matches("Galaxy", "aa:bb:cc:dd:ee:ff"));
        assert!(!filter.matches("Galaxy", "11:22:33:44:55:66"));
    }
}
