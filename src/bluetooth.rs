use std::collections::HashMap;

use async_trait::async_trait;
use btleplug::api::{
    Central as _, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt as _;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::RawFrame;
use crate::radio::{
    CharacteristicInfo, NameFilter, PeripheralHandle, Radio, ServiceEndpoint, TransportError,
};

/// [`Radio`] over the host's first bluetooth adapter.
pub struct BluetoothRadio {
    adapter: Adapter,
    peripherals: Mutex<HashMap<String, Peripheral>>,
}

impl BluetoothRadio {
    pub fn new(adapter: Adapter) -> Self {
        BluetoothRadio {
            adapter,
            peripherals: Mutex::new(HashMap::new()),
        }
    }

    pub async fn first_adapter() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        match adapter.adapter_info().await {
            Ok(adapter_info) => info!("Using bluetooth adapter {adapter_info}"),
            Err(err) => debug!("Could not describe adapter: {err}"),
        }
        Ok(Self::new(adapter))
    }

    fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(handle.id.clone()))
    }

    /// Resolve an advertisement to a handle if it matches `filter`.
    async fn matching(
        &self,
        id: &PeripheralId,
        filter: &NameFilter,
    ) -> Result<Option<PeripheralHandle>, TransportError> {
        let peripheral = self.adapter.peripheral(id).await?;
        let Some(properties) = peripheral.properties().await? else {
            return Ok(None);
        };
        let Some(local_name) = properties.local_name else {
            return Ok(None);
        };
        let address = properties.address.to_string();
        if !filter.matches(&local_name, &address) {
            return Ok(None);
        }

        let handle = PeripheralHandle {
            id: address,
            name: local_name,
        };
        self.peripherals
            .lock()
            .insert(handle.id.clone(), peripheral);
        Ok(Some(handle))
    }
}

#[async_trait]
impl Radio for BluetoothRadio {
    async fn scan(&self, filter: &NameFilter) -> Result<PeripheralHandle, TransportError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("Scanning for {:?}", filter.name);

        let found = loop {
            match events.next().await {
                Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => {
                    match self.matching(&id, filter).await {
                        Ok(Some(handle)) => break Ok(handle),
                        Ok(None) => {}
                        Err(err) => debug!("Skipping {id:?}: {err}"),
                    }
                }
                Some(_) => {}
                None => break Err(TransportError::ScanEnded),
            }
        };

        if let Err(err) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {err}");
        }
        found
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let device = self.peripheral(peripheral)?;
        if !device.is_connected().await? {
            device.connect().await?;
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Vec<Uuid>, TransportError> {
        let device = self.peripheral(peripheral)?;
        device.discover_services().await?;
        Ok(device.services().iter().map(|service| service.uuid).collect())
    }

    async fn discover_characteristics(
        &self,
        peripheral: &PeripheralHandle,
        service: Uuid,
    ) -> Result<Vec<CharacteristicInfo>, TransportError> {
        let device = self.peripheral(peripheral)?;
        let characteristics = device
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| {
                s.characteristics
                    .iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        notify: c.properties.contains(CharPropFlags::NOTIFY),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(characteristics)
    }

    async fn subscribe(
        &self,
        peripheral: &PeripheralHandle,
        endpoint: ServiceEndpoint,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RawFrame>, TransportError> {
        let device = self.peripheral(peripheral)?;
        let characteristic = device
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == endpoint.characteristic && c.service_uuid == endpoint.service)
            .ok_or(TransportError::MissingCharacteristic(endpoint.characteristic))?;

        let mut events = self.adapter.events().await?;
        let mut notifications = device.notifications().await?;
        device.subscribe(&characteristic).await?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let device_id = peripheral.id.clone();
        let peripheral_id = device.id();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            debug!("Notification stream for {device_id} ended");
                            break;
                        };
                        if notification.uuid != characteristic.uuid {
                            continue;
                        }
                        let frame = RawFrame::new(device_id.as_str(), notification.value);
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("{device_id} disconnected");
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                    () = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }

    async fn disconnect(&self, peripheral: &PeripheralHandle) -> Result<(), TransportError> {
        let device = self.peripherals.lock().get(&peripheral.id).cloned();
        let Some(device) = device else {
            return Ok(());
        };
        if device.is_connected().await? {
            device.disconnect().await?;
        }
        // Kept until the link is down so an interrupted disconnect can be retried.
        self.peripherals.lock().remove(&peripheral.id);
        Ok(())
    }
}
