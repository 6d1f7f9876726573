//! btleplug transport for real meters
//!
//! Adapter events and GATT notifications arrive on btleplug streams; small
//! forwarding tasks turn them into [`TransportEvent`]s on the session's
//! channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{
    AdapterInfo, CharacteristicId, DeviceId, EventReceiver, EventSender, Property, SERVICE,
    Transport, TransportEvent, event_channel,
};

/// Address of the peripheral we are connected to, shared with the adapter
/// event task
type Target = Arc<Mutex<Option<String>>>;

pub struct BtleTransport {
    events: EventSender,
    adapter: Option<Adapter>,
    peripheral: Option<Peripheral>,
    characteristics: HashMap<Uuid, Characteristic>,
    target: Target,
    adapter_task: Option<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
}

impl BtleTransport {
    pub fn new() -> (Self, EventReceiver) {
        let (events, receiver) = event_channel();
        let transport = Self {
            events,
            adapter: None,
            peripheral: None,
            characteristics: HashMap::new(),
            target: Arc::new(Mutex::new(None)),
            adapter_task: None,
            notify_task: None,
        };
        (transport, receiver)
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter.as_ref().ok_or(TransportError::NoAdapter)
    }

    fn peripheral(&self) -> Result<&Peripheral, TransportError> {
        self.peripheral.as_ref().ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, id: CharacteristicId) -> Result<&Characteristic, TransportError> {
        self.characteristics
            .get(&id.0)
            .ok_or_else(|| TransportError::Gatt(format!("characteristic {} not resolved", id.0)))
    }

    fn set_target(&self, address: Option<String>) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = address;
    }

    fn forget_peripheral(&mut self) {
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.peripheral = None;
        self.characteristics.clear();
        self.set_target(None);
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        if let Some(task) = self.adapter_task.take() {
            task.abort();
        }
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
    }
}

/// Scan result for `id`, if it advertises the meter service
async fn describe(adapter: &Adapter, id: &PeripheralId) -> Option<TransportEvent> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok()??;
    if !props.services.contains(&SERVICE) {
        return None;
    }
    Some(TransportEvent::DeviceFound {
        device: DeviceId(peripheral.address().to_string()),
        name: props.local_name,
    })
}

async fn is_target(adapter: &Adapter, id: &PeripheralId, target: &Target) -> bool {
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return false;
    };
    let address = peripheral.address().to_string();
    let current = target.lock().unwrap_or_else(PoisonError::into_inner).clone();
    current.as_deref() == Some(address.as_str())
}

#[async_trait]
impl Transport for BtleTransport {
    async fn find_adapter(&mut self) -> Result<AdapterInfo, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;
        let name = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|_| "unknown adapter".to_string());

        let mut stream = adapter.events().await?;
        let central = adapter.clone();
        let events = self.events.clone();
        let target = Arc::clone(&self.target);
        if let Some(task) = self.adapter_task.take() {
            task.abort();
        }
        self.adapter_task = Some(tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        describe(&central, &id).await
                    }
                    CentralEvent::DeviceConnected(id) => is_target(&central, &id, &target)
                        .await
                        .then_some(TransportEvent::PropertyChanged(Property::Connected(true))),
                    CentralEvent::DeviceDisconnected(id) => is_target(&central, &id, &target)
                        .await
                        .then_some(TransportEvent::PropertyChanged(Property::Connected(false))),
                    _ => None,
                };
                if let Some(event) = forwarded {
                    if events.send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("adapter event stream ended");
        }));

        self.adapter = Some(adapter);
        Ok(AdapterInfo { name })
    }

    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError> {
        self.adapter()?
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| TransportError::Scan(e.to_string()))
    }

    async fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.adapter()?.stop_scan().await?;
        Ok(())
    }

    async fn connect(&mut self, device: &DeviceId) -> Result<(), TransportError> {
        let peripherals = self.adapter()?.peripherals().await?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string() == device.0)
            .ok_or_else(|| TransportError::Connection(format!("{device} is no longer known")))?;

        self.forget_peripheral();
        self.set_target(Some(device.0.clone()));
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        peripheral.discover_services().await?;
        info!("{device}: {} services", peripheral.services().len());

        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn resolve_characteristic(
        &mut self,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicId>, TransportError> {
        let found = self
            .peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid);
        Ok(found.map(|characteristic| {
            self.characteristics.insert(uuid, characteristic);
            CharacteristicId(uuid)
        }))
    }

    async fn subscribe_notify(
        &mut self,
        characteristic: CharacteristicId,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?.clone();
        let target = self.characteristic(characteristic)?.clone();
        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| TransportError::Gatt(e.to_string()))?;

        let mut stream = peripheral.notifications().await?;
        let events = self.events.clone();
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.notify_task = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != characteristic.0 {
                    continue;
                }
                let event = TransportEvent::Notification {
                    characteristic,
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!("notification stream ended");
        }));
        Ok(())
    }

    async fn write(
        &mut self,
        characteristic: CharacteristicId,
        bytes: &[u8],
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral()?
            .write(target, bytes, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::Gatt(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(peripheral) = self.peripheral.clone() else {
            return Ok(());
        };
        self.forget_peripheral();
        if let Err(e) = peripheral.disconnect().await {
            warn!("disconnect: {e}");
            return Err(e.into());
        }
        Ok(())
    }
}
