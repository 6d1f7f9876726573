//! Transport abstraction
//!
//! A transport is the BLE stack seen from the session: it scans, connects,
//! writes to one characteristic and reports everything asynchronous
//! (scan results, notifications, link changes) as [`TransportEvent`]s on a
//! channel handed out alongside it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// Meter GATT service, advertised by every Mooshimeter
pub const SERVICE: Uuid = Uuid::from_u128(0x1bc5ffa0_0200_62ab_e411_f254e005dbd4);

/// Client -> meter serial channel (write)
pub const SERIAL_IN: Uuid = Uuid::from_u128(0x1bc5ffa1_0200_62ab_e411_f254e005dbd4);

/// Meter -> client serial channel (notify)
pub const SERIAL_OUT: Uuid = Uuid::from_u128(0x1bc5ffa2_0200_62ab_e411_f254e005dbd4);

/// Transport-specific device handle, a MAC address for real hardware
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicId(pub Uuid);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
}

/// Link property change reported by the BLE stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Property {
    Connected(bool),
    Rssi(i16),
    ServicesResolved(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A scan result advertising the meter service
    DeviceFound {
        device: DeviceId,
        name: Option<String>,
    },
    /// One notification fragment
    Notification {
        characteristic: CharacteristicId,
        value: Vec<u8>,
    },
    PropertyChanged(Property),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// BLE central operations the session needs
#[async_trait]
pub trait Transport: Send {
    async fn find_adapter(&mut self) -> Result<AdapterInfo, TransportError>;

    /// Start scanning for devices advertising `service`
    async fn start_scan(&mut self, service: Uuid) -> Result<(), TransportError>;

    async fn stop_scan(&mut self) -> Result<(), TransportError>;

    async fn connect(&mut self, device: &DeviceId) -> Result<(), TransportError>;

    /// Look up a characteristic on the connected device, `None` if absent
    async fn resolve_characteristic(
        &mut self,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicId>, TransportError>;

    async fn subscribe_notify(
        &mut self,
        characteristic: CharacteristicId,
    ) -> Result<(), TransportError>;

    async fn write(
        &mut self,
        characteristic: CharacteristicId,
        bytes: &[u8],
    ) -> Result<(), TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// A meter seen during [`scan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundMeter {
    pub device: DeviceId,
    pub name: Option<String>,
}

/// Scan for meters for `duration` and list what answered
pub async fn scan(
    transport: &mut dyn Transport,
    events: &mut EventReceiver,
    duration: Duration,
) -> Result<Vec<FoundMeter>, TransportError> {
    transport.find_adapter().await?;
    transport.start_scan(SERVICE).await?;

    let mut found: Vec<FoundMeter> = Vec::new();
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Some(TransportEvent::DeviceFound { device, name }) => {
                    match found.iter_mut().find(|m| m.device == device) {
                        // later advertisements may carry the name
                        Some(known) => {
                            if name.is_some() {
                                known.name = name;
                            }
                        }
                        None => found.push(FoundMeter { device, name }),
                    }
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    transport.stop_scan().await?;
    Ok(found)
}
