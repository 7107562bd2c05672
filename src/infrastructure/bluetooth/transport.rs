//! Transport port
//!
//! The host BLE stack as seen by the link: fire-and-forget operations whose
//! results come back as [`TransportEvent`]s on a channel. All events are
//! consumed on the service task, so backends may emit from any thread.

use crate::domain::error::TransportError;
use crate::domain::models::{AdapterState, PeripheralId};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Connection state of a peripheral as the transport sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeripheralState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Declared GATT properties relevant to role assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub peripheral: PeripheralId,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRef {
    pub service: ServiceRef,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl CharacteristicRef {
    pub fn peripheral(&self) -> &PeripheralId {
        &self.service.peripheral
    }

    /// Prefer unacknowledged writes when the characteristic allows them
    pub fn preferred_write_type(&self) -> WriteType {
        if self.properties.write_without_response {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    AdapterStateChanged(AdapterState),
    Discovered {
        peripheral: PeripheralId,
        rssi: i16,
        name: Option<String>,
    },
    Connected(PeripheralId),
    ConnectFailed {
        peripheral: PeripheralId,
        reason: String,
    },
    Disconnected {
        peripheral: PeripheralId,
        error: Option<String>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        services: Vec<ServiceRef>,
    },
    CharacteristicsDiscovered {
        service: ServiceRef,
        characteristics: Vec<CharacteristicRef>,
    },
    NotificationStateChanged {
        characteristic: CharacteristicRef,
        enabled: bool,
        error: Option<String>,
    },
    ValueUpdated {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
    WriteCompleted {
        characteristic: CharacteristicRef,
        error: Option<String>,
    },
}

/// Host Bluetooth operations. Every call returns immediately; an `Err` only
/// means the request could not be issued at all.
pub trait Transport {
    fn start_scan(&mut self) -> Result<(), TransportError>;
    fn stop_scan(&mut self) -> Result<(), TransportError>;
    fn is_scanning(&self) -> bool;
    fn peripheral_state(&self, peripheral: &PeripheralId) -> PeripheralState;
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn cancel_connection(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn discover_services(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn discover_characteristics(&mut self, service: &ServiceRef) -> Result<(), TransportError>;
    fn write_value(
        &mut self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;
    fn set_notify(
        &mut self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError>;
}
