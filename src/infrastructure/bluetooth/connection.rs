//! BLE Connection Module
//!
//! [`DeviceLink`] drives one peripheral through
//! scan → connect → services → characteristics → notifications → ready,
//! and keeps it that way through [`DeviceLink::reconcile`]. It never
//! interprets payloads: inbound values are forwarded verbatim.
//!
//! Outcomes are queued as [`LinkEvent`]s and collected with
//! [`DeviceLink::drain_events`].

use crate::domain::error::{LinkError, TransportError};
use crate::domain::models::{AdapterState, LinkState, PeripheralId, PeripheralRecord};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::scanner::DiscoverySet;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicRef, PeripheralState, Transport, TransportEvent,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of the device and its GATT layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub device_name: String,
    pub service_uuid: Uuid,
    pub read_char_uuid: Uuid,
    pub write_char_uuid: Uuid,
    pub notify_char_uuid: Uuid,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_name: protocol::DEVICE_NAME.to_string(),
            service_uuid: protocol::SERVICE_UUID,
            read_char_uuid: protocol::READ_CHAR_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
        }
    }
}

impl LinkConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            device_name: settings.device_name.clone(),
            service_uuid: Uuid::parse_str(&settings.ble_service_uuid)?,
            read_char_uuid: Uuid::parse_str(&settings.ble_read_char_uuid)?,
            write_char_uuid: Uuid::parse_str(&settings.ble_write_char_uuid)?,
            notify_char_uuid: Uuid::parse_str(&settings.ble_notify_char_uuid)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    /// Adapter is not powered on
    Unavailable,
    Scanning,
    Connecting(PeripheralId),
    DiscoveringServices,
    DiscoveringCharacteristics,
    EnablingNotifications,
    Ready,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicRole {
    Read,
    Write,
    Notify,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(LinkState),
    DevicesChanged(Vec<PeripheralRecord>),
    Ready(PeripheralId),
    Value(Vec<u8>),
    Error(LinkError),
}

#[derive(Debug, Clone)]
struct Binding {
    characteristic: CharacteristicRef,
    by_uuid: bool,
}

#[derive(Debug)]
struct ActivePeripheral {
    id: PeripheralId,
    read: Option<Binding>,
    write: Option<Binding>,
    notify: Option<Binding>,
    pending_services: usize,
}

impl ActivePeripheral {
    fn new(id: PeripheralId) -> Self {
        Self {
            id,
            read: None,
            write: None,
            notify: None,
            pending_services: 0,
        }
    }

    fn slot(&mut self, role: CharacteristicRole) -> &mut Option<Binding> {
        match role {
            CharacteristicRole::Read => &mut self.read,
            CharacteristicRole::Write => &mut self.write,
            CharacteristicRole::Notify => &mut self.notify,
        }
    }

    /// A UUID match always wins over a property-based guess
    fn bind(&mut self, role: CharacteristicRole, characteristic: CharacteristicRef, by_uuid: bool) {
        let slot = self.slot(role);
        let replace = match slot {
            None => true,
            Some(existing) => by_uuid && !existing.by_uuid,
        };
        if replace {
            debug!("Bound {:?} characteristic {}", role, characteristic.uuid);
            *slot = Some(Binding {
                characteristic,
                by_uuid,
            });
        }
    }
}

pub struct DeviceLink<T: Transport> {
    transport: T,
    config: LinkConfig,
    adapter: AdapterState,
    state: LinkState,
    phase: LinkPhase,
    discovered: DiscoverySet,
    active: Option<ActivePeripheral>,
    pending: Option<PeripheralId>,
    events: Vec<LinkEvent>,
}

impl<T: Transport> DeviceLink<T> {
    pub fn new(transport: T, config: LinkConfig) -> Self {
        Self {
            transport,
            config,
            adapter: AdapterState::Unknown,
            state: LinkState::Unknown,
            phase: LinkPhase::Unavailable,
            discovered: DiscoverySet::new(),
            active: None,
            pending: None,
            events: Vec::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn phase(&self) -> &LinkPhase {
        &self.phase
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter
    }

    pub fn is_ready(&self) -> bool {
        self.phase == LinkPhase::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.phase == LinkPhase::Closed
    }

    pub fn active_peripheral(&self) -> Option<&PeripheralId> {
        self.active.as_ref().map(|a| &a.id)
    }

    pub fn discovered(&self) -> &[PeripheralRecord] {
        self.discovered.records()
    }

    pub fn characteristic(&self, role: CharacteristicRole) -> Option<&CharacteristicRef> {
        let active = self.active.as_ref()?;
        let binding = match role {
            CharacteristicRole::Read => active.read.as_ref(),
            CharacteristicRole::Write => active.write.as_ref(),
            CharacteristicRole::Notify => active.notify.as_ref(),
        };
        binding.map(|b| &b.characteristic)
    }

    pub fn drain_events(&mut self) -> Vec<LinkEvent> {
        std::mem::take(&mut self.events)
    }

    /// Clear the discovery set and begin a passive scan
    pub fn start_scanning(&mut self) -> Result<(), LinkError> {
        self.ensure_open()?;
        if !self.adapter.is_powered_on() {
            return Err(LinkError::TransportUnavailable(self.adapter));
        }

        self.clear_discovered();
        info!("Scanning...");
        self.transport.start_scan()?;
        if matches!(self.phase, LinkPhase::Idle | LinkPhase::Disconnected) {
            self.phase = LinkPhase::Scanning;
        }
        Ok(())
    }

    pub fn stop_scanning(&mut self) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.clear_discovered();
        if self.transport.is_scanning() {
            info!("Stopping scan");
            self.transport.stop_scan()?;
        }
        if self.phase == LinkPhase::Scanning {
            self.phase = LinkPhase::Idle;
        }
        Ok(())
    }

    /// Connect to `peripheral`, cancelling any other connection first
    pub fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), LinkError> {
        self.ensure_open()?;
        if !self.adapter.is_powered_on() {
            return Err(LinkError::TransportUnavailable(self.adapter));
        }
        if self.pending.as_ref() == Some(peripheral) || self.active_peripheral() == Some(peripheral) {
            return Ok(());
        }

        if self.active.is_some() || self.pending.is_some() {
            self.drop_connection(true);
        }

        info!("Connecting to {}", peripheral);
        self.pending = Some(peripheral.clone());
        self.phase = LinkPhase::Connecting(peripheral.clone());
        if let Err(e) = self.transport.connect(peripheral) {
            self.pending = None;
            self.phase = LinkPhase::Disconnected;
            return Err(LinkError::ConnectionFailed {
                peripheral: peripheral.clone(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    /// Cancel the active or pending connection
    pub fn disconnect(&mut self) -> Result<(), LinkError> {
        self.ensure_open()?;
        if self.active.is_none() && self.pending.is_none() {
            return Err(LinkError::NotConnected);
        }
        self.drop_connection(true);
        Ok(())
    }

    /// Write a frame to the write characteristic
    pub fn send(&mut self, value: &[u8]) -> Result<(), LinkError> {
        self.ensure_open()?;
        let active = self.active.as_ref().ok_or(LinkError::NotConnected)?;
        let write = active
            .write
            .as_ref()
            .map(|b| &b.characteristic)
            .ok_or(LinkError::WriteCharacteristicMissing)?;

        debug!("Sending {}", protocol::to_hex(value));
        self.transport
            .write_value(write, value, write.preferred_write_type())?;
        Ok(())
    }

    /// Subscribe to value changes on the read characteristic
    pub fn enable_read_notifications(&mut self) -> Result<(), LinkError> {
        self.ensure_open()?;
        let read = self
            .characteristic(CharacteristicRole::Read)
            .cloned()
            .ok_or_else(|| LinkError::Discovery("read characteristic missing".to_string()))?;
        self.transport.set_notify(&read, true)?;
        info!("Enabled value notifications for read characteristic");
        Ok(())
    }

    /// Periodic auto-heal. Safe to call at any rate; does nothing when there
    /// is nothing to do.
    pub fn reconcile(&mut self) {
        if self.is_closed() || !self.adapter.is_powered_on() {
            return;
        }
        if self.active.is_some() || self.pending.is_some() {
            return;
        }

        let target = self
            .discovered
            .named(&self.config.device_name)
            .map(|r| r.identifier.clone())
            .find(|id| self.transport.peripheral_state(id) == PeripheralState::Disconnected);

        if let Some(target) = target {
            if let Err(e) = self.connect(&target) {
                warn!("{}", e);
                self.events.push(LinkEvent::Error(e));
            }
            return;
        }

        if !self.transport.is_scanning() {
            if let Err(e) = self.start_scanning() {
                warn!("Failed to start scanning: {}", e);
                self.set_state(LinkState::Error);
                self.events.push(LinkEvent::Error(e));
            }
        }
    }

    /// Stop everything. Later calls are rejected or ignored.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        info!("Closing device link");
        if self.transport.is_scanning() {
            if let Err(e) = self.transport.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        }
        self.clear_discovered();
        if self.active.is_some() || self.pending.is_some() {
            self.drop_connection(true);
        }
        self.phase = LinkPhase::Closed;
    }

    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.is_closed() {
            debug!("Ignoring event after close: {:?}", event);
            return;
        }

        match event {
            TransportEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            TransportEvent::Discovered {
                peripheral,
                rssi,
                name,
            } => {
                if self.discovered.insert(&peripheral, rssi, name.as_deref()) {
                    self.events
                        .push(LinkEvent::DevicesChanged(self.discovered.records().to_vec()));
                }
            }
            TransportEvent::Connected(peripheral) => self.on_connected(peripheral),
            TransportEvent::ConnectFailed { peripheral, reason } => {
                if self.pending.as_ref() != Some(&peripheral) {
                    return;
                }
                warn!("Connection to {} failed: {}", peripheral, reason);
                self.pending = None;
                self.phase = LinkPhase::Disconnected;
                self.set_state(LinkState::Disconnected);
                self.events
                    .push(LinkEvent::Error(LinkError::ConnectionFailed { peripheral, reason }));
            }
            TransportEvent::Disconnected { peripheral, error } => {
                let ours = self.active_peripheral() == Some(&peripheral)
                    || self.pending.as_ref() == Some(&peripheral);
                if !ours {
                    debug!("Ignoring disconnect of {}", peripheral);
                    return;
                }
                match error {
                    Some(e) => warn!("Disconnected from {}: {}", peripheral, e),
                    None => info!("Disconnected from {}", peripheral),
                }
                self.drop_connection(false);
            }
            TransportEvent::ServicesDiscovered {
                peripheral,
                services,
            } => {
                if !self.is_active(&peripheral) || self.phase != LinkPhase::DiscoveringServices {
                    return;
                }
                if services.is_empty() {
                    self.fail_discovery("peripheral exposes no services");
                    return;
                }

                info!("Discovered {} services", services.len());
                if let Some(active) = self.active.as_mut() {
                    active.pending_services = services.len();
                }
                self.phase = LinkPhase::DiscoveringCharacteristics;
                for service in &services {
                    if let Err(e) = self.transport.discover_characteristics(service) {
                        warn!("Characteristic discovery for {} failed: {}", service.uuid, e);
                        self.events.push(LinkEvent::Error(e.into()));
                        self.service_done();
                    }
                }
            }
            TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics,
            } => {
                if !self.is_active(&service.peripheral)
                    || self.phase != LinkPhase::DiscoveringCharacteristics
                {
                    return;
                }
                for characteristic in characteristics {
                    if let Some((role, by_uuid)) = self.classify(&characteristic) {
                        if let Some(active) = self.active.as_mut() {
                            active.bind(role, characteristic, by_uuid);
                        }
                    }
                }
                self.service_done();
            }
            TransportEvent::NotificationStateChanged {
                characteristic,
                enabled,
                error,
            } => {
                if let Some(e) = error {
                    warn!("Notification state for {} failed: {}", characteristic.uuid, e);
                    if self.is_active(characteristic.peripheral()) {
                        self.events
                            .push(LinkEvent::Error(TransportError::Backend(e).into()));
                    }
                } else {
                    debug!(
                        "Notifications {} for {}",
                        if enabled { "on" } else { "off" },
                        characteristic.uuid
                    );
                }
                let is_notify = self
                    .characteristic(CharacteristicRole::Notify)
                    .is_some_and(|c| c.uuid == characteristic.uuid);
                if is_notify && self.phase == LinkPhase::EnablingNotifications {
                    self.become_ready();
                }
            }
            TransportEvent::ValueUpdated {
                characteristic,
                value,
            } => {
                if self.is_active(characteristic.peripheral()) {
                    self.events.push(LinkEvent::Value(value));
                }
            }
            TransportEvent::WriteCompleted {
                characteristic,
                error,
            } => {
                if let Some(e) = error {
                    warn!("Write to {} failed: {}", characteristic.uuid, e);
                    self.events
                        .push(LinkEvent::Error(TransportError::Backend(e).into()));
                }
            }
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        info!("Adapter state: {:?}", state);
        self.adapter = state;

        if state.is_powered_on() {
            if self.phase == LinkPhase::Unavailable {
                self.phase = LinkPhase::Idle;
            }
            if self.active.is_none() {
                self.set_state(LinkState::PoweredOn);
            }
            return;
        }

        if self.active.is_some() || self.pending.is_some() {
            self.drop_connection(false);
        }
        if self.transport.is_scanning() {
            if let Err(e) = self.transport.stop_scan() {
                debug!("Failed to stop scan: {}", e);
            }
        }
        self.clear_discovered();
        self.phase = LinkPhase::Unavailable;
        self.set_state(state.into());
        if state.requires_remediation() {
            self.events
                .push(LinkEvent::Error(LinkError::TransportUnavailable(state)));
        }
    }

    fn on_connected(&mut self, peripheral: PeripheralId) {
        if self.pending.as_ref() != Some(&peripheral) {
            warn!("Unexpected connection from {}, cancelling", peripheral);
            if let Err(e) = self.transport.cancel_connection(&peripheral) {
                warn!("Failed to cancel {}: {}", peripheral, e);
            }
            return;
        }

        info!("Connected to {}", peripheral);
        self.pending = None;
        self.active = Some(ActivePeripheral::new(peripheral.clone()));
        self.set_state(LinkState::Connected);
        self.phase = LinkPhase::DiscoveringServices;
        if let Err(e) = self.transport.discover_services(&peripheral) {
            self.fail_discovery(&e.to_string());
        }
    }

    fn classify(&self, characteristic: &CharacteristicRef) -> Option<(CharacteristicRole, bool)> {
        let uuid = characteristic.uuid;
        if uuid == self.config.write_char_uuid {
            return Some((CharacteristicRole::Write, true));
        }
        if uuid == self.config.read_char_uuid {
            return Some((CharacteristicRole::Read, true));
        }
        if uuid == self.config.notify_char_uuid {
            return Some((CharacteristicRole::Notify, true));
        }

        // Unknown UUID: only single-purpose characteristics are taken by property
        let p = characteristic.properties;
        match (p.read, p.write || p.write_without_response, p.notify) {
            (true, false, false) => Some((CharacteristicRole::Read, false)),
            (false, true, false) => Some((CharacteristicRole::Write, false)),
            (false, false, true) => Some((CharacteristicRole::Notify, false)),
            _ => None,
        }
    }

    fn service_done(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.pending_services = active.pending_services.saturating_sub(1);
        if active.pending_services == 0 {
            self.finish_discovery();
        }
    }

    fn finish_discovery(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };

        if active.write.is_none() {
            warn!("No write characteristic on {}", active.id);
            self.events
                .push(LinkEvent::Error(LinkError::WriteCharacteristicMissing));
        }

        let notify = active
            .notify
            .as_ref()
            .map(|b| b.characteristic.clone())
            .filter(|c| c.properties.notify);
        match notify {
            Some(notify) => {
                self.phase = LinkPhase::EnablingNotifications;
                if let Err(e) = self.transport.set_notify(&notify, true) {
                    warn!("Failed to subscribe to {}: {}", notify.uuid, e);
                    self.events.push(LinkEvent::Error(e.into()));
                    self.become_ready();
                }
            }
            None => self.become_ready(),
        }
    }

    fn become_ready(&mut self) {
        let Some(id) = self.active_peripheral().cloned() else {
            return;
        };
        info!("Link to {} ready", id);
        self.phase = LinkPhase::Ready;
        self.events.push(LinkEvent::Ready(id));
    }

    fn fail_discovery(&mut self, reason: &str) {
        warn!("Discovery failed: {}", reason);
        self.events
            .push(LinkEvent::Error(LinkError::Discovery(reason.to_string())));
        self.drop_connection(true);
    }

    /// Forget the active/pending peripheral, optionally telling the transport
    fn drop_connection(&mut self, cancel: bool) {
        let target = self
            .active
            .take()
            .map(|a| a.id)
            .or_else(|| self.pending.take());
        self.pending = None;

        if cancel {
            if let Some(id) = &target {
                if let Err(e) = self.transport.cancel_connection(id) {
                    warn!("Failed to cancel connection to {}: {}", id, e);
                }
            }
        }

        if self.adapter.is_powered_on() {
            self.phase = LinkPhase::Disconnected;
        }
        self.set_state(LinkState::Disconnected);
    }

    fn clear_discovered(&mut self) {
        if !self.discovered.is_empty() {
            self.discovered.clear();
            self.events.push(LinkEvent::DevicesChanged(Vec::new()));
        }
    }

    fn is_active(&self, peripheral: &PeripheralId) -> bool {
        self.active_peripheral() == Some(peripheral)
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            self.state = state;
            self.events.push(LinkEvent::StateChanged(state));
        }
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.is_closed() {
            Err(LinkError::Closed)
        } else {
            Ok(())
        }
    }
}
