//! Simulated transport
//!
//! An in-process adapter with one virtual CARTA and one unrelated named
//! peripheral. Every operation answers synchronously by pushing
//! [`TransportEvent`]s onto the channel, so a test can drive the whole stack by
//! draining the receiver after each call.

use crate::domain::error::TransportError;
use crate::domain::models::{AdapterState, AtomizerMode, PeripheralId, TelemetryFrame};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    CharacteristicProperties, CharacteristicRef, EventSender, PeripheralState, ServiceRef,
    Transport, TransportEvent, WriteType,
};
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

pub const SIM_CARTA_ID: &str = "sim-carta-0001";
pub const SIM_OTHER_ID: &str = "sim-speaker-0002";

/// Device Information service, exposed so discovery sees more than one service
const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
const MODEL_NUMBER_CHAR: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);

/// Device-side state of the virtual CARTA
#[derive(Debug)]
struct VirtualCarta {
    mode: AtomizerMode,
    dab_count: u16,
    flower_count: u16,
    active: bool,
    read_notifying: bool,
    notify_notifying: bool,
}

impl Default for VirtualCarta {
    fn default() -> Self {
        Self {
            mode: AtomizerMode::Dab,
            dab_count: 12,
            flower_count: 4,
            active: false,
            read_notifying: false,
            notify_notifying: false,
        }
    }
}

impl VirtualCarta {
    fn idle_frame(&self) -> TelemetryFrame {
        match self.mode {
            AtomizerMode::Dab => TelemetryFrame::IdleConcentrate,
            AtomizerMode::Flower => TelemetryFrame::IdleFlower,
        }
    }

    /// Device reaction to one command frame
    fn respond(&mut self, frame: &[u8]) -> Vec<TelemetryFrame> {
        if frame.len() != protocol::FRAME_LEN {
            return Vec::new();
        }
        match frame[0] {
            protocol::OPCODE_SYNC_TIME => vec![
                TelemetryFrame::HitCounts {
                    wax: self.dab_count,
                    herb: self.flower_count,
                },
                self.idle_frame(),
            ],
            protocol::OPCODE_SESSION if frame[3] != 0 => {
                self.active = true;
                match self.mode {
                    AtomizerMode::Dab => self.dab_count = self.dab_count.saturating_add(1),
                    AtomizerMode::Flower => {
                        self.flower_count = self.flower_count.saturating_add(1)
                    }
                }
                vec![TelemetryFrame::ActiveSession {
                    mode: Some(self.mode),
                    temp_index: frame[3],
                    seconds_remaining: frame[6],
                }]
            }
            protocol::OPCODE_SESSION => {
                self.active = false;
                vec![self.idle_frame()]
            }
            _ => Vec::new(),
        }
    }
}

pub struct SimulatedTransport {
    event_sender: EventSender,
    adapter: AdapterState,
    scanning: bool,
    states: HashMap<PeripheralId, PeripheralState>,
    device: VirtualCarta,
    written: Vec<Vec<u8>>,
    mute: bool,
}

impl SimulatedTransport {
    pub fn new(event_sender: EventSender) -> Self {
        Self {
            event_sender,
            adapter: AdapterState::Unknown,
            scanning: false,
            states: HashMap::new(),
            device: VirtualCarta::default(),
            written: Vec::new(),
            mute: false,
        }
    }

    pub fn carta_id() -> PeripheralId {
        PeripheralId::new(SIM_CARTA_ID)
    }

    pub fn power_on(&mut self) {
        self.set_adapter_state(AdapterState::PoweredOn);
    }

    pub fn set_adapter_state(&mut self, state: AdapterState) {
        self.adapter = state;
        if !state.is_powered_on() {
            self.scanning = false;
            self.states.clear();
            self.device.read_notifying = false;
            self.device.notify_notifying = false;
        }
        self.emit(TransportEvent::AdapterStateChanged(state));
    }

    /// Peer-initiated disconnect of the virtual CARTA
    pub fn drop_connection(&mut self) {
        let id = Self::carta_id();
        if self.peripheral_state(&id) == PeripheralState::Connected {
            self.reset_carta();
            self.emit(TransportEvent::Disconnected {
                peripheral: id,
                error: Some("connection lost".to_string()),
            });
        }
    }

    /// Stop answering command frames
    pub fn set_mute(&mut self, mute: bool) {
        self.mute = mute;
    }

    /// Flip the atomizer on the device side, as a user would by swapping it
    pub fn switch_mode(&mut self, mode: AtomizerMode) {
        self.device.mode = mode;
        let frame = self.device.idle_frame();
        self.notify(&frame);
    }

    /// Every frame written so far
    pub fn written(&self) -> &[Vec<u8>] {
        &self.written
    }

    fn services(&self) -> Vec<ServiceRef> {
        [protocol::SERVICE_UUID, DEVICE_INFO_SERVICE]
            .into_iter()
            .map(|uuid| ServiceRef {
                peripheral: Self::carta_id(),
                uuid,
            })
            .collect()
    }

    fn characteristics(service: &ServiceRef) -> Option<Vec<CharacteristicRef>> {
        let make = |uuid, properties| CharacteristicRef {
            service: service.clone(),
            uuid,
            properties,
        };

        if service.uuid == protocol::SERVICE_UUID {
            Some(vec![
                make(
                    protocol::READ_CHAR_UUID,
                    CharacteristicProperties {
                        read: true,
                        notify: true,
                        ..Default::default()
                    },
                ),
                make(
                    protocol::WRITE_CHAR_UUID,
                    CharacteristicProperties {
                        write: true,
                        write_without_response: true,
                        ..Default::default()
                    },
                ),
                make(
                    protocol::NOTIFY_CHAR_UUID,
                    CharacteristicProperties {
                        notify: true,
                        ..Default::default()
                    },
                ),
            ])
        } else if service.uuid == DEVICE_INFO_SERVICE {
            Some(vec![make(
                MODEL_NUMBER_CHAR,
                CharacteristicProperties {
                    read: true,
                    ..Default::default()
                },
            )])
        } else {
            None
        }
    }

    fn reset_carta(&mut self) {
        self.states
            .insert(Self::carta_id(), PeripheralState::Disconnected);
        self.device.read_notifying = false;
        self.device.notify_notifying = false;
    }

    /// Deliver a telemetry frame on whichever characteristic is subscribed
    fn notify(&mut self, frame: &TelemetryFrame) {
        let uuid = if self.device.read_notifying {
            protocol::READ_CHAR_UUID
        } else if self.device.notify_notifying {
            protocol::NOTIFY_CHAR_UUID
        } else {
            trace!("No subscriber for {:?}", frame);
            return;
        };

        let service = ServiceRef {
            peripheral: Self::carta_id(),
            uuid: protocol::SERVICE_UUID,
        };
        let characteristic = Self::characteristics(&service)
            .and_then(|chars| chars.into_iter().find(|c| c.uuid == uuid));
        if let Some(characteristic) = characteristic {
            self.emit(TransportEvent::ValueUpdated {
                characteristic,
                value: protocol::encode_telemetry(frame),
            });
        }
    }

    fn ensure_powered(&self) -> Result<(), TransportError> {
        if self.adapter.is_powered_on() {
            Ok(())
        } else {
            Err(TransportError::AdapterUnavailable)
        }
    }

    fn ensure_connected(&self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.ensure_powered()?;
        if self.peripheral_state(peripheral) == PeripheralState::Connected {
            Ok(())
        } else {
            Err(TransportError::UnknownPeripheral(peripheral.clone()))
        }
    }

    fn emit(&self, event: TransportEvent) {
        trace!("Simulated event: {:?}", event);
        let _ = self.event_sender.send(event);
    }
}

impl Transport for SimulatedTransport {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.ensure_powered()?;
        self.scanning = true;

        let carta = Self::carta_id();
        if self.peripheral_state(&carta) == PeripheralState::Disconnected {
            self.emit(TransportEvent::Discovered {
                peripheral: carta,
                rssi: -52,
                name: Some(protocol::DEVICE_NAME.to_string()),
            });
        }
        self.emit(TransportEvent::Discovered {
            peripheral: PeripheralId::new(SIM_OTHER_ID),
            rssi: -71,
            name: Some("Living Room Speaker".to_string()),
        });
        self.emit(TransportEvent::Discovered {
            peripheral: PeripheralId::new("sim-beacon-0003"),
            rssi: -88,
            name: None,
        });
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.scanning = false;
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning
    }

    fn peripheral_state(&self, peripheral: &PeripheralId) -> PeripheralState {
        self.states.get(peripheral).copied().unwrap_or_default()
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.ensure_powered()?;
        match peripheral.as_str() {
            SIM_CARTA_ID => {
                self.states
                    .insert(peripheral.clone(), PeripheralState::Connected);
                self.emit(TransportEvent::Connected(peripheral.clone()));
            }
            SIM_OTHER_ID => {
                self.emit(TransportEvent::ConnectFailed {
                    peripheral: peripheral.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            _ => return Err(TransportError::UnknownPeripheral(peripheral.clone())),
        }
        Ok(())
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        if self.peripheral_state(peripheral) == PeripheralState::Disconnected {
            return Ok(());
        }
        self.reset_carta();
        self.emit(TransportEvent::Disconnected {
            peripheral: peripheral.clone(),
            error: None,
        });
        Ok(())
    }

    fn discover_services(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.ensure_connected(peripheral)?;
        self.emit(TransportEvent::ServicesDiscovered {
            peripheral: peripheral.clone(),
            services: self.services(),
        });
        Ok(())
    }

    fn discover_characteristics(&mut self, service: &ServiceRef) -> Result<(), TransportError> {
        self.ensure_connected(&service.peripheral)?;
        let characteristics =
            Self::characteristics(service).ok_or(TransportError::UnknownService(service.uuid))?;
        self.emit(TransportEvent::CharacteristicsDiscovered {
            service: service.clone(),
            characteristics,
        });
        Ok(())
    }

    fn write_value(
        &mut self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        self.ensure_connected(characteristic.peripheral())?;
        if characteristic.uuid != protocol::WRITE_CHAR_UUID {
            return Err(TransportError::UnknownCharacteristic(characteristic.uuid));
        }

        debug!("Virtual CARTA received {}", protocol::to_hex(value));
        self.written.push(value.to_vec());
        if write_type == WriteType::WithResponse {
            self.emit(TransportEvent::WriteCompleted {
                characteristic: characteristic.clone(),
                error: None,
            });
        }

        if !self.mute {
            for frame in self.device.respond(value) {
                self.notify(&frame);
            }
        }
        Ok(())
    }

    fn set_notify(
        &mut self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.ensure_connected(characteristic.peripheral())?;
        match characteristic.uuid {
            uuid if uuid == protocol::READ_CHAR_UUID => self.device.read_notifying = enabled,
            uuid if uuid == protocol::NOTIFY_CHAR_UUID => self.device.notify_notifying = enabled,
            uuid => return Err(TransportError::UnknownCharacteristic(uuid)),
        }
        self.emit(TransportEvent::NotificationStateChanged {
            characteristic: characteristic.clone(),
            enabled,
            error: None,
        });
        Ok(())
    }
}
