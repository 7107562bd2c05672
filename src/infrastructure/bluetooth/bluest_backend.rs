//! Real adapter backend on top of `bluest`
//!
//! Each request is turned into a spawned task whose outcome comes back as a
//! [`TransportEvent`]. Long-lived streams (scan, notifications, connection
//! watch) stop through their `CancellationToken`; all of them are children of
//! one shutdown token cancelled on drop. Writes go through a single writer task
//! so frames reach the device in order.

use crate::domain::error::TransportError;
use crate::domain::models::{AdapterState, PeripheralId};
use crate::infrastructure::bluetooth::transport::{
    CharacteristicProperties, CharacteristicRef, EventSender, PeripheralState, ServiceRef,
    Transport, TransportEvent, WriteType,
};
use bluest::{Adapter, AdapterEvent, Characteristic, ConnectionEvent, Device, Service};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type CharKey = (PeripheralId, Uuid);

/// Native handles resolved from our opaque identifiers
#[derive(Default)]
struct Registry {
    devices: HashMap<PeripheralId, Device>,
    states: HashMap<PeripheralId, PeripheralState>,
    services: HashMap<CharKey, Service>,
    characteristics: HashMap<CharKey, Characteristic>,
}

struct WriteJob {
    characteristic: CharacteristicRef,
    handle: Characteristic,
    value: Vec<u8>,
    write_type: WriteType,
}

pub struct BluestTransport {
    adapter: Adapter,
    event_sender: EventSender,
    registry: Arc<Mutex<Registry>>,
    writer: mpsc::UnboundedSender<WriteJob>,
    shutdown: CancellationToken,
    scan_cancel: Option<CancellationToken>,
    watch_cancel: HashMap<PeripheralId, CancellationToken>,
    notify_cancel: HashMap<CharKey, CancellationToken>,
}

impl BluestTransport {
    /// Open the default adapter and start reporting its power state
    pub async fn new(event_sender: EventSender) -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        let shutdown = CancellationToken::new();

        tokio::spawn(watch_adapter(
            adapter.clone(),
            event_sender.clone(),
            shutdown.child_token(),
        ));

        let (writer, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(jobs, event_sender.clone(), shutdown.child_token()));

        info!("Bluetooth adapter opened");
        Ok(Self {
            adapter,
            event_sender,
            registry: Arc::new(Mutex::new(Registry::default())),
            writer,
            shutdown,
            scan_cancel: None,
            watch_cancel: HashMap::new(),
            notify_cancel: HashMap::new(),
        })
    }

    fn registry(&self) -> Result<MutexGuard<'_, Registry>, TransportError> {
        self.registry
            .lock()
            .map_err(|_| TransportError::Backend("Lock error".to_string()))
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<Device, TransportError> {
        self.registry()?
            .devices
            .get(peripheral)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(peripheral.clone()))
    }

    fn characteristic(&self, characteristic: &CharacteristicRef) -> Result<Characteristic, TransportError> {
        self.registry()?
            .characteristics
            .get(&(characteristic.peripheral().clone(), characteristic.uuid))
            .cloned()
            .ok_or(TransportError::UnknownCharacteristic(characteristic.uuid))
    }

    fn set_state(&self, peripheral: &PeripheralId, state: PeripheralState) -> Result<(), TransportError> {
        self.registry()?.states.insert(peripheral.clone(), state);
        Ok(())
    }
}

impl Drop for BluestTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Transport for BluestTransport {
    fn start_scan(&mut self) -> Result<(), TransportError> {
        if self.is_scanning() {
            return Ok(());
        }
        let cancel = self.shutdown.child_token();
        self.scan_cancel = Some(cancel.clone());

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let sender = self.event_sender.clone();
        tokio::spawn(until_finished(cancel.clone(), async move {
            if let Err(e) = run_scan(adapter, registry, sender, cancel).await {
                error!("Bluetooth scan failed: {}", e);
            }
        }));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        if let Some(cancel) = self.scan_cancel.take() {
            cancel.cancel();
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scan_cancel.as_ref().is_some_and(|c| !c.is_cancelled())
    }

    fn peripheral_state(&self, peripheral: &PeripheralId) -> PeripheralState {
        self.registry()
            .ok()
            .and_then(|r| r.states.get(peripheral).copied())
            .unwrap_or_default()
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        self.set_state(peripheral, PeripheralState::Connecting)?;

        let cancel = self.shutdown.child_token();
        if let Some(previous) = self.watch_cancel.insert(peripheral.clone(), cancel.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let sender = self.event_sender.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let set_state = |state| {
                if let Ok(mut r) = registry.lock() {
                    r.states.insert(id.clone(), state);
                }
            };

            if let Err(e) = adapter.connect_device(&device).await {
                set_state(PeripheralState::Disconnected);
                let _ = sender.send(TransportEvent::ConnectFailed {
                    peripheral: id.clone(),
                    reason: e.to_string(),
                });
                return;
            }
            set_state(PeripheralState::Connected);
            let _ = sender.send(TransportEvent::Connected(id.clone()));

            let mut events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch connection of {}: {}", id, e);
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(ConnectionEvent::Disconnected) | None => {
                            set_state(PeripheralState::Disconnected);
                            let _ = sender.send(TransportEvent::Disconnected {
                                peripheral: id.clone(),
                                error: Some("connection lost".to_string()),
                            });
                            break;
                        }
                        Some(ConnectionEvent::Connected) => {}
                    },
                }
            }
        });
        Ok(())
    }

    fn cancel_connection(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        if let Some(watch) = self.watch_cancel.remove(peripheral) {
            watch.cancel();
        }
        self.notify_cancel.retain(|(id, _), cancel| {
            if id == peripheral {
                cancel.cancel();
            }
            id != peripheral
        });

        let device = self.device(peripheral)?;
        self.set_state(peripheral, PeripheralState::Disconnecting)?;

        let adapter = self.adapter.clone();
        let registry = self.registry.clone();
        let sender = self.event_sender.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let error = adapter
                .disconnect_device(&device)
                .await
                .err()
                .map(|e| e.to_string());
            if let Ok(mut r) = registry.lock() {
                r.states.insert(id.clone(), PeripheralState::Disconnected);
            }
            let _ = sender.send(TransportEvent::Disconnected {
                peripheral: id,
                error,
            });
        });
        Ok(())
    }

    fn discover_services(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let device = self.device(peripheral)?;
        let registry = self.registry.clone();
        let sender = self.event_sender.clone();
        let id = peripheral.clone();
        tokio::spawn(async move {
            let services = match device.discover_services().await {
                Ok(services) => services,
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", id, e);
                    Vec::new()
                }
            };

            let mut refs = Vec::with_capacity(services.len());
            if let Ok(mut r) = registry.lock() {
                for service in services {
                    let uuid = service.uuid();
                    debug!("Service {} on {}", uuid, id);
                    refs.push(ServiceRef {
                        peripheral: id.clone(),
                        uuid,
                    });
                    r.services.insert((id.clone(), uuid), service);
                }
            }
            let _ = sender.send(TransportEvent::ServicesDiscovered {
                peripheral: id,
                services: refs,
            });
        });
        Ok(())
    }

    fn discover_characteristics(&mut self, service: &ServiceRef) -> Result<(), TransportError> {
        let handle = self
            .registry()?
            .services
            .get(&(service.peripheral.clone(), service.uuid))
            .cloned()
            .ok_or(TransportError::UnknownService(service.uuid))?;

        let registry = self.registry.clone();
        let sender = self.event_sender.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let characteristics = match handle.discover_characteristics().await {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    warn!("Characteristic discovery on {} failed: {}", service.uuid, e);
                    Vec::new()
                }
            };

            let mut refs = Vec::with_capacity(characteristics.len());
            for characteristic in characteristics {
                let properties = match characteristic.properties().await {
                    Ok(p) => CharacteristicProperties {
                        read: p.read,
                        write: p.write,
                        write_without_response: p.write_without_response,
                        notify: p.notify || p.indicate,
                    },
                    Err(e) => {
                        warn!("No properties for {}: {}", characteristic.uuid(), e);
                        CharacteristicProperties::default()
                    }
                };
                let uuid = characteristic.uuid();
                refs.push(CharacteristicRef {
                    service: service.clone(),
                    uuid,
                    properties,
                });
                if let Ok(mut r) = registry.lock() {
                    r.characteristics
                        .insert((service.peripheral.clone(), uuid), characteristic);
                }
            }
            let _ = sender.send(TransportEvent::CharacteristicsDiscovered {
                service,
                characteristics: refs,
            });
        });
        Ok(())
    }

    fn write_value(
        &mut self,
        characteristic: &CharacteristicRef,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let handle = self.characteristic(characteristic)?;
        self.writer
            .send(WriteJob {
                characteristic: characteristic.clone(),
                handle,
                value: value.to_vec(),
                write_type,
            })
            .map_err(|_| TransportError::Backend("writer stopped".to_string()))
    }

    fn set_notify(
        &mut self,
        characteristic: &CharacteristicRef,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let key = (characteristic.peripheral().clone(), characteristic.uuid);
        if let Some(previous) = self.notify_cancel.remove(&key) {
            previous.cancel();
        }

        if !enabled {
            let _ = self.event_sender.send(TransportEvent::NotificationStateChanged {
                characteristic: characteristic.clone(),
                enabled: false,
                error: None,
            });
            return Ok(());
        }

        let handle = self.characteristic(characteristic)?;
        let cancel = self.shutdown.child_token();
        self.notify_cancel.insert(key, cancel.clone());

        let sender = self.event_sender.clone();
        let characteristic = characteristic.clone();
        tokio::spawn(async move {
            let mut stream = match handle.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = sender.send(TransportEvent::NotificationStateChanged {
                        characteristic,
                        enabled: false,
                        error: Some(e.to_string()),
                    });
                    return;
                }
            };
            let _ = sender.send(TransportEvent::NotificationStateChanged {
                characteristic: characteristic.clone(),
                enabled: true,
                error: None,
            });

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    value = stream.next() => match value {
                        Some(Ok(value)) => {
                            let _ = sender.send(TransportEvent::ValueUpdated {
                                characteristic: characteristic.clone(),
                                value,
                            });
                        }
                        Some(Err(e)) => warn!("Notification error on {}: {}", characteristic.uuid, e),
                        None => break,
                    },
                }
            }
            debug!("Notifications for {} stopped", characteristic.uuid);
        });
        Ok(())
    }
}

async fn watch_adapter(adapter: Adapter, sender: EventSender, cancel: CancellationToken) {
    let initial = match adapter.is_available().await {
        Ok(true) => AdapterState::PoweredOn,
        Ok(false) => AdapterState::PoweredOff,
        Err(e) => {
            warn!("Cannot query adapter: {}", e);
            AdapterState::Unsupported
        }
    };
    let _ = sender.send(TransportEvent::AdapterStateChanged(initial));

    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Cannot watch adapter state: {}", e);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => {
                let state = match event {
                    Some(Ok(AdapterEvent::Available)) => AdapterState::PoweredOn,
                    Some(Ok(AdapterEvent::Unavailable)) => AdapterState::PoweredOff,
                    Some(Err(e)) => {
                        warn!("Adapter event error: {}", e);
                        continue;
                    }
                    None => break,
                };
                let _ = sender.send(TransportEvent::AdapterStateChanged(state));
            }
        }
    }
}

/// Run `task`, then cancel `token` however the task ended, so the owner
/// checking the token sees the work as stopped
async fn until_finished<F: Future>(token: CancellationToken, task: F) -> F::Output {
    let _finished = token.drop_guard();
    task.await
}

async fn run_scan(
    adapter: Adapter,
    registry: Arc<Mutex<Registry>>,
    sender: EventSender,
    cancel: CancellationToken,
) -> bluest::Result<()> {
    let mut stream = adapter.scan(&[]).await?;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            found = stream.next() => {
                let Some(found) = found else {
                    info!("Bluetooth scan stream has ended.");
                    break;
                };
                let id = PeripheralId::new(found.device.id().to_string());
                let name = found
                    .adv_data
                    .local_name
                    .clone()
                    .or_else(|| found.device.name().ok());
                if let Ok(mut r) = registry.lock() {
                    r.devices.insert(id.clone(), found.device.clone());
                }
                let _ = sender.send(TransportEvent::Discovered {
                    peripheral: id,
                    rssi: found.rssi.unwrap_or(i16::MIN),
                    name,
                });
            }
        }
    }
    Ok(())
}

async fn run_writer(
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    sender: EventSender,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let result = match job.write_type {
            WriteType::WithResponse => job.handle.write(&job.value).await,
            WriteType::WithoutResponse => job.handle.write_without_response(&job.value).await,
        };
        let error = result.err().map(|e| e.to_string());
        if job.write_type == WriteType::WithResponse || error.is_some() {
            let _ = sender.send(TransportEvent::WriteCompleted {
                characteristic: job.characteristic,
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_ending_on_its_own_cancels_token() {
        let token = CancellationToken::new();
        let result = until_finished(token.clone(), async { Err::<(), _>("scan stream ended") }).await;

        assert!(result.is_err());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_token_stays_live_while_task_runs() {
        let token = CancellationToken::new();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(until_finished(token.clone(), async move {
            let _ = release_rx.await;
        }));

        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());

        release_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(token.is_cancelled());
    }
}
