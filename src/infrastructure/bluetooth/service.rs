//! Bluetooth Service Module
//!
//! The single execution context of the device core: one loop owns the
//! controller and feeds it transport events, presentation commands and the
//! two periodic ticks, strictly one at a time.

use crate::domain::controller::DeviceController;
use crate::domain::models::DeviceCommand;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::transport::{EventReceiver, Transport};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub type CommandSender = mpsc::UnboundedSender<DeviceCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<DeviceCommand>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceConfig {
    pub reconcile_interval: Duration,
    pub sync_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_millis(250),
            sync_interval: Duration::from_secs(1),
        }
    }
}

impl ServiceConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reconcile_interval: Duration::from_millis(settings.reconcile_interval_ms.max(1)),
            sync_interval: Duration::from_millis(settings.sync_interval_ms.max(1)),
        }
    }
}

pub struct DeviceService<T: Transport> {
    controller: DeviceController<T>,
    transport_events: EventReceiver,
    commands: CommandReceiver,
    config: ServiceConfig,
}

impl<T: Transport> DeviceService<T> {
    pub fn new(
        controller: DeviceController<T>,
        transport_events: EventReceiver,
        commands: CommandReceiver,
        config: ServiceConfig,
    ) -> Self {
        Self {
            controller,
            transport_events,
            commands,
            config,
        }
    }

    pub fn controller(&self) -> &DeviceController<T> {
        &self.controller
    }

    /// Run until cancelled, told to shut down, or every command sender is
    /// gone. The link is closed on the way out and the controller handed
    /// back.
    pub async fn run(mut self, cancel: CancellationToken) -> DeviceController<T> {
        let mut reconcile = time::interval(self.config.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sync = time::interval(self.config.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Device service started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Device service cancelled");
                    break;
                }
                Some(event) = self.transport_events.recv() => {
                    self.controller.handle_transport_event(event);
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        info!("Command channel closed");
                        break;
                    };
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                _ = reconcile.tick() => self.controller.reconcile(),
                _ = sync.tick(), if self.controller.is_syncing() => self.controller.sync_tick(),
            }
        }

        self.controller.shutdown();
        info!("Device service stopped");
        self.controller
    }

    fn handle_command(&mut self, command: DeviceCommand) -> ControlFlow<()> {
        debug!("Command: {:?}", command);
        // Failures are already reported on the event channel
        match command {
            DeviceCommand::BeginSession => {
                let _ = self.controller.begin_session();
            }
            DeviceCommand::EndSession => {
                let _ = self.controller.end_session();
            }
            DeviceCommand::SelectTemperature(index) => {
                let _ = self.controller.select_temperature(index);
            }
            DeviceCommand::SelectTime(index) => {
                let _ = self.controller.select_time(index);
            }
            DeviceCommand::Disconnect => {
                let _ = self.controller.disconnect();
            }
            DeviceCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::AppEvent;
    use crate::domain::settings::MemoryStore;
    use crate::infrastructure::bluetooth::connection::{DeviceLink, LinkConfig};
    use crate::infrastructure::bluetooth::simulator::SimulatedTransport;
    use crate::infrastructure::bluetooth::transport::event_channel;
    use tokio::task::JoinHandle;

    struct Running {
        commands: CommandSender,
        events: mpsc::UnboundedReceiver<AppEvent>,
        cancel: CancellationToken,
        handle: JoinHandle<DeviceController<SimulatedTransport>>,
    }

    fn start() -> Running {
        let (transport_tx, transport_rx) = event_channel();
        let mut transport = SimulatedTransport::new(transport_tx);
        transport.power_on();

        let (app_tx, events) = mpsc::unbounded_channel();
        let link = DeviceLink::new(transport, LinkConfig::default());
        let controller = DeviceController::new(link, Box::new(MemoryStore::default()), app_tx, 5);
        let (commands, command_rx) = command_channel();
        let config = ServiceConfig {
            reconcile_interval: Duration::from_millis(10),
            sync_interval: Duration::from_millis(20),
        };

        let cancel = CancellationToken::new();
        let service = DeviceService::new(controller, transport_rx, command_rx, config);
        let handle = tokio::spawn(service.run(cancel.clone()));
        Running {
            commands,
            events,
            cancel,
            handle,
        }
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<AppEvent>,
        pred: impl Fn(&AppEvent) -> bool,
    ) -> AppEvent {
        time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_connects_and_syncs() {
        let mut running = start();

        wait_for(&mut running.events, |e| matches!(e, AppEvent::Ready(_))).await;
        wait_for(&mut running.events, |e| matches!(e, AppEvent::SyncCompleted)).await;

        running.commands.send(DeviceCommand::Shutdown).unwrap();
        let controller = running.handle.await.unwrap();
        assert!(controller.link().is_closed());
        assert_eq!(controller.session().dab_count, 12);
    }

    #[tokio::test]
    async fn test_session_commands_round_trip() {
        let mut running = start();
        wait_for(&mut running.events, |e| matches!(e, AppEvent::SyncCompleted)).await;

        running.commands.send(DeviceCommand::SelectTime(2)).unwrap();
        running.commands.send(DeviceCommand::BeginSession).unwrap();
        wait_for(&mut running.events, |e| {
            matches!(e, AppEvent::RemainingChanged(s) if *s == 25.0)
        })
        .await;

        running.commands.send(DeviceCommand::EndSession).unwrap();
        wait_for(&mut running.events, |e| matches!(e, AppEvent::ActivityChanged(false))).await;
        // the refresh sync after the session reports the new count
        wait_for(&mut running.events, |e| {
            matches!(e, AppEvent::CountsChanged { dab: 13, .. })
        })
        .await;

        running.cancel.cancel();
        let controller = running.handle.await.unwrap();
        assert_eq!(controller.session().time_index(), 2);
    }

    #[tokio::test]
    async fn test_cancel_closes_link() {
        let mut running = start();
        wait_for(&mut running.events, |e| matches!(e, AppEvent::Ready(_))).await;

        running.cancel.cancel();
        let controller = running.handle.await.unwrap();
        assert!(controller.link().is_closed());
        assert!(!controller.is_syncing());
    }

    #[tokio::test]
    async fn test_dropped_command_sender_stops_service() {
        let running = start();
        drop(running.commands);

        let controller = time::timeout(Duration::from_secs(5), running.handle)
            .await
            .expect("service did not stop")
            .unwrap();
        assert!(controller.link().is_closed());
    }
}
