//! Device controller
//!
//! Glue between the link, the frame codec and the session state. Everything
//! the presentation layer sees leaves through the [`AppEvent`] channel.

use crate::domain::error::{ControllerError, LinkError};
use crate::domain::models::{
    AppEvent, AtomizerMode, LinkState, MessageSeverity, PeripheralId, StatusMessage,
    TelemetryFrame,
};
use crate::domain::session::SessionState;
use crate::domain::settings::{PreferenceStore, TEMP_INDEX_KEY, TIME_INDEX_KEY};
use crate::infrastructure::bluetooth::connection::{DeviceLink, LinkEvent};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct SyncState {
    /// First Ready since start or since the last disconnect
    initial_setup: bool,
    /// Last sync did not complete
    retry: bool,
    in_progress: bool,
    attempts: u32,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            initial_setup: true,
            retry: true,
            in_progress: false,
            attempts: 0,
        }
    }
}

pub struct DeviceController<T: Transport> {
    link: DeviceLink<T>,
    session: SessionState,
    store: Box<dyn PreferenceStore + Send>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    sync: SyncState,
    max_sync_attempts: u32,
}

impl<T: Transport> DeviceController<T> {
    pub fn new(
        link: DeviceLink<T>,
        store: Box<dyn PreferenceStore + Send>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        max_sync_attempts: u32,
    ) -> Self {
        let stored = |key: &str| store.get_int(key).unwrap_or(0).max(0) as usize;
        let session = SessionState::new(stored(TEMP_INDEX_KEY), stored(TIME_INDEX_KEY));
        info!(
            "Loaded selection: {}°F for {}",
            session.temperature_label(),
            session.time_label()
        );

        Self {
            link,
            session,
            store,
            event_sender,
            sync: SyncState::default(),
            max_sync_attempts: max_sync_attempts.max(1),
        }
    }

    pub fn link(&self) -> &DeviceLink<T> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut DeviceLink<T> {
        &mut self.link
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn is_syncing(&self) -> bool {
        self.sync.in_progress
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        self.link.handle_event(event);
        self.process_link_events();
    }

    /// Reconnect/rescan tick
    pub fn reconcile(&mut self) {
        self.link.reconcile();
        self.process_link_events();
    }

    /// Send one sync frame, or give up once the budget is spent
    pub fn sync_tick(&mut self) {
        if !self.sync.in_progress {
            return;
        }
        if self.link.is_closed() {
            self.sync.in_progress = false;
            return;
        }

        if self.sync.attempts >= self.max_sync_attempts {
            warn!(
                "Time sync not acknowledged after {} attempts",
                self.sync.attempts
            );
            self.sync.in_progress = false;
            self.emit(AppEvent::SyncTimedOut {
                attempts: self.sync.attempts,
            });
            self.emit(AppEvent::LogMessage(StatusMessage::new(
                "Device did not answer the time sync",
                MessageSeverity::Warning,
            )));
            return;
        }

        self.sync.attempts += 1;
        match self.link.send(&protocol::encode_sync_time()) {
            Ok(()) => debug!("Time sync sent (attempt {})", self.sync.attempts),
            Err(e) => debug!("Time sync attempt {} failed: {}", self.sync.attempts, e),
        }
    }

    pub fn begin_session(&mut self) -> Result<(), ControllerError> {
        let result = self.try_begin_session();
        self.report(result)
    }

    fn try_begin_session(&mut self) -> Result<(), ControllerError> {
        let frame =
            protocol::start_session_frame(self.session.temp_index(), self.session.time_label())?;
        self.link.send(frame.as_bytes())?;
        info!(
            "Session requested: {}°F for {}",
            self.session.temperature_label(),
            self.session.time_label()
        );
        Ok(())
    }

    pub fn end_session(&mut self) -> Result<(), ControllerError> {
        let result = self
            .link
            .send(&protocol::encode_end_session())
            .map_err(ControllerError::from);
        if result.is_ok() {
            info!("Session end requested");
        }
        self.report(result)
    }

    pub fn select_temperature(&mut self, index: usize) -> Result<(), ControllerError> {
        let result = self
            .session
            .select_temperature(index)
            .map_err(ControllerError::from)
            .and_then(|()| self.persist(TEMP_INDEX_KEY, index));
        let result = self.report(result);
        if result.is_ok() {
            self.emit_selection();
        }
        result
    }

    pub fn select_time(&mut self, index: usize) -> Result<(), ControllerError> {
        let result = self
            .session
            .select_time(index)
            .map_err(ControllerError::from)
            .and_then(|()| self.persist(TIME_INDEX_KEY, index));
        let result = self.report(result);
        if result.is_ok() {
            self.emit_selection();
        }
        result
    }

    pub fn disconnect(&mut self) -> Result<(), ControllerError> {
        self.sync.in_progress = false;
        let result = self.link.disconnect().map_err(ControllerError::from);
        self.process_link_events();
        self.report(result)
    }

    pub fn shutdown(&mut self) {
        self.sync.in_progress = false;
        self.link.close();
        self.process_link_events();
    }

    fn process_link_events(&mut self) {
        loop {
            let events = self.link.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.on_link_event(event);
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged(state) => {
                if state == LinkState::Disconnected {
                    self.sync.initial_setup = true;
                    self.sync.in_progress = false;
                }
                self.emit(AppEvent::LinkState(state));
            }
            LinkEvent::DevicesChanged(records) => self.emit(AppEvent::DevicesChanged(records)),
            LinkEvent::Ready(peripheral) => self.on_ready(peripheral),
            LinkEvent::Value(bytes) => self.ingest(&bytes),
            LinkEvent::Error(e) => {
                let severity = match e {
                    LinkError::TransportUnavailable(_) | LinkError::WriteCharacteristicMissing => {
                        MessageSeverity::Error
                    }
                    _ => MessageSeverity::Warning,
                };
                self.emit(AppEvent::LogMessage(StatusMessage::new(e.to_string(), severity)));
            }
        }
    }

    fn on_ready(&mut self, peripheral: PeripheralId) {
        self.emit(AppEvent::LogMessage(StatusMessage::new(
            format!("Connected to {}", peripheral),
            MessageSeverity::Success,
        )));
        self.emit(AppEvent::Ready(peripheral));

        if let Err(e) = self.link.stop_scanning() {
            warn!("Failed to stop scanning: {}", e);
        }

        if self.sync.initial_setup {
            if let Err(e) = self.link.enable_read_notifications() {
                warn!("{}", e);
            }
        }
        if self.sync.initial_setup || self.sync.retry {
            self.start_sync();
        }
        self.sync.initial_setup = false;
    }

    fn start_sync(&mut self) {
        info!("Starting time sync");
        self.sync.in_progress = true;
        self.sync.retry = true;
        self.sync.attempts = 0;
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let frame = protocol::decode(bytes);
        if let TelemetryFrame::Unrecognized(raw) = &frame {
            debug!("Unrecognized frame: {}", protocol::to_hex(raw));
            return;
        }
        self.emit(AppEvent::Telemetry(frame.clone()));

        match frame {
            TelemetryFrame::IdleConcentrate => self.apply_idle(AtomizerMode::Dab),
            TelemetryFrame::IdleFlower => self.apply_idle(AtomizerMode::Flower),
            TelemetryFrame::HitCounts { wax, herb } => {
                self.session.dab_count = wax;
                self.session.flower_count = herb;
                self.emit(AppEvent::CountsChanged {
                    dab: wax,
                    flower: herb,
                });
                self.sync.retry = false;
                if self.sync.in_progress {
                    info!("Time sync completed after {} attempts", self.sync.attempts);
                    self.sync.in_progress = false;
                    self.emit(AppEvent::SyncCompleted);
                }
            }
            TelemetryFrame::ActiveSession {
                mode,
                temp_index,
                seconds_remaining,
            } => {
                if let Some(mode) = mode {
                    self.apply_mode(mode);
                }
                self.set_active(true);
                debug!(
                    "Device heating at index {} with {}s left",
                    temp_index, seconds_remaining
                );
                self.session.remaining_seconds = f32::from(seconds_remaining);
                self.emit(AppEvent::RemainingChanged(self.session.remaining_seconds));
            }
            TelemetryFrame::Unrecognized(_) => {}
        }
    }

    fn apply_idle(&mut self, mode: AtomizerMode) {
        self.apply_mode(mode);
        let was_active = self.session.active;
        self.set_active(false);
        if was_active {
            self.session.remaining_seconds = 0.0;
            self.emit(AppEvent::RemainingChanged(0.0));
            // counters changed, refresh them
            self.start_sync();
        }
    }

    fn apply_mode(&mut self, mode: AtomizerMode) {
        if self.session.atomizer_mode == mode {
            return;
        }
        info!("Atomizer mode: {}", mode);
        let clamped = self.session.set_mode(mode);
        self.emit(AppEvent::ModeChanged(mode));
        if clamped {
            for (key, value) in [
                (TEMP_INDEX_KEY, self.session.temp_index()),
                (TIME_INDEX_KEY, self.session.time_index()),
            ] {
                let result = self.persist(key, value);
                let _ = self.report(result);
            }
        }
        self.emit_selection();
    }

    fn set_active(&mut self, active: bool) {
        if self.session.active != active {
            self.session.active = active;
            self.emit(AppEvent::ActivityChanged(active));
        }
    }

    fn persist(&mut self, key: &str, value: usize) -> Result<(), ControllerError> {
        self.store
            .set_int(key, value as i64)
            .map_err(|e| ControllerError::Persistence(e.to_string()))
    }

    fn emit_selection(&self) {
        self.emit(AppEvent::SelectionChanged {
            temperature: self.session.temperature_label(),
            duration: self.session.time_label().to_string(),
        });
    }

    fn report<R>(&self, result: Result<R, ControllerError>) -> Result<R, ControllerError> {
        if let Err(e) = &result {
            warn!("{}", e);
            self.emit(AppEvent::LogMessage(StatusMessage::new(
                e.to_string(),
                MessageSeverity::Error,
            )));
        }
        result
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::SessionError;
    use crate::domain::models::AdapterState;
    use crate::domain::settings::MemoryStore;
    use crate::infrastructure::bluetooth::connection::LinkConfig;
    use crate::infrastructure::bluetooth::simulator::{SimulatedTransport, SIM_CARTA_ID};
    use crate::infrastructure::bluetooth::transport::{event_channel, EventReceiver};

    struct Harness {
        controller: DeviceController<SimulatedTransport>,
        transport_rx: EventReceiver,
        app_rx: mpsc::UnboundedReceiver<AppEvent>,
    }

    impl Harness {
        fn new(store: MemoryStore) -> Self {
            let (tx, transport_rx) = event_channel();
            let transport = SimulatedTransport::new(tx);
            let link = DeviceLink::new(transport, LinkConfig::default());
            let (app_tx, app_rx) = mpsc::unbounded_channel();
            let controller = DeviceController::new(link, Box::new(store), app_tx, 3);
            let mut harness = Self {
                controller,
                transport_rx,
                app_rx,
            };
            harness.controller.link_mut().transport_mut().power_on();
            harness.pump();
            harness
        }

        /// Feed queued transport events until the channel is quiet
        fn pump(&mut self) {
            while let Ok(event) = self.transport_rx.try_recv() {
                self.controller.handle_transport_event(event);
            }
        }

        fn connect(&mut self) {
            self.controller.reconcile();
            self.pump();
            self.controller.reconcile();
            self.pump();
            assert!(self.controller.link().is_ready());
        }

        fn app_events(&mut self) -> Vec<AppEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.app_rx.try_recv() {
                events.push(event);
            }
            events
        }

        fn writes(&self) -> Vec<Vec<u8>> {
            self.controller.link().transport().written().to_vec()
        }
    }

    fn has(events: &[AppEvent], pred: impl Fn(&AppEvent) -> bool) -> bool {
        events.iter().any(pred)
    }

    #[test]
    fn test_loads_persisted_selection() {
        let mut store = MemoryStore::default();
        store.set_int(TEMP_INDEX_KEY, 3).unwrap();
        store.set_int(TIME_INDEX_KEY, 0).unwrap();
        let harness = Harness::new(store);

        assert_eq!(harness.controller.session().temp_index(), 3);
        assert_eq!(harness.controller.session().time_index(), 1);
    }

    #[test]
    fn test_ready_starts_sync_and_counts_complete_it() {
        let mut harness = Harness::new(MemoryStore::default());
        harness.connect();

        let events = harness.app_events();
        assert!(has(&events, |e| matches!(e, AppEvent::Ready(id) if id.as_str() == SIM_CARTA_ID)));
        assert!(harness.controller.is_syncing());
        assert!(!harness.controller.link().transport().is_scanning());

        harness.controller.sync_tick();
        harness.pump();

        assert_eq!(harness.writes(), vec![protocol::encode_sync_time().to_vec()]);
        assert!(!harness.controller.is_syncing());
        let events = harness.app_events();
        assert!(has(&events, |e| matches!(e, AppEvent::SyncCompleted)));
        assert!(has(&events, |e| matches!(
            e,
            AppEvent::CountsChanged { dab: 12, flower: 4 }
        )));
    }

    #[test]
    fn test_sync_gives_up_after_budget() {
        let mut harness = Harness::new(MemoryStore::default());
        harness.connect();
        harness.controller.link_mut().transport_mut().set_mute(true);

        for _ in 0..10 {
            harness.controller.sync_tick();
            harness.pump();
        }

        assert!(!harness.controller.is_syncing());
        assert_eq!(harness.writes().len(), 3);
        let timeouts: Vec<_> = harness
            .app_events()
            .into_iter()
            .filter(|e| matches!(e, AppEvent::SyncTimedOut { .. }))
            .collect();
        assert_eq!(timeouts.len(), 1);
        assert!(matches!(timeouts[0], AppEvent::SyncTimedOut { attempts: 3 }));
    }

    #[test]
    fn test_unfinished_sync_retried_on_next_ready() {
        let mut harness = Harness::new(MemoryStore::default());
        harness.connect();
        harness.controller.link_mut().transport_mut().set_mute(true);
        for _ in 0..4 {
            harness.controller.sync_tick();
        }
        assert!(!harness.controller.is_syncing());

        harness.controller.link_mut().transport_mut().set_mute(false);
        harness.controller.link_mut().transport_mut().drop_connection();
        harness.pump();
        harness.connect();

        assert!(harness.controller.is_syncing());
    }

    #[test]
    fn test_begin_and_end_session() {
        let mut harness = Harness::new(MemoryStore::default());
        harness.connect();
        harness.controller.sync_tick();
        harness.pump();
        assert!(!harness.controller.is_syncing());
        harness.controller.select_temperature(2).unwrap();
        harness.controller.select_time(3).unwrap();
        harness.app_events();

        harness.controller.begin_session().unwrap();
        harness.pump();
        assert_eq!(
            harness.writes().last().unwrap(),
            &protocol::encode_start_session(2, 30).to_vec()
        );
        assert!(harness.controller.session().active);
        let events = harness.app_events();
        assert!(has(&events, |e| matches!(e, AppEvent::ActivityChanged(true))));
        assert!(has(&events, |e| matches!(e, AppEvent::RemainingChanged(s) if *s == 30.0)));

        harness.controller.end_session().unwrap();
        harness.pump();
        assert_eq!(
            harness.writes().last().unwrap(),
            &protocol::encode_end_session().to_vec()
        );
        assert!(!harness.controller.session().active);
        // active -> idle refreshes the counters
        assert!(harness.controller.is_syncing());
        assert!(has(&harness.app_events(), |e| matches!(
            e,
            AppEvent::ActivityChanged(false)
        )));
    }

    #[test]
    fn test_begin_session_without_link_is_reported() {
        let mut harness = Harness::new(MemoryStore::default());
        let result = harness.controller.begin_session();

        assert_eq!(
            result,
            Err(ControllerError::Link(LinkError::NotConnected))
        );
        assert!(has(&harness.app_events(), |e| matches!(
            e,
            AppEvent::LogMessage(m) if m.severity == MessageSeverity::Error
        )));
    }

    #[test]
    fn test_selection_rejected_and_persisted() {
        let mut harness = Harness::new(MemoryStore::default());

        assert!(matches!(
            harness.controller.select_temperature(0),
            Err(ControllerError::Session(SessionError::IndexOutOfRange { .. }))
        ));
        assert_eq!(harness.controller.session().temp_index(), 1);

        harness.controller.select_temperature(4).unwrap();
        assert_eq!(harness.controller.store.get_int(TEMP_INDEX_KEY), Some(4));
        assert!(has(&harness.app_events(), |e| matches!(
            e,
            AppEvent::SelectionChanged { temperature, duration }
                if temperature == "536" && duration == "0:20"
        )));
    }

    #[test]
    fn test_flower_mode_clamps_and_persists() {
        let mut harness = Harness::new(MemoryStore::default());
        harness.connect();
        harness.controller.select_temperature(9).unwrap();
        harness.app_events();

        harness
            .controller
            .link_mut()
            .transport_mut()
            .switch_mode(AtomizerMode::Flower);
        harness.pump();

        assert_eq!(harness.controller.session().atomizer_mode, AtomizerMode::Flower);
        assert_eq!(harness.controller.session().temp_index(), 5);
        assert_eq!(harness.controller.store.get_int(TEMP_INDEX_KEY), Some(5));
        assert!(has(&harness.app_events(), |e| matches!(
            e,
            AppEvent::ModeChanged(AtomizerMode::Flower)
        )));
    }

    #[test]
    fn test_peer_drop_reconnects() {
        let mut harness = Harness::new(MemoryStore::default());
        harness.connect();
        harness.app_events();

        harness.controller.link_mut().transport_mut().drop_connection();
        harness.pump();
        assert_eq!(harness.controller.link().state(), LinkState::Disconnected);
        assert!(!harness.controller.is_syncing());

        harness.connect();
        assert!(has(&harness.app_events(), |e| matches!(e, AppEvent::Ready(_))));
    }

    #[test]
    fn test_adapter_power_off_is_reported() {
        let mut harness = Harness::new(MemoryStore::default());
        harness
            .controller
            .link_mut()
            .transport_mut()
            .set_adapter_state(AdapterState::PoweredOff);
        harness.pump();

        let events = harness.app_events();
        assert!(has(&events, |e| matches!(
            e,
            AppEvent::LinkState(LinkState::PoweredOff)
        )));
        assert!(has(&events, |e| matches!(
            e,
            AppEvent::LogMessage(m) if m.severity == MessageSeverity::Error
        )));
    }

    #[test]
    fn test_shutdown_stops_ticks() {
        let mut harness = Harness::new(MemoryStore::default());
        harness.connect();
        harness.controller.shutdown();
        harness.pump();
        let writes = harness.writes().len();

        harness.controller.sync_tick();
        harness.controller.reconcile();
        harness.pump();
        assert_eq!(harness.writes().len(), writes);
        assert!(harness.controller.link().is_closed());
    }
}
