use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque transport identifier of a peripheral. The transport resolves it
/// back to its native handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power/authorization state of the host Bluetooth adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == Self::PoweredOn
    }

    /// Unsupported, unauthorized and powered-off adapters only recover
    /// through a user settings change.
    pub fn requires_remediation(self) -> bool {
        matches!(
            self,
            Self::Unsupported | Self::Unauthorized | Self::PoweredOff
        )
    }
}

/// Observer-facing link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LinkState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
    Error,
    Connected,
    Disconnected,
}

impl From<AdapterState> for LinkState {
    fn from(state: AdapterState) -> Self {
        match state {
            AdapterState::Unknown => Self::Unknown,
            AdapterState::Resetting => Self::Resetting,
            AdapterState::Unsupported => Self::Unsupported,
            AdapterState::Unauthorized => Self::Unauthorized,
            AdapterState::PoweredOff => Self::PoweredOff,
            AdapterState::PoweredOn => Self::PoweredOn,
        }
    }
}

/// A peripheral seen during the current scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralRecord {
    /// Sequential id assigned on discovery
    pub id: usize,
    pub signal_strength: i16,
    pub identifier: PeripheralId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AtomizerMode {
    #[default]
    Dab,
    Flower,
}

impl fmt::Display for AtomizerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dab => f.write_str("Dab"),
            Self::Flower => f.write_str("Flower"),
        }
    }
}

/// Classified inbound telemetry frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TelemetryFrame {
    IdleConcentrate,
    IdleFlower,
    HitCounts {
        wax: u16,
        herb: u16,
    },
    ActiveSession {
        /// `None` when the device reports a mode byte we don't know
        mode: Option<AtomizerMode>,
        temp_index: u8,
        seconds_remaining: u8,
    },
    /// Kept for diagnostic logging only
    Unrecognized(Vec<u8>),
}

/// Commands issued by the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    BeginSession,
    EndSession,
    SelectTemperature(usize),
    SelectTime(usize),
    Disconnect,
    Shutdown,
}

/// Events delivered to the presentation layer
#[derive(Debug, Clone)]
pub enum AppEvent {
    LinkState(LinkState),
    DevicesChanged(Vec<PeripheralRecord>),
    Ready(PeripheralId),
    Telemetry(TelemetryFrame),
    ModeChanged(AtomizerMode),
    ActivityChanged(bool),
    RemainingChanged(f32),
    CountsChanged { dab: u16, flower: u16 },
    SelectionChanged { temperature: String, duration: String },
    SyncCompleted,
    SyncTimedOut { attempts: u32 },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Success,
    Warning,
    Error,
}
