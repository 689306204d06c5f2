//! Core types shared by adapters, the aggregator and UI layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Host subsystem exposed by the panel. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemKind {
    Network,
    Bluetooth,
    Audio,
    Brightness,
    Power,
    BlueLight,
}

impl SubsystemKind {
    pub const ALL: [SubsystemKind; 6] = [
        SubsystemKind::Network,
        SubsystemKind::Bluetooth,
        SubsystemKind::Audio,
        SubsystemKind::Brightness,
        SubsystemKind::Power,
        SubsystemKind::BlueLight,
    ];
}

impl std::fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubsystemKind::Network => write!(f, "Network"),
            SubsystemKind::Bluetooth => write!(f, "Bluetooth"),
            SubsystemKind::Audio => write!(f, "Audio"),
            SubsystemKind::Brightness => write!(f, "Brightness"),
            SubsystemKind::Power => write!(f, "Power"),
            SubsystemKind::BlueLight => write!(f, "BlueLight"),
        }
    }
}

/// Whether a subsystem can currently be used.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Available,
    #[default]
    Unavailable,
    /// Reachable, but a helper or permission is missing.
    Degraded(String),
}

impl Availability {
    /// Available or Degraded: the service answers and its state can be read.
    #[inline]
    pub fn is_usable(&self) -> bool {
        !matches!(self, Availability::Unavailable)
    }
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Available => write!(f, "available"),
            Availability::Unavailable => write!(f, "unavailable"),
            Availability::Degraded(reason) => write!(f, "degraded ({})", reason),
        }
    }
}

// ============ Per-kind state shapes ============

/// Kind of the currently active network link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    None,
    Wifi,
    Ethernet,
}

/// A visible WiFi network.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// Signal strength (0-100), if reported.
    pub strength: Option<u8>,
    /// Whether this is the network we are connected to.
    pub active: bool,
    /// Security as NetworkManager reports it ("WPA2", "none"), if known.
    pub security: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub wifi_enabled: bool,
    pub connection_type: ConnectionType,
    pub active_ssid: Option<String>,
    /// WiFi signal strength (0-100), None if not WiFi or unknown.
    pub signal_strength: Option<u8>,
    pub networks: Vec<WifiNetwork>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    /// MAC address, e.g. "AA:BB:CC:DD:EE:FF".
    pub address: String,
    pub name: Option<String>,
    pub paired: bool,
    pub connected: bool,
    /// Battery percentage reported by the device, if any.
    pub battery: Option<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothState {
    pub powered: bool,
    pub discovering: bool,
    pub adapter_name: Option<String>,
    pub devices: Vec<BluetoothDevice>,
}

impl BluetoothState {
    pub fn connected_devices(&self) -> usize {
        self.devices.iter().filter(|d| d.connected).count()
    }
}

/// A sink (output) or source (input) device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    /// Server name, e.g. "alsa_output.pci-0000_00_1f.3.analog-stereo".
    pub name: String,
    pub description: String,
    /// Volume percentage (0-150, above 100 is amplified).
    pub volume_percent: u32,
    pub muted: bool,
}

/// An application stream, playing or recording.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStream {
    pub index: u32,
    pub name: String,
    pub volume_percent: u32,
    pub muted: bool,
    /// Index of the sink it plays to, or the source it records from.
    pub device: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioState {
    pub default_sink: Option<String>,
    pub default_source: Option<String>,
    pub sinks: Vec<AudioDevice>,
    pub sources: Vec<AudioDevice>,
    pub streams: Vec<AudioStream>,
    pub recording_streams: Vec<AudioStream>,
}

impl AudioState {
    pub fn default_sink_device(&self) -> Option<&AudioDevice> {
        let name = self.default_sink.as_deref()?;
        self.sinks.iter().find(|s| s.name == name)
    }

    pub fn default_source_device(&self) -> Option<&AudioDevice> {
        let name = self.default_source.as_deref()?;
        self.sources.iter().find(|s| s.name == name)
    }

    /// Volume of the default sink.
    pub fn volume(&self) -> Option<u32> {
        self.default_sink_device().map(|d| d.volume_percent)
    }

    /// Mute state of the default sink.
    pub fn muted(&self) -> Option<bool> {
        self.default_sink_device().map(|d| d.muted)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrightnessState {
    /// Backlight device name under /sys/class/backlight.
    pub device: String,
    /// Current brightness (0-100).
    pub percent: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerState {
    /// Active power profile, e.g. "balanced".
    pub profile: Option<String>,
    /// Profiles advertised by the power daemon.
    pub profiles: Vec<String>,
    pub battery_percent: Option<u8>,
    pub charging: bool,
    /// e.g. "2:15 remaining", empty when unknown.
    pub time_remaining: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueLightState {
    pub enabled: bool,
    /// Color temperature in Kelvin.
    pub temperature: u32,
}

/// State of one subsystem. Each kind owns its own shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubsystemState {
    Network(NetworkState),
    Bluetooth(BluetoothState),
    Audio(AudioState),
    Brightness(BrightnessState),
    Power(PowerState),
    BlueLight(BlueLightState),
}

impl SubsystemState {
    #[inline]
    pub fn kind(&self) -> SubsystemKind {
        match self {
            SubsystemState::Network(_) => SubsystemKind::Network,
            SubsystemState::Bluetooth(_) => SubsystemKind::Bluetooth,
            SubsystemState::Audio(_) => SubsystemKind::Audio,
            SubsystemState::Brightness(_) => SubsystemKind::Brightness,
            SubsystemState::Power(_) => SubsystemKind::Power,
            SubsystemState::BlueLight(_) => SubsystemKind::BlueLight,
        }
    }

    pub fn as_audio(&self) -> Option<&AudioState> {
        match self {
            SubsystemState::Audio(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_network(&self) -> Option<&NetworkState> {
        match self {
            SubsystemState::Network(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bluetooth(&self) -> Option<&BluetoothState> {
        match self {
            SubsystemState::Bluetooth(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_brightness(&self) -> Option<&BrightnessState> {
        match self {
            SubsystemState::Brightness(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_power(&self) -> Option<&PowerState> {
        match self {
            SubsystemState::Power(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blue_light(&self) -> Option<&BlueLightState> {
        match self {
            SubsystemState::BlueLight(s) => Some(s),
            _ => None,
        }
    }
}

// ============ Change events ============

/// Where a change event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// Triggered by the service itself.
    Push,
    /// Sampled by the scheduler.
    Poll,
    /// Read back after a command succeeded.
    CommandResult,
}

impl EventSource {
    /// Tie-break rank for events sampled at the same instant.
    /// Higher wins: a push is triggered by the service, the others are samples.
    #[inline]
    pub fn precedence(self) -> u8 {
        match self {
            EventSource::Poll => 0,
            EventSource::CommandResult => 1,
            EventSource::Push => 2,
        }
    }
}

/// A unit of state update flowing into the aggregator. Immutable.
///
/// Carries two clocks: `sampled` (monotonic) orders events, `timestamp`
/// (wall clock) is for display only and may jump.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    kind: SubsystemKind,
    payload: SubsystemState,
    source: EventSource,
    sampled: Instant,
    timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Event stamped with the current time.
    pub fn new(payload: SubsystemState, source: EventSource) -> Self {
        Self::with_timestamp(payload, source, Utc::now())
    }

    /// Event with an explicit wall-clock stamp, sampled now.
    pub fn with_timestamp(
        payload: SubsystemState,
        source: EventSource,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: payload.kind(),
            payload,
            source,
            sampled: Instant::now(),
            timestamp,
        }
    }

    /// Override the ordering instant.
    pub fn sampled_at(mut self, sampled: Instant) -> Self {
        self.sampled = sampled;
        self
    }

    #[inline]
    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    #[inline]
    pub fn payload(&self) -> &SubsystemState {
        &self.payload
    }

    #[inline]
    pub fn source(&self) -> EventSource {
        self.source
    }

    /// Monotonic instant the merge rule orders by.
    #[inline]
    pub fn sampled(&self) -> Instant {
        self.sampled
    }

    #[inline]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn into_payload(self) -> SubsystemState {
        self.payload
    }
}
