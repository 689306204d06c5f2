//! User-intent commands, one verb set per subsystem.

use crate::types::SubsystemKind;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkAction {
    SetWifiEnabled(bool),
    Scan,
    Connect {
        ssid: String,
        password: Option<String>,
        /// Keep the profile after this session.
        remember: bool,
    },
    Disconnect,
    /// Delete the saved profile.
    Forget { ssid: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BluetoothAction {
    SetPowered(bool),
    StartDiscovery,
    StopDiscovery,
    Connect { address: String },
    Disconnect { address: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioAction {
    SetVolume(u32), // Default sink, percent
    SetMuted(bool),
    ToggleMute,
    SetDefaultSink(String), // Sink name, moves playing streams too
    SetSourceVolume(u32),
    SetSourceMuted(bool),
    SetDefaultSource(String),
    SetStreamVolume { index: u32, percent: u32 },
    SetStreamMuted { index: u32, muted: bool },
    SetRecordingVolume { index: u32, percent: u32 },
    SetRecordingMuted { index: u32, muted: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrightnessAction {
    Set(u32), // Percent
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerAction {
    SetProfile(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlueLightAction {
    SetTemperature(u32), // Kelvin
    Disable,
}

/// A request to change one subsystem, tagged by its kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Network(NetworkAction),
    Bluetooth(BluetoothAction),
    Audio(AudioAction),
    Brightness(BrightnessAction),
    Power(PowerAction),
    BlueLight(BlueLightAction),
}

impl Command {
    #[inline]
    pub fn kind(&self) -> SubsystemKind {
        match self {
            Command::Network(_) => SubsystemKind::Network,
            Command::Bluetooth(_) => SubsystemKind::Bluetooth,
            Command::Audio(_) => SubsystemKind::Audio,
            Command::Brightness(_) => SubsystemKind::Brightness,
            Command::Power(_) => SubsystemKind::Power,
            Command::BlueLight(_) => SubsystemKind::BlueLight,
        }
    }

    /// Verb name used in logs and failure notifications.
    pub fn action_name(&self) -> &'static str {
        match self {
            Command::Network(a) => match a {
                NetworkAction::SetWifiEnabled(_) => "set-wifi-enabled",
                NetworkAction::Scan => "scan",
                NetworkAction::Connect { .. } => "connect",
                NetworkAction::Disconnect => "disconnect",
                NetworkAction::Forget { .. } => "forget",
            },
            Command::Bluetooth(a) => match a {
                BluetoothAction::SetPowered(_) => "set-powered",
                BluetoothAction::StartDiscovery => "start-discovery",
                BluetoothAction::StopDiscovery => "stop-discovery",
                BluetoothAction::Connect { .. } => "connect",
                BluetoothAction::Disconnect { .. } => "disconnect",
            },
            Command::Audio(a) => match a {
                AudioAction::SetVolume(_) => "set-volume",
                AudioAction::SetMuted(_) => "set-muted",
                AudioAction::ToggleMute => "toggle-mute",
                AudioAction::SetDefaultSink(_) => "set-default-sink",
                AudioAction::SetSourceVolume(_) => "set-source-volume",
                AudioAction::SetSourceMuted(_) => "set-source-muted",
                AudioAction::SetDefaultSource(_) => "set-default-source",
                AudioAction::SetStreamVolume { .. } => "set-stream-volume",
                AudioAction::SetStreamMuted { .. } => "set-stream-muted",
                AudioAction::SetRecordingVolume { .. } => "set-recording-volume",
                AudioAction::SetRecordingMuted { .. } => "set-recording-muted",
            },
            Command::Brightness(BrightnessAction::Set(_)) => "set-brightness",
            Command::Power(PowerAction::SetProfile(_)) => "set-profile",
            Command::BlueLight(a) => match a {
                BlueLightAction::SetTemperature(_) => "set-temperature",
                BlueLightAction::Disable => "disable",
            },
        }
    }
}
