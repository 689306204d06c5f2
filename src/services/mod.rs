//! Backend adapters for the host services the panel controls.
//!
//! Each adapter wraps one system service and translates its native
//! notification model into change events for the core.
//!
//! - `network` - NetworkManager via nmrs and D-Bus
//! - `bluetooth` - BlueZ via bluer, signals over D-Bus
//! - `audio` - PulseAudio/PipeWire via libpulse
//! - `brightness` - sysfs backlight, written through logind
//! - `power` - battery crate plus power-profiles-daemon
//! - `bluelight` - gammastep process

pub mod audio;
pub mod bluelight;
pub mod bluetooth;
pub mod brightness;
pub mod network;
pub mod power;

use ctl_core::{BackendAdapter, CommandError};
use log::info;
use std::io;
use std::sync::Arc;

/// One adapter per subsystem. Call once from main.
pub fn all_adapters() -> Vec<Arc<dyn BackendAdapter>> {
    info!("Creating backend adapters...");

    vec![
        Arc::new(network::NetworkAdapter::new()),
        Arc::new(bluetooth::BluetoothAdapter::new()),
        Arc::new(audio::AudioAdapter::new()),
        Arc::new(brightness::BrightnessAdapter::new()),
        Arc::new(power::PowerAdapter::new()),
        Arc::new(bluelight::BlueLightAdapter::new()),
    ]
}

/// Map a D-Bus failure onto the command error taxonomy.
pub(crate) fn classify_dbus(err: &zbus::Error) -> CommandError {
    match err {
        zbus::Error::MethodError(name, detail, _) => {
            let reason = detail.clone().unwrap_or_else(|| name.to_string());
            classify_error_name(name.as_str(), reason)
        }
        zbus::Error::FDO(fdo) => classify_fdo(fdo),
        zbus::Error::InputOutput(e) => CommandError::Unavailable(e.to_string()),
        zbus::Error::Address(reason) | zbus::Error::Handshake(reason) => {
            CommandError::Unavailable(reason.clone())
        }
        other => CommandError::Rejected(other.to_string()),
    }
}

fn classify_fdo(err: &zbus::fdo::Error) -> CommandError {
    use zbus::fdo::Error as Fdo;

    match err {
        Fdo::ServiceUnknown(r) | Fdo::NameHasNoOwner(r) | Fdo::Disconnected(r) => {
            CommandError::Unavailable(r.clone())
        }
        Fdo::AccessDenied(r) | Fdo::AuthFailed(r) | Fdo::InteractiveAuthorizationRequired(r) => {
            CommandError::Degraded(r.clone())
        }
        Fdo::NoReply(r) | Fdo::Timeout(r) | Fdo::TimedOut(r) | Fdo::LimitsExceeded(r) => {
            CommandError::Transient(r.clone())
        }
        Fdo::UnknownMethod(r)
        | Fdo::UnknownObject(r)
        | Fdo::UnknownInterface(r)
        | Fdo::UnknownProperty(r)
        | Fdo::NotSupported(r) => CommandError::Unsupported(r.clone()),
        Fdo::ZBus(e) => classify_dbus(e),
        other => CommandError::Rejected(other.to_string()),
    }
}

/// Classify by well-known D-Bus error name. Service-specific names are
/// treated as an explicit refusal.
pub(crate) fn classify_error_name(name: &str, reason: String) -> CommandError {
    let Some(short) = name.strip_prefix("org.freedesktop.DBus.Error.") else {
        return CommandError::Rejected(reason);
    };
    match short {
        "ServiceUnknown" | "NameHasNoOwner" | "Disconnected" | "NoServer" => {
            CommandError::Unavailable(reason)
        }
        "AccessDenied" | "AuthFailed" | "InteractiveAuthorizationRequired" => {
            CommandError::Degraded(reason)
        }
        "NoReply" | "Timeout" | "TimedOut" | "LimitsExceeded" => CommandError::Transient(reason),
        "UnknownMethod" | "UnknownObject" | "UnknownInterface" | "UnknownProperty"
        | "NotSupported" => CommandError::Unsupported(reason),
        _ => CommandError::Rejected(reason),
    }
}

/// Map a file or process failure onto the command error taxonomy.
pub(crate) fn classify_io(err: &io::Error, what: &str) -> CommandError {
    let reason = format!("{}: {}", what, err);
    match err.kind() {
        io::ErrorKind::NotFound => CommandError::Unavailable(reason),
        io::ErrorKind::PermissionDenied => CommandError::Degraded(reason),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            CommandError::Transient(reason)
        }
        _ => CommandError::Rejected(reason),
    }
}
