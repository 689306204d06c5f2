//! control-panel - live state of the desktop's host services.
//!
//! Headless runner: starts the core with every backend adapter and logs
//! what a panel would render. SIGHUP re-reads the configuration file.

mod event_bus;
mod services;

use ctl_core::{ControlCore, CoreConfig, Notification, SubsystemState};
use log::{info, warn};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};

fn load_config(path: Option<&PathBuf>) -> CoreConfig {
    match path {
        Some(path) => CoreConfig::load_or_default(path),
        None => {
            warn!("No config directory, using defaults");
            CoreConfig::default()
        }
    }
}

fn describe(state: &SubsystemState) -> String {
    match state {
        SubsystemState::Network(n) => format!(
            "wifi={} {:?} ssid={} signal={}",
            n.wifi_enabled,
            n.connection_type,
            n.active_ssid.as_deref().unwrap_or("-"),
            n.signal_strength.map_or("-".into(), |s| format!("{}%", s)),
        ),
        SubsystemState::Bluetooth(b) => format!(
            "powered={} discovering={} connected={}/{}",
            b.powered,
            b.discovering,
            b.connected_devices(),
            b.devices.len()
        ),
        SubsystemState::Audio(a) => format!(
            "sink={} volume={} muted={} streams={} recording={}",
            a.default_sink.as_deref().unwrap_or("-"),
            a.volume().map_or("-".into(), |v| format!("{}%", v)),
            a.muted().unwrap_or(false),
            a.streams.len(),
            a.recording_streams.len()
        ),
        SubsystemState::Brightness(b) => format!("{} {}%", b.device, b.percent),
        SubsystemState::Power(p) => format!(
            "profile={} battery={} charging={} {}",
            p.profile.as_deref().unwrap_or("-"),
            p.battery_percent.map_or("-".into(), |v| format!("{}%", v)),
            p.charging,
            p.time_remaining.as_deref().unwrap_or("")
        ),
        SubsystemState::BlueLight(b) => format!("enabled={} {}K", b.enabled, b.temperature),
    }
}

fn render(notification: &Notification) {
    match notification {
        Notification::State {
            kind,
            state,
            availability,
            source,
            ..
        } => info!("[{}] {} ({}, via {:?})", kind, describe(state), availability, source),
        Notification::Availability { kind, availability } => {
            info!("[{}] now {}", kind, availability)
        }
        Notification::CommandApplied { kind, action } => info!("[{}] {} applied", kind, action),
        Notification::CommandFailed {
            kind,
            action,
            error,
        } => warn!("[{}] {} failed ({}): {}", kind, action, error.code(), error.reason()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting control-panel...");

    let config_path = CoreConfig::default_path();
    let config = load_config(config_path.as_ref());

    let core = ControlCore::start(config, services::all_adapters()).await;
    let mut rx = core.subscribe();

    // Startup state is only in the snapshot, the bus carries changes from here
    let snapshot = core.snapshot();
    let mut kinds: Vec<_> = snapshot.iter().collect();
    kinds.sort_by_key(|(kind, _)| **kind);
    for (kind, entry) in kinds {
        match entry.state.as_deref() {
            Some(state) => info!("[{}] {} ({})", kind, describe(state), entry.availability),
            None => info!("[{}] {}", kind, entry.availability),
        }
    }

    let mut hangup = signal(SignalKind::hangup())?;
    let mut ticker =
        tokio::time::interval(Duration::from_millis(event_bus::EVENT_POLL_INTERVAL_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for notification in event_bus::drain_latest(&mut rx) {
                    render(&notification);
                }
            }
            _ = hangup.recv() => {
                info!("Reloading configuration");
                let config = load_config(config_path.as_ref());
                for (kind, availability) in core.reload(config).await {
                    info!("[{}] {}", kind, availability);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    core.shutdown();
    Ok(())
}
