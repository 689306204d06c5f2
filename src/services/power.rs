//! Power adapter: battery charge plus power profiles.
//!
//! Battery data comes from the battery crate (sysfs under the hood) and
//! profiles from power-profiles-daemon. Either may be missing; with only
//! one present the subsystem is degraded rather than gone.
//!
//! UPower device signals and power-profiles-daemon property changes are
//! merged into a single push stream. Without UPower nothing announces
//! battery changes, so a machine with a battery is polled instead.

use super::classify_dbus;
use async_trait::async_trait;
use battery::{Battery, Manager, State};
use ctl_core::{
    Availability, BackendAdapter, Capabilities, Command, CommandError, EventSink, PowerAction,
    PowerState, Subscription, SubsystemKind, SubsystemState,
};
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::ops::Deref;
use tokio::sync::OnceCell;
use zbus::Connection;
use zbus::zvariant::{OwnedValue, Value};

#[zbus::proxy(
    interface = "net.hadess.PowerProfiles",
    default_service = "net.hadess.PowerProfiles",
    default_path = "/net/hadess/PowerProfiles"
)]
trait PowerProfiles {
    #[zbus(property)]
    fn active_profile(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn set_active_profile(&self, profile: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn profiles(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;
}

const UPOWER_SERVICE: &str = "org.freedesktop.UPower";
const PROFILES_SERVICE: &str = "net.hadess.PowerProfiles";

#[derive(Clone, Debug, PartialEq)]
struct BatteryReading {
    percent: u8,
    charging: bool,
    time_remaining: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct ProfileReading {
    active: String,
    profiles: Vec<String>,
}

pub struct PowerAdapter {
    connection: OnceCell<Connection>,
}

impl PowerAdapter {
    pub fn new() -> Self {
        Self {
            connection: OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<Connection, CommandError> {
        self.connection
            .get_or_try_init(Connection::system)
            .await
            .cloned()
            .map_err(|e| classify_dbus(&e))
    }

    async fn profiles(&self) -> Result<ProfileReading, CommandError> {
        let conn = self.connection().await?;
        read_profiles(&conn).await.map_err(|e| classify_dbus(&e))
    }
}

impl Default for PowerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for PowerAdapter {
    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Power
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: true,
            poll: true,
            self_reports: true,
        }
    }

    async fn probe(&self) -> Availability {
        let has_battery = matches!(battery_reading().await, Ok(Some(_)));
        let has_profiles = match self.profiles().await {
            Ok(_) => true,
            Err(e) => {
                debug!("power-profiles-daemon not reachable: {}", e);
                false
            }
        };

        match (has_battery, has_profiles) {
            (true, true) => Availability::Available,
            (true, false) => Availability::Degraded("power profiles unavailable".into()),
            (false, true) => Availability::Degraded("no battery".into()),
            (false, false) => Availability::Unavailable,
        }
    }

    async fn current_state(&self) -> Result<SubsystemState, CommandError> {
        let battery = battery_reading().await;
        let profiles = self.profiles().await;

        if let (Err(b), Err(p)) = (&battery, &profiles) {
            return Err(CommandError::Unavailable(format!(
                "battery: {}; profiles: {}",
                b,
                p.reason()
            )));
        }
        let battery = battery.ok().flatten();
        let profiles = profiles.ok();
        if battery.is_none() && profiles.is_none() {
            return Err(CommandError::Unavailable(
                "no battery and no power profiles".into(),
            ));
        }

        Ok(SubsystemState::Power(build_state(battery, profiles)))
    }

    async fn subscribe(&self, sink: EventSink) -> Option<Subscription> {
        let conn = self.connection().await.ok()?;

        let has_battery = matches!(battery_reading().await, Ok(Some(_)));
        let upower = has_owner(&conn, UPOWER_SERVICE).await;
        let profiles_daemon = has_owner(&conn, PROFILES_SERVICE).await;
        if !push_covers(has_battery, upower, profiles_daemon) {
            info!(
                "Power signals incomplete (battery={}, upower={}, profiles={})",
                has_battery, upower, profiles_daemon
            );
            return None;
        }

        let upower = match signal_stream(&conn, "/org/freedesktop/UPower/devices").await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to listen for UPower signals: {}", e);
                return None;
            }
        };
        let profiles = match signal_stream(&conn, "/net/hadess/PowerProfiles").await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to listen for power profile signals: {}", e);
                return None;
            }
        };

        info!("Listening for power D-Bus signals...");
        let task = tokio::spawn(async move {
            let merged = futures_util::stream::select(upower, profiles);
            futures_util::pin_mut!(merged);

            while let Some(msg) = merged.next().await {
                let Ok(msg) = msg else {
                    continue;
                };
                if let Some(path) = msg.header().path() {
                    let path = path.as_str();
                    // Line power and peripheral devices change constantly
                    if path.starts_with("/org/freedesktop/UPower") && !path.contains("battery_BAT")
                    {
                        continue;
                    }
                }

                let battery = battery_reading().await.ok().flatten();
                let profiles = read_profiles(&conn).await.ok();
                if battery.is_none() && profiles.is_none() {
                    continue;
                }
                if !sink.emit(SubsystemState::Power(build_state(battery, profiles))) {
                    break;
                }
            }
            debug!("Power signal stream ended");
        });
        Some(Subscription::from_task(task))
    }

    async fn apply(&self, command: &Command) -> Result<(), CommandError> {
        let Command::Power(PowerAction::SetProfile(profile)) = command else {
            return Err(CommandError::Unsupported(format!(
                "{} is not a power command",
                command.action_name()
            )));
        };

        let current = self.profiles().await?;
        if !current.profiles.iter().any(|p| p == profile) {
            return Err(CommandError::Unsupported(format!(
                "power profile '{}' is not offered",
                profile
            )));
        }

        let conn = self.connection().await?;
        let proxy = PowerProfilesProxy::new(&conn)
            .await
            .map_err(|e| classify_dbus(&e))?;
        info!("Switching power profile to {}", profile);
        proxy
            .set_active_profile(profile)
            .await
            .map_err(|e| classify_dbus(&e))
    }
}

/// Whether signals alone keep every present power source current.
fn push_covers(has_battery: bool, upower: bool, profiles_daemon: bool) -> bool {
    if has_battery && !upower {
        return false;
    }
    upower || profiles_daemon
}

async fn has_owner(conn: &Connection, service: &'static str) -> bool {
    let Ok(proxy) = zbus::fdo::DBusProxy::new(conn).await else {
        return false;
    };
    let Ok(name) = zbus::names::BusName::try_from(service) else {
        return false;
    };
    match proxy.name_has_owner(name).await {
        Ok(owned) => owned,
        Err(e) => {
            debug!("NameHasOwner({}) failed: {}", service, e);
            false
        }
    }
}

async fn signal_stream(conn: &Connection, namespace: &str) -> zbus::Result<zbus::MessageStream> {
    let rule = zbus::MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .interface("org.freedesktop.DBus.Properties")?
        .member("PropertiesChanged")?
        .path_namespace(namespace)?
        .build();

    zbus::MessageStream::for_match_rule(rule, conn, Some(100)).await
}

async fn read_profiles(conn: &Connection) -> zbus::Result<ProfileReading> {
    let proxy = PowerProfilesProxy::new(conn).await?;
    let active = proxy.active_profile().await?;
    let profiles = proxy
        .profiles()
        .await?
        .iter()
        .filter_map(|entry| entry.get("Profile").and_then(|v| value_str(v.deref())))
        .collect();
    Ok(ProfileReading { active, profiles })
}

fn value_str(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn build_state(battery: Option<BatteryReading>, profiles: Option<ProfileReading>) -> PowerState {
    let (profile, profiles) = match profiles {
        Some(p) => (Some(p.active).filter(|a| !a.is_empty()), p.profiles),
        None => (None, Vec::new()),
    };
    match battery {
        Some(b) => PowerState {
            profile,
            profiles,
            battery_percent: Some(b.percent),
            charging: b.charging,
            time_remaining: b.time_remaining,
        },
        None => PowerState {
            profile,
            profiles,
            ..PowerState::default()
        },
    }
}

/// First battery, or `None` on machines without one. The battery crate
/// blocks on sysfs reads so this runs off the async workers.
async fn battery_reading() -> Result<Option<BatteryReading>, String> {
    tokio::task::spawn_blocking(read_battery)
        .await
        .map_err(|e| e.to_string())?
}

fn read_battery() -> Result<Option<BatteryReading>, String> {
    let manager = Manager::new().map_err(|e| e.to_string())?;
    let mut batteries = manager.batteries().map_err(|e| e.to_string())?;
    let Some(battery) = batteries.next() else {
        return Ok(None);
    };
    let mut battery = battery.map_err(|e| e.to_string())?;
    manager.refresh(&mut battery).map_err(|e| e.to_string())?;
    Ok(Some(reading_from(&battery)))
}

fn reading_from(battery: &Battery) -> BatteryReading {
    let state = battery.state();
    let charging = is_charging(state, battery.energy_rate().value);

    let duration = match state {
        State::Charging => battery.time_to_full(),
        State::Discharging => battery.time_to_empty(),
        _ => None,
    };

    BatteryReading {
        percent: charge_percent(battery.state_of_charge().value),
        charging,
        time_remaining: duration.map(|t| format_time_remaining(t.value, state == State::Charging)),
    }
}

#[inline]
fn charge_percent(ratio: f32) -> u8 {
    (ratio * 100.0).round().clamp(0.0, 100.0) as u8
}

fn is_charging(state: State, energy_rate: f32) -> bool {
    match state {
        State::Charging => true,
        // Some firmware never reports a state; a positive rate means charging
        State::Unknown => energy_rate > 0.0,
        _ => false,
    }
}

fn format_time_remaining(seconds: f32, charging: bool) -> String {
    let total_minutes = (seconds / 60.0) as i32;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    let suffix = if charging { "until charged" } else { "remaining" };
    format!("{}:{:02} {}", hours, minutes, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_remaining_formatting() {
        assert_eq!(format_time_remaining(8100.0, false), "2:15 remaining");
        assert_eq!(format_time_remaining(300.0, true), "0:05 until charged");
    }

    #[test]
    fn charge_percent_rounds_and_clamps() {
        assert_eq!(charge_percent(0.456), 46);
        assert_eq!(charge_percent(1.02), 100);
    }

    #[test]
    fn unknown_state_uses_energy_rate() {
        assert!(is_charging(State::Charging, 0.0));
        assert!(is_charging(State::Unknown, 12.5));
        assert!(!is_charging(State::Unknown, 0.0));
        assert!(!is_charging(State::Full, 3.0));
    }

    #[test]
    fn profile_names_are_strings_only() {
        assert_eq!(value_str(&Value::from("balanced")), Some("balanced".into()));
        assert_eq!(value_str(&Value::from(3u32)), None);
    }

    #[test]
    fn battery_without_upower_is_polled() {
        assert!(!push_covers(true, false, true));
        assert!(!push_covers(true, false, false));
        assert!(push_covers(true, true, false));
        assert!(push_covers(false, false, true));
        assert!(!push_covers(false, false, false));
    }

    #[test]
    fn desktop_without_battery_keeps_profiles() {
        let state = build_state(
            None,
            Some(ProfileReading {
                active: "performance".into(),
                profiles: vec!["power-saver".into(), "balanced".into(), "performance".into()],
            }),
        );
        assert_eq!(state.profile.as_deref(), Some("performance"));
        assert_eq!(state.profiles.len(), 3);
        assert_eq!(state.battery_percent, None);
        assert!(!state.charging);
    }

    #[test]
    fn laptop_without_profiles_keeps_battery() {
        let state = build_state(
            Some(BatteryReading {
                percent: 80,
                charging: true,
                time_remaining: Some("0:40 until charged".into()),
            }),
            None,
        );
        assert_eq!(state.profile, None);
        assert!(state.profiles.is_empty());
        assert_eq!(state.battery_percent, Some(80));
        assert!(state.charging);
    }
}
