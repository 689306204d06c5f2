//! Network adapter using NetworkManager.
//!
//! Reads state through nmrs, toggles radios and requests scans over D-Bus,
//! and connects through nmcli so NetworkManager creates the profile.
//! A connection that should not be remembered gets an in-memory profile
//! (`save no`) that NetworkManager drops on its own.
//! Any NetworkManager property change triggers a fresh read.

use super::{classify_dbus, classify_io};
use async_trait::async_trait;
use ctl_core::{
    Availability, BackendAdapter, Capabilities, Command, CommandError, ConnectionType, EventSink,
    NetworkAction, NetworkState, Subscription, SubsystemKind, SubsystemState, WifiNetwork,
};
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use tokio::process::Command as Process;
use tokio::sync::OnceCell;
use zbus::Connection;
use zbus::zvariant::{OwnedObjectPath, Value};

const NM_DEVICE_TYPE_WIFI: u32 = 2;
const NM_DEVICE_STATE_ACTIVATED: u32 = 100;

#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager",
    default_service = "org.freedesktop.NetworkManager",
    default_path = "/org/freedesktop/NetworkManager"
)]
trait NetworkManagerRoot {
    fn get_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    #[zbus(property)]
    fn wireless_enabled(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn set_wireless_enabled(&self, enabled: bool) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager.Device",
    default_service = "org.freedesktop.NetworkManager"
)]
trait NmDevice {
    #[zbus(property)]
    fn device_type(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn state(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn interface(&self) -> zbus::Result<String>;
}

#[zbus::proxy(
    interface = "org.freedesktop.NetworkManager.Device.Wireless",
    default_service = "org.freedesktop.NetworkManager"
)]
trait WirelessDevice {
    fn request_scan(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<()>;
}

pub struct NetworkAdapter {
    connection: OnceCell<Connection>,
}

impl NetworkAdapter {
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

    async fn wifi_devices(&self, conn: &Connection) -> Result<Vec<WifiDevice>, CommandError> {
        let root = NetworkManagerRootProxy::new(conn)
            .await
            .map_err(|e| classify_dbus(&e))?;
        let paths = root.get_devices().await.map_err(|e| classify_dbus(&e))?;

        let mut devices = Vec::new();
        for path in paths {
            let device = match NmDeviceProxy::builder(conn).path(path.clone()) {
                Ok(builder) => match builder.build().await {
                    Ok(device) => device,
                    Err(e) => {
                        debug!("Skipping device {}: {}", path.as_str(), e);
                        continue;
                    }
                },
                Err(e) => {
                    debug!("Skipping device {}: {}", path.as_str(), e);
                    continue;
                }
            };
            if device.device_type().await.unwrap_or(0) != NM_DEVICE_TYPE_WIFI {
                continue;
            }
            devices.push(WifiDevice {
                path,
                interface: device.interface().await.unwrap_or_default(),
                activated: device.state().await.unwrap_or(0) == NM_DEVICE_STATE_ACTIVATED,
            });
        }
        Ok(devices)
    }

    async fn scan(&self, conn: &Connection) -> Result<(), CommandError> {
        let devices = self.wifi_devices(conn).await?;
        if devices.is_empty() {
            return Err(CommandError::Unsupported("no Wi-Fi device".into()));
        }
        for device in devices {
            let proxy = WirelessDeviceProxy::builder(conn)
                .path(device.path)
                .map_err(|e| classify_dbus(&e))?
                .build()
                .await
                .map_err(|e| classify_dbus(&e))?;
            proxy
                .request_scan(HashMap::new())
                .await
                .map_err(|e| classify_dbus(&e))?;
        }
        Ok(())
    }

    async fn disconnect(&self, conn: &Connection) -> Result<(), CommandError> {
        let devices = self.wifi_devices(conn).await?;
        let Some(device) = devices.into_iter().find(|d| d.activated) else {
            return Err(CommandError::Unsupported("not connected to Wi-Fi".into()));
        };
        run_nmcli(&["device", "disconnect", &device.interface]).await
    }
}

impl Default for NetworkAdapter {
    fn default() -> Self {
        Self::new()
    }
}

struct WifiDevice {
    path: OwnedObjectPath,
    interface: String,
    activated: bool,
}

#[async_trait]
impl BackendAdapter for NetworkAdapter {
    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Network
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: true,
            poll: true,
            self_reports: true,
        }
    }

    async fn probe(&self) -> Availability {
        let conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!("System bus unreachable: {}", e);
                return Availability::Unavailable;
            }
        };
        let reachable = match NetworkManagerRootProxy::new(&conn).await {
            Ok(root) => root.wireless_enabled().await.is_ok(),
            Err(_) => false,
        };
        if !reachable {
            debug!("NetworkManager not running");
            return Availability::Unavailable;
        }
        if which::which("nmcli").is_err() {
            return Availability::Degraded("nmcli not found, cannot connect".into());
        }
        Availability::Available
    }

    async fn current_state(&self) -> Result<SubsystemState, CommandError> {
        let conn = self.connection().await?;
        read_state(&conn).await.map(SubsystemState::Network)
    }

    async fn subscribe(&self, sink: EventSink) -> Option<Subscription> {
        let conn = self.connection().await.ok()?;

        let stream = match properties_stream(&conn).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to listen for NetworkManager signals: {}", e);
                return None;
            }
        };

        info!("Listening for NetworkManager D-Bus signals...");
        let task = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(msg) = stream.next().await {
                if msg.is_err() {
                    continue;
                }
                match read_state(&conn).await {
                    Ok(state) => {
                        if !sink.emit(SubsystemState::Network(state)) {
                            break;
                        }
                    }
                    Err(e) => debug!("Network read after signal failed: {}", e),
                }
            }
            debug!("NetworkManager signal stream ended");
        });
        Some(Subscription::from_task(task))
    }

    async fn apply(&self, command: &Command) -> Result<(), CommandError> {
        let Command::Network(action) = command else {
            return Err(CommandError::Unsupported(format!(
                "{} is not a network command",
                command.action_name()
            )));
        };
        let conn = self.connection().await?;

        match action {
            NetworkAction::SetWifiEnabled(enabled) => {
                let root = NetworkManagerRootProxy::new(&conn)
                    .await
                    .map_err(|e| classify_dbus(&e))?;
                root.set_wireless_enabled(*enabled)
                    .await
                    .map_err(|e| classify_dbus(&e))
            }
            NetworkAction::Scan => self.scan(&conn).await,
            NetworkAction::Connect {
                ssid,
                password,
                remember,
            } => {
                let ssid = check_ssid(ssid)?;
                let password = password.as_deref();
                if *remember {
                    return run_nmcli(&remembered_args(ssid, password)).await;
                }

                // Replace any stale profile of the same name first
                if let Err(e) = run_nmcli(&["connection", "delete", "id", ssid]).await {
                    debug!("No previous profile for {}: {}", ssid, e);
                }
                run_nmcli(&temporary_args(ssid, password)).await?;
                let result = run_nmcli(&["connection", "up", "id", ssid]).await;
                if result.is_err() {
                    let _ = run_nmcli(&["connection", "delete", "id", ssid]).await;
                }
                result
            }
            NetworkAction::Disconnect => self.disconnect(&conn).await,
            NetworkAction::Forget { ssid } => {
                let ssid = check_ssid(ssid)?;
                info!("Forgetting network {}", ssid);
                run_nmcli(&["connection", "delete", "id", ssid]).await
            }
        }
    }
}

async fn properties_stream(conn: &Connection) -> zbus::Result<zbus::MessageStream> {
    let rule = zbus::MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .interface("org.freedesktop.DBus.Properties")?
        .member("PropertiesChanged")?
        .path_namespace("/org/freedesktop/NetworkManager")?
        .build();

    zbus::MessageStream::for_match_rule(rule, conn, Some(100)).await
}

async fn read_state(conn: &Connection) -> Result<NetworkState, CommandError> {
    let nm = nmrs::NetworkManager::new()
        .await
        .map_err(|e| CommandError::Unavailable(format!("NetworkManager: {}", e)))?;

    let root = NetworkManagerRootProxy::new(conn)
        .await
        .map_err(|e| classify_dbus(&e))?;
    let wifi_enabled = root.wireless_enabled().await.map_err(|e| classify_dbus(&e))?;

    let active_ssid = nm.current_ssid().await;
    let scanned = match nm.list_networks().await {
        Ok(networks) => networks
            .into_iter()
            .map(|net| (net.ssid, net.strength))
            .collect(),
        Err(e) => {
            debug!("Failed to list networks: {}", e);
            Vec::new()
        }
    };
    let security = wifi_security().await;
    let networks = merge_networks(scanned, active_ssid.as_deref(), &security);

    let connection_type = if active_ssid.is_some() {
        ConnectionType::Wifi
    } else if ethernet_active(&nm).await {
        ConnectionType::Ethernet
    } else {
        ConnectionType::None
    };

    let signal_strength = networks.iter().find(|n| n.active).and_then(|n| n.strength);

    Ok(NetworkState {
        wifi_enabled,
        connection_type,
        active_ssid,
        signal_strength,
        networks,
    })
}

async fn ethernet_active(nm: &nmrs::NetworkManager) -> bool {
    match nm.list_devices().await {
        Ok(devices) => devices.iter().any(|device| {
            device.device_type == nmrs::DeviceType::Ethernet
                && device.state == nmrs::DeviceState::Activated
        }),
        Err(e) => {
            debug!("Failed to list network devices: {}", e);
            false
        }
    }
}

/// One entry per SSID, strongest access point first. Hidden networks are dropped.
fn merge_networks(
    scanned: Vec<(String, Option<u8>)>,
    active: Option<&str>,
    security: &HashMap<String, String>,
) -> Vec<WifiNetwork> {
    let mut best: HashMap<String, Option<u8>> = HashMap::new();
    for (ssid, strength) in scanned {
        if ssid.is_empty() {
            continue;
        }
        let entry = best.entry(ssid).or_insert(strength);
        if strength > *entry {
            *entry = strength;
        }
    }

    let mut networks: Vec<WifiNetwork> = best
        .into_iter()
        .map(|(ssid, strength)| WifiNetwork {
            active: active == Some(ssid.as_str()),
            security: security.get(&ssid).cloned(),
            ssid,
            strength,
        })
        .collect();
    networks.sort_by(|a, b| {
        b.active
            .cmp(&a.active)
            .then(b.strength.cmp(&a.strength))
            .then_with(|| a.ssid.cmp(&b.ssid))
    });
    networks
}

/// Security per SSID from NetworkManager's scan cache. Best effort, empty
/// when nmcli is missing.
async fn wifi_security() -> HashMap<String, String> {
    let output = Process::new("nmcli")
        .args(["-t", "-f", "SSID,SECURITY", "device", "wifi", "list", "--rescan", "no"])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            parse_security(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            debug!("nmcli wifi list exited with {}", output.status);
            HashMap::new()
        }
        Err(e) => {
            debug!("nmcli unavailable: {}", e);
            HashMap::new()
        }
    }
}

/// Terse nmcli output escapes `:` and `\` inside fields with a backslash.
fn parse_security(output: &str) -> HashMap<String, String> {
    let mut security = HashMap::new();
    for line in output.lines() {
        let mut fields = Vec::with_capacity(2);
        let mut field = String::new();
        let mut chars = line.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => field.extend(chars.next()),
                ':' => fields.push(std::mem::take(&mut field)),
                _ => field.push(c),
            }
        }
        fields.push(field);

        let [ssid, sec] = fields.as_slice() else {
            continue;
        };
        if ssid.is_empty() {
            continue;
        }
        let sec = sec.trim();
        let sec = if sec.is_empty() { "none" } else { sec };
        security.entry(ssid.clone()).or_insert_with(|| sec.to_string());
    }
    security
}

fn check_ssid(ssid: &str) -> Result<&str, CommandError> {
    let ssid = ssid.trim();
    if ssid.is_empty() {
        return Err(CommandError::Rejected("empty SSID".into()));
    }
    Ok(ssid)
}

/// Saved profile, created or reused by NetworkManager.
fn remembered_args<'a>(ssid: &'a str, password: Option<&'a str>) -> Vec<&'a str> {
    let mut args = vec!["device", "wifi", "connect", ssid];
    if let Some(pw) = password {
        args.extend(["password", pw]);
    }
    args
}

/// In-memory profile named after the SSID.
fn temporary_args<'a>(ssid: &'a str, password: Option<&'a str>) -> Vec<&'a str> {
    let mut args = vec![
        "connection", "add", "type", "wifi", "con-name", ssid, "ssid", ssid, "save", "no",
    ];
    if let Some(pw) = password {
        args.extend(["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk", pw]);
    }
    args
}

async fn run_nmcli(args: &[&str]) -> Result<(), CommandError> {
    debug!("nmcli {}", redact(args).join(" "));
    let output = Process::new("nmcli")
        .args(args)
        .output()
        .await
        .map_err(|e| classify_io(&e, "nmcli"))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(nmcli_failure(stderr.trim()))
}

fn nmcli_failure(stderr: &str) -> CommandError {
    let lower = stderr.to_lowercase();
    if lower.contains("not authorized") || lower.contains("insufficient privileges") {
        CommandError::Degraded(stderr.to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") {
        CommandError::Transient(stderr.to_string())
    } else if lower.contains("no network with ssid") {
        CommandError::Unsupported(stderr.to_string())
    } else {
        CommandError::Rejected(stderr.to_string())
    }
}

/// Hide the value after `password` or `wifi-sec.psk` in logged arguments.
fn redact<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("****");
            hide_next = false;
        } else {
            hide_next = matches!(*arg, "password" | "wifi-sec.psk");
            out.push(*arg);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strongest_access_point_wins() {
        let scanned = vec![
            ("home".to_string(), Some(40)),
            ("home".to_string(), Some(72)),
            ("cafe".to_string(), Some(90)),
            (String::new(), Some(99)),
        ];
        let networks = merge_networks(scanned, Some("home"), &HashMap::new());

        assert_eq!(networks.len(), 2);
        assert_eq!(networks[0].ssid, "home");
        assert!(networks[0].active);
        assert_eq!(networks[0].strength, Some(72));
        assert_eq!(networks[1].ssid, "cafe");
        assert!(!networks[1].active);
    }

    #[test]
    fn inactive_networks_sorted_by_strength() {
        let scanned = vec![
            ("b".to_string(), Some(20)),
            ("a".to_string(), None),
            ("c".to_string(), Some(80)),
        ];
        let ssids: Vec<_> = merge_networks(scanned, None, &HashMap::new())
            .into_iter()
            .map(|n| n.ssid)
            .collect();
        assert_eq!(ssids, vec!["c", "b", "a"]);
    }

    #[test]
    fn security_is_attached_per_ssid() {
        let security = parse_security("home:WPA2\ncafe:\nlab\\:3:WPA1 WPA2 802.1X\n:WPA2\n");
        assert_eq!(security.get("home").map(String::as_str), Some("WPA2"));
        assert_eq!(security.get("cafe").map(String::as_str), Some("none"));
        assert_eq!(
            security.get("lab:3").map(String::as_str),
            Some("WPA1 WPA2 802.1X")
        );
        assert_eq!(security.len(), 3);

        let scanned = vec![("home".to_string(), Some(50)), ("guest".to_string(), Some(10))];
        let networks = merge_networks(scanned, None, &security);
        assert_eq!(networks[0].security.as_deref(), Some("WPA2"));
        assert_eq!(networks[1].security, None);
    }

    #[test]
    fn temporary_profile_is_not_saved() {
        let args = temporary_args("cafe", Some("latte"));
        assert_eq!(
            &args[..10],
            &["connection", "add", "type", "wifi", "con-name", "cafe", "ssid", "cafe", "save", "no"]
        );
        assert_eq!(redact(&args).last(), Some(&"****"));

        let open = temporary_args("cafe", None);
        assert!(!open.contains(&"wifi-sec.psk"));
        assert_eq!(remembered_args("home", None), vec!["device", "wifi", "connect", "home"]);
    }

    #[test]
    fn blank_ssid_is_rejected() {
        assert!(matches!(check_ssid("   "), Err(CommandError::Rejected(_))));
        assert_eq!(check_ssid(" home ").unwrap(), "home");
    }

    #[test]
    fn password_is_not_logged() {
        let args = ["device", "wifi", "connect", "home", "password", "hunter2"];
        assert_eq!(
            redact(&args),
            vec!["device", "wifi", "connect", "home", "password", "****"]
        );
    }

    #[test]
    fn nmcli_errors_are_classified() {
        assert!(matches!(
            nmcli_failure("Error: No network with SSID 'x' found."),
            CommandError::Unsupported(_)
        ));
        assert!(matches!(
            nmcli_failure("Error: Connection activation failed: Secrets were required"),
            CommandError::Rejected(_)
        ));
        assert!(matches!(
            nmcli_failure("Error: Timeout expired (90 seconds)"),
            CommandError::Transient(_)
        ));
    }
}
