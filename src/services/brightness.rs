//! Backlight brightness adapter.
//!
//! - Discovers a backlight device in `/sys/class/backlight`
//! - Uses systemd-logind D-Bus API (`SetBrightness`) for setting brightness
//! - Falls back to direct sysfs writes if logind is unavailable
//!
//! The kernel does not signal brightness changes we can subscribe to
//! cheaply, so this adapter is poll-only. sysfs access blocks, so it runs
//! on the blocking pool.

use super::{classify_dbus, classify_io};
use async_trait::async_trait;
use ctl_core::{
    Availability, BackendAdapter, BrightnessAction, BrightnessState, Capabilities, Command,
    CommandError, SubsystemKind, SubsystemState,
};
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use zbus::Connection;
use zbus::zvariant::OwnedObjectPath;

const BACKLIGHT_PATH: &str = "/sys/class/backlight";
const LOGIND_AUTO_SESSION: &str = "/org/freedesktop/login1/session/auto";

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LogindManager {
    #[zbus(name = "GetSessionByPID")]
    fn get_session_by_pid(&self, pid: u32) -> zbus::Result<OwnedObjectPath>;
}

#[zbus::proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1"
)]
trait LogindSession {
    fn set_brightness(&self, subsystem: &str, name: &str, brightness: u32) -> zbus::Result<()>;
}

/// A sysfs backlight device.
#[derive(Clone, Debug, PartialEq)]
struct BacklightDevice {
    /// Directory name under /sys/class/backlight.
    name: String,
    brightness_path: PathBuf,
    max_brightness_raw: u32,
}

pub struct BrightnessAdapter {
    base: PathBuf,
    logind: OnceCell<Option<(Connection, OwnedObjectPath)>>,
}

impl BrightnessAdapter {
    pub fn new() -> Self {
        Self::with_base(BACKLIGHT_PATH)
    }

    fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            logind: OnceCell::new(),
        }
    }

    async fn device(&self) -> Result<BacklightDevice, CommandError> {
        let base = self.base.clone();
        sysfs(move || Ok(discover_backlight(&base)))
            .await?
            .ok_or_else(|| CommandError::Unavailable("no backlight device".into()))
    }

    /// Logind session used for privilege-free writes, resolved once.
    async fn logind(&self) -> Option<(Connection, OwnedObjectPath)> {
        self.logind
            .get_or_init(|| async {
                match pick_logind_session().await {
                    Ok(found) => {
                        debug!("Using logind session {} for brightness", found.1.as_str());
                        Some(found)
                    }
                    Err(e) => {
                        warn!(
                            "No usable logind session ({}), falling back to direct sysfs writes",
                            e
                        );
                        None
                    }
                }
            })
            .await
            .clone()
    }

    async fn set_via_logind(
        &self,
        device: &BacklightDevice,
        raw: u32,
    ) -> Option<Result<(), CommandError>> {
        let (conn, path) = self.logind().await?;
        let session = match LogindSessionProxy::builder(&conn).path(path) {
            Ok(builder) => builder.build().await,
            Err(e) => Err(e),
        };
        let result = match session {
            Ok(session) => session.set_brightness("backlight", &device.name, raw).await,
            Err(e) => Err(e),
        };
        Some(result.map_err(|e| classify_dbus(&e)))
    }
}

impl Default for BrightnessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for BrightnessAdapter {
    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Brightness
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: false,
            poll: true,
            self_reports: false,
        }
    }

    async fn probe(&self) -> Availability {
        let Ok(device) = self.device().await else {
            debug!("No backlight device under {}", self.base.display());
            return Availability::Unavailable;
        };
        let path = device.brightness_path.clone();
        let writable = sysfs(move || Ok(is_writable(&path))).await.unwrap_or(false);
        if self.logind().await.is_some() || writable {
            Availability::Available
        } else {
            Availability::Degraded(format!(
                "{} is read-only and logind is unavailable",
                device.name
            ))
        }
    }

    async fn current_state(&self) -> Result<SubsystemState, CommandError> {
        let device = self.device().await?;
        let path = device.brightness_path.clone();
        let raw = sysfs(move || {
            read_u32(&path).map_err(|e| classify_io(&e, &path.display().to_string()))
        })
        .await?;
        Ok(SubsystemState::Brightness(BrightnessState {
            percent: raw_to_percent(raw, device.max_brightness_raw),
            device: device.name,
        }))
    }

    async fn apply(&self, command: &Command) -> Result<(), CommandError> {
        let Command::Brightness(BrightnessAction::Set(percent)) = command else {
            return Err(CommandError::Unsupported(format!(
                "{} is not a brightness command",
                command.action_name()
            )));
        };
        let device = self.device().await?;
        let raw = percent_to_raw(*percent, device.max_brightness_raw);
        debug!("Setting {} to {} ({}%)", device.name, raw, percent);

        // Try logind first (privilege-safe), fall back to direct sysfs.
        match self.set_via_logind(&device, raw).await {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => {
                warn!("logind SetBrightness failed ({}), writing sysfs", e);
                write_sysfs(device, raw).await
            }
            None => write_sysfs(device, raw).await,
        }
    }
}

async fn pick_logind_session() -> zbus::Result<(Connection, OwnedObjectPath)> {
    let conn = Connection::system().await?;
    let manager = LogindManagerProxy::new(&conn).await?;
    let path = match manager.get_session_by_pid(std::process::id()).await {
        Ok(path) => path,
        Err(e) => {
            debug!("GetSessionByPID failed ({}), using the caller's session", e);
            OwnedObjectPath::try_from(LOGIND_AUTO_SESSION)?
        }
    };
    Ok((conn, path))
}

/// Run a sysfs access on the blocking pool.
async fn sysfs<T, F>(f: F) -> Result<T, CommandError>
where
    F: FnOnce() -> Result<T, CommandError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CommandError::Transient(format!("sysfs worker failed: {}", e)))?
}

async fn write_sysfs(device: BacklightDevice, raw: u32) -> Result<(), CommandError> {
    sysfs(move || {
        fs::write(&device.brightness_path, raw.to_string())
            .map_err(|e| classify_io(&e, &device.brightness_path.display().to_string()))
    })
    .await
}

fn discover_backlight(base: &Path) -> Option<BacklightDevice> {
    let entries = match fs::read_dir(base) {
        Ok(it) => it,
        Err(e) => {
            debug!("Failed to read {}: {}", base.display(), e);
            return None;
        }
    };

    let mut devices: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();

    // Prefer GPU-native interfaces over the generic ACPI one
    devices.sort_by_key(|p| {
        let name = p
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        (backlight_rank(&name), name)
    });

    for device in devices {
        let brightness_path = device.join("brightness");
        let max_brightness_path = device.join("max_brightness");
        if !brightness_path.exists() || !max_brightness_path.exists() {
            continue;
        }

        let name = device
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let max_brightness_raw = match read_u32(&max_brightness_path) {
            Ok(v) if v > 0 => v,
            Ok(_) => {
                warn!("max_brightness for {} is zero; skipping", name);
                continue;
            }
            Err(e) => {
                warn!("Failed to read max_brightness for {}: {}", name, e);
                continue;
            }
        };

        return Some(BacklightDevice {
            name,
            brightness_path,
            max_brightness_raw,
        });
    }

    None
}

fn backlight_rank(name: &str) -> u8 {
    if name.contains("intel") {
        0
    } else if name.contains("amd") {
        1
    } else if name.contains("acpi") {
        2
    } else {
        3
    }
}

fn read_u32(path: &Path) -> std::io::Result<u32> {
    let text = fs::read_to_string(path)?;
    text.trim()
        .parse::<u32>()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn is_writable(path: &Path) -> bool {
    OpenOptions::new().write(true).open(path).is_ok()
}

fn raw_to_percent(raw: u32, max: u32) -> u32 {
    if max == 0 {
        return 0;
    }
    ((raw.min(max) as f64) * 100.0 / max as f64).round() as u32
}

fn percent_to_raw(percent: u32, max: u32) -> u32 {
    ((percent.min(100) as f64) * max as f64 / 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(tag: &str) -> PathBuf {
        let base = std::env::temp_dir().join(format!(
            "control-panel-backlight-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn add_device(base: &Path, name: &str, brightness: u32, max: u32) {
        let dir = base.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("brightness"), format!("{}\n", brightness)).unwrap();
        fs::write(dir.join("max_brightness"), format!("{}\n", max)).unwrap();
    }

    #[test]
    fn percent_round_trips_through_raw() {
        assert_eq!(raw_to_percent(0, 255), 0);
        assert_eq!(raw_to_percent(255, 255), 100);
        assert_eq!(raw_to_percent(percent_to_raw(40, 19393), 19393), 40);
        assert_eq!(raw_to_percent(10, 0), 0);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(percent_to_raw(250, 1000), 1000);
        assert_eq!(raw_to_percent(5000, 1000), 100);
    }

    #[test]
    fn gpu_backlight_preferred_over_acpi() {
        let base = fake_sysfs("rank");
        add_device(&base, "acpi_video0", 5, 10);
        add_device(&base, "intel_backlight", 600, 1200);

        let device = discover_backlight(&base).unwrap();
        assert_eq!(device.name, "intel_backlight");
        assert_eq!(device.max_brightness_raw, 1200);

        fs::remove_dir_all(&base).unwrap();
    }

    #[test]
    fn zero_max_brightness_is_skipped() {
        let base = fake_sysfs("zero");
        add_device(&base, "amdgpu_bl0", 0, 0);
        add_device(&base, "acpi_video0", 3, 10);

        assert_eq!(discover_backlight(&base).unwrap().name, "acpi_video0");

        fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn reads_state_from_sysfs() {
        let base = fake_sysfs("state");
        add_device(&base, "intel_backlight", 300, 1200);

        let adapter = BrightnessAdapter::with_base(&base);
        let state = adapter.current_state().await.unwrap();
        assert_eq!(
            state.as_brightness(),
            Some(&BrightnessState {
                device: "intel_backlight".into(),
                percent: 25,
            })
        );

        fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sysfs_write_lands() {
        let base = fake_sysfs("write");
        add_device(&base, "intel_backlight", 300, 1200);

        let device = discover_backlight(&base).unwrap();
        write_sysfs(device, 900).await.unwrap();

        let adapter = BrightnessAdapter::with_base(&base);
        let state = adapter.current_state().await.unwrap();
        assert_eq!(state.as_brightness().unwrap().percent, 75);

        fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn missing_backlight_is_unavailable() {
        let adapter = BrightnessAdapter::with_base("/nonexistent/backlight");
        assert_eq!(adapter.probe().await, Availability::Unavailable);
        assert!(matches!(
            adapter.current_state().await,
            Err(CommandError::Unavailable(_))
        ));
    }
}
