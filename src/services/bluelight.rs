//! Blue-light filter via gammastep.
//!
//! gammastep has no control interface, so the filter is a one-shot
//! `gammastep -O <kelvin>` process. On Wayland it stays alive for as long as
//! the filter is on; on X11 it sets the gamma ramp and exits 0, leaving the
//! filter applied until `gammastep -x` resets it. Stray instances (started by
//! an earlier session or by hand) are killed with pkill before a new one is
//! spawned.

use super::classify_io;
use async_trait::async_trait;
use ctl_core::{
    Availability, BackendAdapter, BlueLightAction, BlueLightState, Capabilities, Command,
    CommandError, SubsystemKind, SubsystemState,
};
use log::{debug, info, warn};
use std::ops::RangeInclusive;
use std::process::Stdio;
use tokio::process::{Child, Command as Process};
use tokio::sync::Mutex;

const GAMMASTEP: &str = "gammastep";
const PKILL: &str = "pkill";

pub const TEMPERATURE_RANGE: RangeInclusive<u32> = 1000..=25000;
pub const DEFAULT_TEMPERATURE: u32 = 6500;

struct Filter {
    child: Option<Child>,
    /// Set by the last successful action, cleared when gammastep fails.
    enabled: bool,
    temperature: u32,
}

impl Filter {
    fn enabled(&mut self) -> bool {
        match self.child.as_mut().map(|c| c.try_wait()) {
            Some(Ok(Some(status))) => {
                debug!("gammastep exited: {}", status);
                self.child = None;
                self.enabled = exit_keeps_filter(status.code());
            }
            Some(Err(e)) => warn!("Failed to query gammastep: {}", e),
            Some(Ok(None)) | None => {}
        }
        self.enabled
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("gammastep already gone: {}", e);
            }
        }
        self.enabled = false;
    }
}

/// X11 one-shot mode exits 0 with the ramp still applied. Anything else
/// (no display, killed by a signal) leaves the screen unfiltered.
fn exit_keeps_filter(code: Option<i32>) -> bool {
    code == Some(0)
}

pub struct BlueLightAdapter {
    filter: Mutex<Filter>,
}

impl BlueLightAdapter {
    pub fn new() -> Self {
        Self {
            filter: Mutex::new(Filter {
                child: None,
                enabled: false,
                temperature: DEFAULT_TEMPERATURE,
            }),
        }
    }
}

impl Default for BlueLightAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for BlueLightAdapter {
    fn kind(&self) -> SubsystemKind {
        SubsystemKind::BlueLight
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: false,
            poll: true,
            self_reports: false,
        }
    }

    async fn probe(&self) -> Availability {
        if which::which(GAMMASTEP).is_err() {
            return Availability::Unavailable;
        }
        if which::which(PKILL).is_err() {
            return Availability::Degraded("pkill not found, stray filters are not cleared".into());
        }
        Availability::Available
    }

    async fn current_state(&self) -> Result<SubsystemState, CommandError> {
        let mut filter = self.filter.lock().await;
        Ok(SubsystemState::BlueLight(BlueLightState {
            enabled: filter.enabled(),
            temperature: filter.temperature,
        }))
    }

    async fn apply(&self, command: &Command) -> Result<(), CommandError> {
        let Command::BlueLight(action) = command else {
            return Err(CommandError::Unsupported(format!(
                "{} is not a blue-light command",
                command.action_name()
            )));
        };

        let mut filter = self.filter.lock().await;
        match action {
            BlueLightAction::SetTemperature(kelvin) => {
                let kelvin = check_temperature(*kelvin)?;
                filter.stop().await;
                kill_strays().await;

                let child = Process::new(GAMMASTEP)
                    .args(gammastep_args(kelvin))
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| classify_io(&e, GAMMASTEP))?;

                info!("Blue-light filter on at {}K", kelvin);
                filter.child = Some(child);
                filter.enabled = true;
                filter.temperature = kelvin;
                Ok(())
            }
            BlueLightAction::Disable => {
                filter.stop().await;
                kill_strays().await;
                reset_gamma().await;
                info!("Blue-light filter off");
                Ok(())
            }
        }
    }
}

fn check_temperature(kelvin: u32) -> Result<u32, CommandError> {
    if TEMPERATURE_RANGE.contains(&kelvin) {
        Ok(kelvin)
    } else {
        Err(CommandError::Rejected(format!(
            "{}K is outside {}..={}K",
            kelvin,
            TEMPERATURE_RANGE.start(),
            TEMPERATURE_RANGE.end()
        )))
    }
}

/// Clears a ramp left behind by an exited one-shot process.
async fn reset_gamma() {
    match Process::new(GAMMASTEP)
        .arg("-x")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("{} -x exited with {}", GAMMASTEP, status),
        Err(e) => debug!("Failed to reset gamma: {}", e),
    }
}

fn gammastep_args(kelvin: u32) -> [String; 2] {
    ["-O".to_string(), kelvin.to_string()]
}

/// Best effort. A missing pkill only leaves older filters running.
async fn kill_strays() {
    match Process::new(PKILL)
        .args(["-x", GAMMASTEP])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        // 1 means nothing matched
        Ok(status) if status.success() || status.code() == Some(1) => {}
        Ok(status) => debug!("pkill {} exited with {}", GAMMASTEP, status),
        Err(e) => debug!("pkill unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_outside_range_is_rejected() {
        assert_eq!(check_temperature(4500).unwrap(), 4500);
        assert_eq!(check_temperature(1000).unwrap(), 1000);
        assert_eq!(check_temperature(25000).unwrap(), 25000);
        assert!(matches!(check_temperature(999), Err(CommandError::Rejected(_))));
        assert!(matches!(
            check_temperature(30000),
            Err(CommandError::Rejected(_))
        ));
    }

    #[test]
    fn one_shot_mode_arguments() {
        assert_eq!(gammastep_args(3400), ["-O".to_string(), "3400".to_string()]);
    }

    #[test]
    fn clean_exit_keeps_filter_applied() {
        assert!(exit_keeps_filter(Some(0)));
        assert!(!exit_keeps_filter(Some(1)));
        // Terminated by a signal
        assert!(!exit_keeps_filter(None));
    }

    #[tokio::test]
    async fn exited_one_shot_still_reports_enabled() {
        let adapter = BlueLightAdapter::new();
        {
            let mut filter = adapter.filter.lock().await;
            let child = Process::new("true")
                .stdout(Stdio::null())
                .spawn()
                .expect("spawn true");
            filter.child = Some(child);
            filter.enabled = true;
            filter.temperature = 4000;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let state = adapter.current_state().await.unwrap();
        assert_eq!(
            state.as_blue_light(),
            Some(&BlueLightState {
                enabled: true,
                temperature: 4000,
            })
        );
    }

    #[tokio::test]
    async fn failed_one_shot_reports_disabled() {
        let adapter = BlueLightAdapter::new();
        {
            let mut filter = adapter.filter.lock().await;
            let child = Process::new("false")
                .stdout(Stdio::null())
                .spawn()
                .expect("spawn false");
            filter.child = Some(child);
            filter.enabled = true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let state = adapter.current_state().await.unwrap();
        assert!(!state.as_blue_light().unwrap().enabled);
    }

    #[tokio::test]
    async fn starts_disabled_at_daylight_temperature() {
        let adapter = BlueLightAdapter::new();
        let state = adapter.current_state().await.unwrap();
        assert_eq!(
            state.as_blue_light(),
            Some(&BlueLightState {
                enabled: false,
                temperature: DEFAULT_TEMPERATURE,
            })
        );
    }

    #[tokio::test]
    async fn invalid_temperature_leaves_state_untouched() {
        let adapter = BlueLightAdapter::new();
        let err = adapter
            .apply(&Command::BlueLight(BlueLightAction::SetTemperature(50)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "rejected");

        let state = adapter.current_state().await.unwrap();
        assert_eq!(state.as_blue_light().unwrap().temperature, DEFAULT_TEMPERATURE);
    }

    #[tokio::test]
    async fn foreign_commands_are_unsupported() {
        let adapter = BlueLightAdapter::new();
        let err = adapter
            .apply(&Command::Power(ctl_core::PowerAction::SetProfile("balanced".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Unsupported(_)));
    }
}
