//! Bluetooth adapter using BlueZ.
//!
//! Queries and controls the default adapter with bluer and listens for BlueZ
//! PropertiesChanged signals over zbus. Discovery stays active for as long as
//! the discovery stream is held by a background task. Connecting a headset
//! or speaker moves audio output onto it.

use super::audio;
use async_trait::async_trait;
use bluer::{Address, ErrorKind, Session};
use ctl_core::{
    Availability, BackendAdapter, Capabilities, Command, CommandError, EventSink,
    BluetoothAction, BluetoothDevice, BluetoothState, Subscription, SubsystemKind,
    SubsystemState,
};
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::sync::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

pub struct BluetoothAdapter {
    session: OnceCell<Session>,
    discovery: Mutex<Option<JoinHandle<()>>>,
}

impl BluetoothAdapter {
    pub fn new() -> Self {
        Self {
            session: OnceCell::new(),
            discovery: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<Session, CommandError> {
        self.session
            .get_or_try_init(Session::new)
            .await
            .cloned()
            .map_err(|e| classify_bluer(&e))
    }

    async fn adapter(&self) -> Result<bluer::Adapter, CommandError> {
        let session = self.session().await?;
        session
            .default_adapter()
            .await
            .map_err(|e| classify_bluer(&e))
    }

    async fn start_discovery(&self) -> Result<(), CommandError> {
        if self.discovery_running() {
            return Ok(());
        }
        let adapter = self.adapter().await?;
        let events = adapter
            .discover_devices()
            .await
            .map_err(|e| classify_bluer(&e))?;

        info!("Bluetooth discovery started");
        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                debug!("Discovery event: {:?}", event);
            }
            debug!("Discovery stream ended");
        });
        if let Ok(mut guard) = self.discovery.lock() {
            *guard = Some(task);
        }
        Ok(())
    }

    fn stop_discovery(&self) {
        let task = self.discovery.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            task.abort();
            info!("Bluetooth discovery stopped");
        }
    }

    fn discovery_running(&self) -> bool {
        self.discovery
            .lock()
            .map(|guard| guard.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}

impl Default for BluetoothAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BluetoothAdapter {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}

#[async_trait]
impl BackendAdapter for BluetoothAdapter {
    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Bluetooth
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: true,
            poll: true,
            self_reports: true,
        }
    }

    async fn probe(&self) -> Availability {
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                debug!("Failed to create BlueZ session: {}", e);
                return Availability::Unavailable;
            }
        };
        let err = match session.default_adapter().await {
            Ok(_) => return Availability::Available,
            Err(e) => e,
        };
        debug!("No default Bluetooth adapter: {}", err);
        match session.adapter_names().await {
            Ok(names) if !names.is_empty() => Availability::Available,
            Ok(_) => Availability::Unavailable,
            Err(e) => {
                debug!("Failed to list Bluetooth adapters: {}", e);
                availability_for(&classify_bluer(&err))
            }
        }
    }

    async fn current_state(&self) -> Result<SubsystemState, CommandError> {
        let adapter = self.adapter().await?;
        Ok(SubsystemState::Bluetooth(read_state(&adapter).await))
    }

    async fn subscribe(&self, sink: EventSink) -> Option<Subscription> {
        let session = self.session().await.ok()?;

        let stream = match bluez_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to listen for BlueZ signals: {}", e);
                return None;
            }
        };

        info!("Listening for BlueZ D-Bus signals...");
        let task = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(msg) = stream.next().await {
                if msg.is_err() {
                    continue;
                }
                // Any BlueZ property change triggers a full read
                let adapter = match session.default_adapter().await {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        debug!("Default adapter gone: {}", e);
                        continue;
                    }
                };
                let state = read_state(&adapter).await;
                if !sink.emit(SubsystemState::Bluetooth(state)) {
                    break;
                }
            }
            debug!("BlueZ signal stream ended");
        });
        Some(Subscription::from_task(task))
    }

    async fn apply(&self, command: &Command) -> Result<(), CommandError> {
        let Command::Bluetooth(action) = command else {
            return Err(CommandError::Unsupported(format!(
                "{} is not a Bluetooth command",
                command.action_name()
            )));
        };

        match action {
            BluetoothAction::SetPowered(on) => {
                let adapter = self.adapter().await?;
                if !on {
                    self.stop_discovery();
                }
                adapter
                    .set_powered(*on)
                    .await
                    .map_err(|e| classify_bluer(&e))
            }
            BluetoothAction::StartDiscovery => self.start_discovery().await,
            BluetoothAction::StopDiscovery => {
                self.stop_discovery();
                Ok(())
            }
            BluetoothAction::Connect { address } => {
                let device = self.adapter().await?.device(parse_address(address)?);
                let device = device.map_err(|e| classify_bluer(&e))?;
                device.connect().await.map_err(|e| classify_bluer(&e))?;

                let plays_audio = match device.uuids().await {
                    Ok(Some(uuids)) => uuids.iter().any(|u| is_audio_sink_profile(&u.to_string())),
                    _ => false,
                };
                if plays_audio {
                    let address = address.clone();
                    tokio::spawn(async move {
                        match audio::route_to_bluetooth(&address).await {
                            Ok(true) => {}
                            Ok(false) => debug!("No audio sink appeared for {}", address),
                            Err(e) => warn!("Failed to route audio to {}: {}", address, e),
                        }
                    });
                }
                Ok(())
            }
            BluetoothAction::Disconnect { address } => {
                let device = self.adapter().await?.device(parse_address(address)?);
                let device = device.map_err(|e| classify_bluer(&e))?;
                device.disconnect().await.map_err(|e| classify_bluer(&e))
            }
        }
    }
}

async fn bluez_stream() -> zbus::Result<zbus::MessageStream> {
    let connection = zbus::Connection::system().await?;

    let rule = zbus::MatchRule::builder()
        .msg_type(zbus::message::Type::Signal)
        .interface("org.freedesktop.DBus.Properties")?
        .member("PropertiesChanged")?
        .path_namespace("/org/bluez")?
        .build();

    zbus::MessageStream::for_match_rule(rule, &connection, Some(100)).await
}

async fn read_state(adapter: &bluer::Adapter) -> BluetoothState {
    let powered = adapter.is_powered().await.unwrap_or(false);
    let discovering = adapter.is_discovering().await.unwrap_or(false);
    let adapter_name = adapter.alias().await.ok();

    let mut devices = Vec::new();
    if let Ok(addresses) = adapter.device_addresses().await {
        for address in addresses {
            let Ok(device) = adapter.device(address) else {
                continue;
            };
            devices.push(BluetoothDevice {
                address: address.to_string(),
                name: device.alias().await.ok(),
                paired: device.is_paired().await.unwrap_or(false),
                connected: device.is_connected().await.unwrap_or(false),
                battery: device.battery_percentage().await.ok().flatten(),
            });
        }
    }
    sort_devices(&mut devices);

    debug!(
        "Bluetooth update: powered={}, connected={}, discovering={}",
        powered,
        devices.iter().filter(|d| d.connected).count(),
        discovering
    );

    BluetoothState {
        powered,
        discovering,
        adapter_name,
        devices,
    }
}

/// Connected first, then paired, then by name.
fn sort_devices(devices: &mut [BluetoothDevice]) {
    devices.sort_by(|a, b| {
        b.connected
            .cmp(&a.connected)
            .then(b.paired.cmp(&a.paired))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.address.cmp(&b.address))
    });
}

fn parse_address(address: &str) -> Result<Address, CommandError> {
    address
        .parse::<Address>()
        .map_err(|_| CommandError::Rejected(format!("invalid Bluetooth address '{}'", address)))
}

/// A2DP sink or hands-free audio gateway, lowercase hyphenated form.
fn is_audio_sink_profile(uuid: &str) -> bool {
    const AUDIO_PROFILES: [&str; 3] = [
        "0000110b-0000-1000-8000-00805f9b34fb", // A2DP sink
        "0000111e-0000-1000-8000-00805f9b34fb", // Hands-free
        "00001108-0000-1000-8000-00805f9b34fb", // Headset
    ];
    AUDIO_PROFILES.contains(&uuid.to_ascii_lowercase().as_str())
}

/// A missing or unauthorized daemon is a probe result, not a failure.
fn availability_for(err: &CommandError) -> Availability {
    match err {
        CommandError::Degraded(reason) => Availability::Degraded(reason.clone()),
        _ => Availability::Unavailable,
    }
}

fn classify_bluer(err: &bluer::Error) -> CommandError {
    let reason = err.to_string();
    if bluez_missing(&format!("{:?} {}", err.kind, reason)) {
        return CommandError::Unavailable(reason);
    }
    classify_kind(&err.kind, reason)
}

/// bluetoothd is not on the bus at all.
fn bluez_missing(detail: &str) -> bool {
    ["ServiceUnknown", "NameHasNoOwner", "was not provided by any .service files"]
        .iter()
        .any(|marker| detail.contains(marker))
}

fn classify_kind(kind: &ErrorKind, reason: String) -> CommandError {
    match kind {
        ErrorKind::NotReady | ErrorKind::InProgress => CommandError::Transient(reason),
        ErrorKind::NotFound | ErrorKind::DoesNotExist => CommandError::Unavailable(reason),
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => CommandError::Degraded(reason),
        ErrorKind::NotSupported | ErrorKind::NotAvailable => CommandError::Unsupported(reason),
        _ => CommandError::Rejected(reason),
    }
}
