//! Audio adapter using PulseAudio/PipeWire.
//!
//! Uses libpulse-binding which works with both PulseAudio and PipeWire
//! (via pipewire-pulse compatibility layer).
//!
//! libpulse contexts are not thread-safe, so every read and write runs on a
//! blocking thread with its own short-lived connection. Push notifications
//! come from one long-lived monitor thread subscribed to server events.
//!
//! [`route_to_bluetooth`] lets the Bluetooth adapter move audio onto a
//! headset once its sink appears.

use async_trait::async_trait;
use ctl_core::{
    AudioAction, AudioDevice, AudioState, AudioStream, Availability, BackendAdapter, Capabilities,
    Command, CommandError, EventSink, Subscription, SubsystemKind, SubsystemState,
};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::subscribe::{Facility, InterestMaskSet};
use libpulse_binding::context::{Context, FlagSet, State as ContextState};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::operation::{Operation, State as OperationState};
use libpulse_binding::proplist::Proplist;
use libpulse_binding::volume::{ChannelVolumes, Volume};
use log::{debug, error, info, warn};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Upper bound for any volume we set, in percent.
pub const MAX_VOLUME_PERCENT: u32 = 150;

const DEFAULT_SINK: &str = "@DEFAULT_SINK@";
const DEFAULT_SOURCE: &str = "@DEFAULT_SOURCE@";
const MONITOR_READY_TIMEOUT: Duration = Duration::from_secs(2);
/// A Bluetooth sink shows up a moment after the device connects.
const SINK_WAIT_ATTEMPTS: u32 = 10;
const SINK_WAIT_INTERVAL: Duration = Duration::from_millis(500);

pub struct AudioAdapter;

impl AudioAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AudioAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendAdapter for AudioAdapter {
    fn kind(&self) -> SubsystemKind {
        SubsystemKind::Audio
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            push: true,
            poll: true,
            self_reports: true,
        }
    }

    async fn probe(&self) -> Availability {
        match with_pulse(|_| Ok(())).await {
            Ok(()) => Availability::Available,
            Err(e) => {
                debug!("Audio server unreachable: {}", e);
                Availability::Unavailable
            }
        }
    }

    async fn current_state(&self) -> Result<SubsystemState, CommandError> {
        with_pulse(|pulse| pulse.read_state())
            .await
            .map(SubsystemState::Audio)
    }

    async fn subscribe(&self, sink: EventSink) -> Option<Subscription> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let spawned = thread::Builder::new()
            .name("audio-monitor".into())
            .spawn(move || run_monitor(sink, thread_stop, ready_tx));
        if let Err(e) = spawned {
            warn!("Failed to start audio monitor thread: {}", e);
            return None;
        }

        let ready = tokio::task::spawn_blocking(move || {
            ready_rx.recv_timeout(MONITOR_READY_TIMEOUT).unwrap_or(false)
        })
        .await
        .unwrap_or(false);

        if !ready {
            stop.store(true, Ordering::SeqCst);
            return None;
        }
        // The monitor notices on the next server event and exits.
        Some(Subscription::new(move || stop.store(true, Ordering::SeqCst)))
    }

    async fn apply(&self, command: &Command) -> Result<(), CommandError> {
        let Command::Audio(action) = command else {
            return Err(CommandError::Unsupported(format!(
                "{} is not an audio command",
                command.action_name()
            )));
        };
        let action = action.clone();
        with_pulse(move |pulse| pulse.apply(&action)).await
    }
}

/// Run `f` against a fresh server connection on a blocking thread.
async fn with_pulse<T, F>(f: F) -> Result<T, CommandError>
where
    F: FnOnce(&mut Pulse) -> Result<T, CommandError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut pulse = Pulse::connect("Control Panel")?;
        f(&mut pulse)
    })
    .await
    .map_err(|e| CommandError::Transient(format!("audio worker failed: {}", e)))?
}

/// A connected mainloop and context pair.
struct Pulse {
    ml: Mainloop,
    ctx: Context,
}

impl Pulse {
    fn connect(name: &str) -> Result<Self, CommandError> {
        let offline = |what: &str| CommandError::Unavailable(format!("audio server: {}", what));

        let mut ml = Mainloop::new().ok_or_else(|| offline("failed to create mainloop"))?;
        let mut ctx = Context::new(&ml, name).ok_or_else(|| offline("failed to create context"))?;

        ctx.connect(None, FlagSet::NOFLAGS, None)
            .map_err(|e| offline(&format!("failed to connect: {:?}", e)))?;

        // Wait for context to be ready
        loop {
            match ml.iterate(true) {
                IterateResult::Quit(_) => return Err(offline("mainloop quit during connect")),
                IterateResult::Err(e) => return Err(offline(&format!("mainloop error: {:?}", e))),
                IterateResult::Success(_) => {}
            }

            match ctx.get_state() {
                ContextState::Ready => break,
                ContextState::Failed | ContextState::Terminated => {
                    return Err(offline("context connection failed"));
                }
                _ => continue,
            }
        }

        Ok(Self { ml, ctx })
    }

    /// Iterate until `op` completes.
    fn wait<C: ?Sized>(&mut self, op: Operation<C>) -> Result<(), CommandError> {
        loop {
            match op.get_state() {
                OperationState::Done => return Ok(()),
                OperationState::Cancelled => {
                    return Err(CommandError::Transient("audio operation cancelled".into()));
                }
                OperationState::Running => {}
            }
            if let IterateResult::Quit(_) | IterateResult::Err(_) = self.ml.iterate(true) {
                return Err(CommandError::Transient("audio mainloop stopped".into()));
            }
        }
    }

    /// Wait for a write and turn the server's verdict into a result.
    fn confirm(
        &mut self,
        op: Operation<dyn FnMut(bool)>,
        ok: &Rc<Cell<bool>>,
        what: &str,
    ) -> Result<(), CommandError> {
        self.wait(op)?;
        if ok.get() {
            Ok(())
        } else {
            Err(CommandError::Rejected(format!("audio server refused to {}", what)))
        }
    }

    fn read_state(&mut self) -> Result<AudioState, CommandError> {
        let defaults = Rc::new(RefCell::new((None, None)));
        let out = Rc::clone(&defaults);
        let op = self.ctx.introspect().get_server_info(move |info| {
            *out.borrow_mut() = (
                info.default_sink_name.as_deref().map(str::to_string),
                info.default_source_name.as_deref().map(str::to_string),
            );
        });
        self.wait(op)?;

        let sinks = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&sinks);
        let op = self.ctx.introspect().get_sink_info_list(move |result| {
            if let ListResult::Item(info) = result {
                out.borrow_mut().push(device(
                    info.name.as_deref(),
                    info.description.as_deref(),
                    &info.volume,
                    info.mute,
                ));
            }
        });
        self.wait(op)?;

        let sources = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&sources);
        let op = self.ctx.introspect().get_source_info_list(move |result| {
            // Monitors mirror a sink and are not real inputs
            if let ListResult::Item(info) = result {
                if info.monitor_of_sink.is_none() {
                    out.borrow_mut().push(device(
                        info.name.as_deref(),
                        info.description.as_deref(),
                        &info.volume,
                        info.mute,
                    ));
                }
            }
        });
        self.wait(op)?;

        let streams = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&streams);
        let op = self.ctx.introspect().get_sink_input_info_list(move |result| {
            if let ListResult::Item(info) = result {
                out.borrow_mut().push(AudioStream {
                    index: info.index,
                    name: app_name(&info.proplist, info.name.as_deref()),
                    volume_percent: volume_to_percent(info.volume.avg()),
                    muted: info.mute,
                    device: Some(info.sink),
                });
            }
        });
        self.wait(op)?;

        let recording = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&recording);
        let op = self
            .ctx
            .introspect()
            .get_source_output_info_list(move |result| {
                // Level meters (pavucontrol and friends) record in peaks mode
                if let ListResult::Item(info) = result {
                    if info.resample_method.as_deref() == Some("peaks") {
                        return;
                    }
                    out.borrow_mut().push(AudioStream {
                        index: info.index,
                        name: app_name(&info.proplist, info.name.as_deref()),
                        volume_percent: volume_to_percent(info.volume.avg()),
                        muted: info.mute,
                        device: Some(info.source),
                    });
                }
            });
        self.wait(op)?;

        let (default_sink, default_source) = defaults.take();
        let state = AudioState {
            default_sink,
            default_source,
            sinks: sinks.take(),
            sources: sources.take(),
            streams: streams.take(),
            recording_streams: recording.take(),
        };
        debug!(
            "Audio update: {:?}% (muted: {:?})",
            state.volume(),
            state.muted()
        );
        Ok(state)
    }

    /// Channel count and mute flag of a sink.
    fn sink(&mut self, name: &str) -> Result<(u8, bool), CommandError> {
        let found = Rc::new(Cell::new(None));
        let out = Rc::clone(&found);
        let op = self
            .ctx
            .introspect()
            .get_sink_info_by_name(name, move |result| {
                if let ListResult::Item(info) = result {
                    out.set(Some((info.volume.len(), info.mute)));
                }
            });
        self.wait(op)?;
        found
            .get()
            .ok_or_else(|| CommandError::Unsupported(format!("no sink '{}'", name)))
    }

    fn source(&mut self, name: &str) -> Result<(u8, bool), CommandError> {
        let found = Rc::new(Cell::new(None));
        let out = Rc::clone(&found);
        let op = self
            .ctx
            .introspect()
            .get_source_info_by_name(name, move |result| {
                if let ListResult::Item(info) = result {
                    out.set(Some((info.volume.len(), info.mute)));
                }
            });
        self.wait(op)?;
        found
            .get()
            .ok_or_else(|| CommandError::Unsupported(format!("no source '{}'", name)))
    }

    fn stream_channels(&mut self, index: u32) -> Result<u8, CommandError> {
        let found = Rc::new(Cell::new(None));
        let out = Rc::clone(&found);
        let op = self
            .ctx
            .introspect()
            .get_sink_input_info(index, move |result| {
                if let ListResult::Item(info) = result {
                    out.set(Some(info.volume.len()));
                }
            });
        self.wait(op)?;
        found
            .get()
            .ok_or_else(|| CommandError::Unsupported(format!("no stream #{}", index)))
    }

    fn recording_channels(&mut self, index: u32) -> Result<u8, CommandError> {
        let found = Rc::new(Cell::new(None));
        let out = Rc::clone(&found);
        let op = self
            .ctx
            .introspect()
            .get_source_output_info(index, move |result| {
                if let ListResult::Item(info) = result {
                    out.set(Some(info.volume.len()));
                }
            });
        self.wait(op)?;
        found
            .get()
            .ok_or_else(|| CommandError::Unsupported(format!("no recording stream #{}", index)))
    }

    fn stream_indices(&mut self) -> Result<Vec<u32>, CommandError> {
        let indices = Rc::new(RefCell::new(Vec::new()));
        let out = Rc::clone(&indices);
        let op = self.ctx.introspect().get_sink_input_info_list(move |result| {
            if let ListResult::Item(info) = result {
                out.borrow_mut().push(info.index);
            }
        });
        self.wait(op)?;
        Ok(indices.take())
    }

    fn set_sink_volume(&mut self, name: &str, percent: u32) -> Result<(), CommandError> {
        let (channels, _) = self.sink(name)?;
        let volumes = channel_volumes(channels, percent);
        let (ok, done) = verdict();
        let op = self
            .ctx
            .introspect()
            .set_sink_volume_by_name(name, &volumes, Some(done));
        self.confirm(op, &ok, "set sink volume")
    }

    fn set_sink_mute(&mut self, name: &str, muted: bool) -> Result<(), CommandError> {
        let (ok, done) = verdict();
        let op = self
            .ctx
            .introspect()
            .set_sink_mute_by_name(name, muted, Some(done));
        self.confirm(op, &ok, "mute sink")
    }

    fn set_source_volume(&mut self, name: &str, percent: u32) -> Result<(), CommandError> {
        let (channels, _) = self.source(name)?;
        let volumes = channel_volumes(channels, percent);
        let (ok, done) = verdict();
        let op = self
            .ctx
            .introspect()
            .set_source_volume_by_name(name, &volumes, Some(done));
        self.confirm(op, &ok, "set source volume")
    }

    fn set_source_mute(&mut self, name: &str, muted: bool) -> Result<(), CommandError> {
        let (ok, done) = verdict();
        let op = self
            .ctx
            .introspect()
            .set_source_mute_by_name(name, muted, Some(done));
        self.confirm(op, &ok, "mute source")
    }

    fn set_default_sink(&mut self, name: &str) -> Result<(), CommandError> {
        self.sink(name)?;
        let ok = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ok);
        let op = self
            .ctx
            .set_default_sink(name, move |success| flag.set(success));
        self.confirm(op, &ok, "change default sink")?;

        // Move playing streams along with the default
        for index in self.stream_indices()? {
            let (ok, done) = verdict();
            let op = self
                .ctx
                .introspect()
                .move_sink_input_by_name(index, name, Some(done));
            if let Err(e) = self.confirm(op, &ok, "move stream") {
                warn!("Stream #{} stayed on its sink: {}", index, e);
            }
        }
        Ok(())
    }

    fn set_default_source(&mut self, name: &str) -> Result<(), CommandError> {
        self.source(name)?;
        let ok = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ok);
        let op = self
            .ctx
            .set_default_source(name, move |success| flag.set(success));
        self.confirm(op, &ok, "change default source")
    }

    fn apply(&mut self, action: &AudioAction) -> Result<(), CommandError> {
        match action {
            AudioAction::SetVolume(percent) => self.set_sink_volume(DEFAULT_SINK, *percent),
            AudioAction::SetMuted(muted) => self.set_sink_mute(DEFAULT_SINK, *muted),
            AudioAction::ToggleMute => {
                let (_, muted) = self.sink(DEFAULT_SINK)?;
                self.set_sink_mute(DEFAULT_SINK, !muted)
            }
            AudioAction::SetDefaultSink(name) => self.set_default_sink(name),
            AudioAction::SetSourceVolume(percent) => {
                self.set_source_volume(DEFAULT_SOURCE, *percent)
            }
            AudioAction::SetSourceMuted(muted) => self.set_source_mute(DEFAULT_SOURCE, *muted),
            AudioAction::SetDefaultSource(name) => self.set_default_source(name),
            AudioAction::SetStreamVolume { index, percent } => {
                let channels = self.stream_channels(*index)?;
                let volumes = channel_volumes(channels, *percent);
                let (ok, done) = verdict();
                let op = self
                    .ctx
                    .introspect()
                    .set_sink_input_volume(*index, &volumes, Some(done));
                self.confirm(op, &ok, "set stream volume")
            }
            AudioAction::SetStreamMuted { index, muted } => {
                self.stream_channels(*index)?;
                let (ok, done) = verdict();
                let op = self
                    .ctx
                    .introspect()
                    .set_sink_input_mute(*index, *muted, Some(done));
                self.confirm(op, &ok, "mute stream")
            }
            AudioAction::SetRecordingVolume { index, percent } => {
                let channels = self.recording_channels(*index)?;
                let volumes = channel_volumes(channels, *percent);
                let (ok, done) = verdict();
                let op = self
                    .ctx
                    .introspect()
                    .set_source_output_volume(*index, &volumes, Some(done));
                self.confirm(op, &ok, "set recording volume")
            }
            AudioAction::SetRecordingMuted { index, muted } => {
                self.recording_channels(*index)?;
                let (ok, done) = verdict();
                let op = self
                    .ctx
                    .introspect()
                    .set_source_output_mute(*index, *muted, Some(done));
                self.confirm(op, &ok, "mute recording stream")
            }
        }
    }

    /// Make the device's sink the default if it exists. Returns whether it did.
    fn prefer_bluetooth_sink(&mut self, address: &str) -> Result<bool, CommandError> {
        let state = self.read_state()?;
        let Some(sink) = state
            .sinks
            .iter()
            .find(|s| is_bluetooth_sink_of(&s.name, address))
        else {
            return Ok(false);
        };
        if state.default_sink.as_deref() != Some(sink.name.as_str()) {
            info!("Routing audio to {}", sink.name);
            self.set_default_sink(&sink.name)?;
        }
        Ok(true)
    }
}

/// Wait for a freshly connected Bluetooth device's sink, then make it the
/// default and move playing streams onto it. Returns false if no sink showed up.
pub async fn route_to_bluetooth(address: &str) -> Result<bool, CommandError> {
    for _ in 0..SINK_WAIT_ATTEMPTS {
        let address = address.to_string();
        if with_pulse(move |pulse| pulse.prefer_bluetooth_sink(&address)).await? {
            return Ok(true);
        }
        tokio::time::sleep(SINK_WAIT_INTERVAL).await;
    }
    Ok(false)
}

/// PipeWire names it `bluez_output.AA_BB_..`, PulseAudio `bluez_sink.AA_BB_..`.
fn is_bluetooth_sink_of(sink: &str, address: &str) -> bool {
    if !(sink.starts_with("bluez_output.") || sink.starts_with("bluez_sink.")) {
        return false;
    }
    let id = address.replace(':', "_").to_ascii_uppercase();
    sink.to_ascii_uppercase().contains(&id)
}

fn app_name(proplist: &Proplist, fallback: Option<&str>) -> String {
    proplist
        .get_str("application.name")
        .or_else(|| fallback.map(str::to_string))
        .unwrap_or_default()
}

impl Drop for Pulse {
    fn drop(&mut self) {
        self.ctx.disconnect();
    }
}

/// Success flag plus the callback that records the server's answer.
fn verdict() -> (Rc<Cell<bool>>, Box<dyn FnMut(bool)>) {
    let ok = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ok);
    (ok, Box::new(move |success| flag.set(success)))
}

fn device(
    name: Option<&str>,
    description: Option<&str>,
    volume: &ChannelVolumes,
    muted: bool,
) -> AudioDevice {
    AudioDevice {
        name: name.unwrap_or_default().to_string(),
        description: description.unwrap_or_default().to_string(),
        volume_percent: volume_to_percent(volume.avg()),
        muted,
    }
}

fn volume_to_percent(volume: Volume) -> u32 {
    let normal = Volume::NORMAL.0 as f64;
    let current = volume.0 as f64;
    ((current / normal) * 100.0).round() as u32
}

fn percent_to_volume(percent: u32) -> Volume {
    let percent = percent.min(MAX_VOLUME_PERCENT) as f64;
    Volume(((percent / 100.0) * Volume::NORMAL.0 as f64).round() as u32)
}

fn channel_volumes(channels: u8, percent: u32) -> ChannelVolumes {
    let mut volumes = ChannelVolumes::default();
    volumes.set(channels.max(1), percent_to_volume(percent));
    volumes
}

// === Monitor thread ===

fn run_monitor(sink: EventSink, stop: Arc<AtomicBool>, ready: mpsc::Sender<bool>) {
    let mut pulse = match Pulse::connect("Control Panel Monitor") {
        Ok(pulse) => pulse,
        Err(e) => {
            warn!("Audio monitor failed to connect: {}", e);
            let _ = ready.send(false);
            return;
        }
    };

    pulse.ctx.subscribe(
        InterestMaskSet::SINK
            | InterestMaskSet::SOURCE
            | InterestMaskSet::SINK_INPUT
            | InterestMaskSet::SOURCE_OUTPUT
            | InterestMaskSet::SERVER,
        |success| {
            if !success {
                warn!("Failed to subscribe to PulseAudio events");
            }
        },
    );

    let dirty = Rc::new(Cell::new(false));
    let flag = Rc::clone(&dirty);
    pulse
        .ctx
        .set_subscribe_callback(Some(Box::new(move |facility, _operation, _index| {
            if let Some(
                Facility::Sink
                | Facility::Source
                | Facility::SinkInput
                | Facility::SourceOutput
                | Facility::Server,
            ) = facility
            {
                flag.set(true);
            }
        })));

    let _ = ready.send(true);
    info!("Audio monitor listening for changes...");

    while !stop.load(Ordering::SeqCst) {
        match pulse.ml.iterate(true) {
            IterateResult::Quit(_) => break,
            IterateResult::Err(e) => {
                error!("Mainloop error: {:?}", e);
                break;
            }
            IterateResult::Success(_) => {}
        }

        // Query outside of callbacks
        match next_step(&stop, &dirty) {
            MonitorStep::Stop => break,
            MonitorStep::Idle => {}
            MonitorStep::Read => match pulse.read_state() {
                Ok(state) => {
                    if !sink.emit(SubsystemState::Audio(state)) {
                        break;
                    }
                }
                Err(e) => debug!("Audio read after event failed: {}", e),
            },
        }
    }
    debug!("Audio monitor stopped");
}

#[derive(Debug, PartialEq, Eq)]
enum MonitorStep {
    Stop,
    Read,
    Idle,
}

/// Unsubscribing while blocked in `iterate` wins over a pending change.
fn next_step(stop: &AtomicBool, dirty: &Cell<bool>) -> MonitorStep {
    if stop.load(Ordering::SeqCst) {
        MonitorStep::Stop
    } else if dirty.replace(false) {
        MonitorStep::Read
    } else {
        MonitorStep::Idle
    }
}
