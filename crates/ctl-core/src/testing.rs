//! Scriptable in-memory adapter for tests.

use crate::adapter::{BackendAdapter, Capabilities, EventSink, Subscription};
use crate::command::{AudioAction, Command};
use crate::error::CommandError;
use crate::types::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn default_state(kind: SubsystemKind) -> SubsystemState {
    match kind {
        SubsystemKind::Network => SubsystemState::Network(NetworkState::default()),
        SubsystemKind::Bluetooth => SubsystemState::Bluetooth(BluetoothState::default()),
        SubsystemKind::Audio => SubsystemState::Audio(AudioState::default()),
        SubsystemKind::Brightness => SubsystemState::Brightness(BrightnessState::default()),
        SubsystemKind::Power => SubsystemState::Power(PowerState::default()),
        SubsystemKind::BlueLight => SubsystemState::BlueLight(BlueLightState::default()),
    }
}

/// Audio state with a single default sink at `volume` percent.
pub fn audio_at(volume: u32) -> SubsystemState {
    SubsystemState::Audio(AudioState {
        default_sink: Some("sink".into()),
        sinks: vec![AudioDevice {
            name: "sink".into(),
            description: "Speakers".into(),
            volume_percent: volume,
            muted: false,
        }],
        ..Default::default()
    })
}

pub struct FakeAdapter {
    kind: SubsystemKind,
    caps: Mutex<Capabilities>,
    availability: Mutex<Availability>,
    probe_delay: Mutex<Option<Duration>>,
    poll_delay: Mutex<Option<Duration>>,
    apply_delay: Mutex<Option<Duration>>,
    state: Mutex<SubsystemState>,
    apply_results: Mutex<VecDeque<Result<(), CommandError>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    fail_subscribe: AtomicBool,
    sink: Mutex<Option<EventSink>>,
    log: Mutex<Option<Arc<Mutex<Vec<String>>>>>,
    applied: Mutex<Vec<Command>>,
    apply_calls: AtomicUsize,
    probe_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl FakeAdapter {
    /// Available, poll-only, self-reporting adapter.
    pub fn new(kind: SubsystemKind) -> Self {
        Self {
            kind,
            caps: Mutex::new(Capabilities {
                push: false,
                poll: true,
                self_reports: true,
            }),
            availability: Mutex::new(Availability::Available),
            probe_delay: Mutex::new(None),
            poll_delay: Mutex::new(None),
            apply_delay: Mutex::new(None),
            state: Mutex::new(default_state(kind)),
            apply_results: Mutex::new(VecDeque::new()),
            gate: Mutex::new(None),
            fail_subscribe: AtomicBool::new(false),
            sink: Mutex::new(None),
            log: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            apply_calls: AtomicUsize::new(0),
            probe_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn with_capabilities(self, push: bool, poll: bool, self_reports: bool) -> Self {
        *self.caps.lock().unwrap() = Capabilities {
            push,
            poll,
            self_reports,
        };
        self
    }

    pub fn with_state(self, state: SubsystemState) -> Self {
        self.set_state(state);
        self
    }

    pub fn with_log(self, log: Arc<Mutex<Vec<String>>>) -> Self {
        *self.log.lock().unwrap() = Some(log);
        self
    }

    pub fn set_availability(&self, availability: Availability) {
        *self.availability.lock().unwrap() = availability;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = Some(delay);
    }

    pub fn clear_probe_delay(&self) {
        *self.probe_delay.lock().unwrap() = None;
    }

    pub fn set_poll_delay(&self, delay: Duration) {
        *self.poll_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_state(&self, state: SubsystemState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn fail_subscribe(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    pub fn push_apply_result(&self, result: Result<(), CommandError>) {
        self.apply_results.lock().unwrap().push_back(result);
    }

    /// Block every `apply` until `release` hands out a permit.
    pub fn hold_applies(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(permits);
        }
    }

    /// Emit through the push sink, as the service would.
    pub fn emit(&self, state: SubsystemState) -> bool {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => sink.emit(state),
            None => false,
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    pub fn applied(&self) -> Vec<Command> {
        self.applied.lock().unwrap().clone()
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    fn record(&self, line: String) {
        if let Some(log) = self.log.lock().unwrap().as_ref() {
            log.lock().unwrap().push(line);
        }
    }
}

#[async_trait]
impl BackendAdapter for FakeAdapter {
    fn kind(&self) -> SubsystemKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        *self.caps.lock().unwrap()
    }

    async fn probe(&self) -> Availability {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.availability.lock().unwrap().clone()
    }

    async fn current_state(&self) -> Result<SubsystemState, CommandError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn subscribe(&self, sink: EventSink) -> Option<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if !self.capabilities().push || self.fail_subscribe.load(Ordering::SeqCst) {
            return None;
        }
        *self.sink.lock().unwrap() = Some(sink);
        Some(Subscription::new(|| {}))
    }

    async fn poll(&self) -> Result<SubsystemState, CommandError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.poll_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().unwrap().clone())
    }

    async fn apply(&self, command: &Command) -> Result<(), CommandError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.applied.lock().unwrap().push(command.clone());
        self.record(format!("apply {}", command.action_name()));

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let delay = *self.apply_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self
            .apply_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));

        if result.is_ok() {
            if let Command::Audio(AudioAction::SetVolume(volume)) = command {
                let mut state = self.state.lock().unwrap();
                if let SubsystemState::Audio(audio) = &mut *state {
                    for sink in audio.sinks.iter_mut() {
                        sink.volume_percent = *volume;
                    }
                }
            }
            // A self-reporting service confirms over its own signal
            if self.capabilities().self_reports {
                let state = self.state.lock().unwrap().clone();
                self.emit(state);
            }
        }
        result
    }
}
