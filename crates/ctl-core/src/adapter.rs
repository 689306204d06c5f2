//! Backend adapter contract.
//!
//! One implementation per subsystem wraps one host service. The core only
//! talks to services through this trait, so each adapter translates the
//! native notification model (signals, polling, nothing) into change events.

use crate::aggregator::AggregatorHandle;
use crate::command::Command;
use crate::error::CommandError;
use crate::types::{Availability, ChangeEvent, EventSource, SubsystemKind, SubsystemState};
use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Notification model of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Can deliver native change notifications via `subscribe`.
    pub push: bool,
    /// Can be sampled by the scheduler via `poll`.
    pub poll: bool,
    /// Emits its own confirming event after a successful `apply`.
    pub self_reports: bool,
}

/// Trait that all subsystem backends must implement.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> SubsystemKind;

    fn capabilities(&self) -> Capabilities;

    /// Lightweight existence check. Never errors: failures map to Unavailable.
    /// The registry bounds this with a timeout.
    async fn probe(&self) -> Availability;

    async fn current_state(&self) -> Result<SubsystemState, CommandError>;

    /// Start native change notifications. Every native event becomes exactly
    /// one `sink.emit`. Returns None when push is unsupported or failed.
    async fn subscribe(&self, _sink: EventSink) -> Option<Subscription> {
        None
    }

    async fn poll(&self) -> Result<SubsystemState, CommandError> {
        self.current_state().await
    }

    /// The only mutation path.
    async fn apply(&self, command: &Command) -> Result<(), CommandError>;
}

/// Where a push-capable adapter sends its events.
#[derive(Clone)]
pub struct EventSink {
    kind: SubsystemKind,
    aggregator: AggregatorHandle,
}

impl EventSink {
    pub(crate) fn new(kind: SubsystemKind, aggregator: AggregatorHandle) -> Self {
        Self { kind, aggregator }
    }

    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    /// Emit a push event stamped now. Returns false once the core has shut down.
    pub fn emit(&self, state: SubsystemState) -> bool {
        if state.kind() != self.kind {
            warn!(
                "{} adapter emitted a {} payload, dropping",
                self.kind,
                state.kind()
            );
            return true;
        }
        self.aggregator
            .submit(ChangeEvent::new(state, EventSource::Push))
    }
}

/// Keeps a push subscription alive. Dropping it stops the subscription.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Run `cancel` when the subscription is dropped.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription backed by a tokio task, aborted on drop.
    pub fn from_task(handle: JoinHandle<()>) -> Self {
        Self::new(move || handle.abort())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Bounds and retry budget for `apply`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

/// Run `apply` under a timeout, retrying a transient failure (timeouts
/// included) at most `policy.retries` times. Other errors surface at once.
pub async fn apply_with_retry(
    adapter: &dyn BackendAdapter,
    command: &Command,
    policy: RetryPolicy,
) -> Result<(), CommandError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, adapter.apply(command)).await {
            Ok(result) => result,
            Err(_) => Err(timed_out(command.kind(), command.action_name(), policy.timeout)),
        };

        match result {
            Err(e) if e.is_transient() && attempt < policy.retries => {
                attempt += 1;
                warn!(
                    "{} {} failed ({}), retrying",
                    command.kind(),
                    command.action_name(),
                    e
                );
                tokio::time::sleep(policy.backoff).await;
            }
            other => {
                debug!(
                    "{} {} finished after {} attempt(s)",
                    command.kind(),
                    command.action_name(),
                    attempt + 1
                );
                return other;
            }
        }
    }
}

/// `current_state` under a timeout; a timeout is a transient error.
pub async fn bounded_current_state(
    adapter: &dyn BackendAdapter,
    limit: Duration,
) -> Result<SubsystemState, CommandError> {
    match tokio::time::timeout(limit, adapter.current_state()).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(adapter.kind(), "state read", limit)),
    }
}

/// `poll` under a timeout; a timeout is a transient error.
pub async fn bounded_poll(
    adapter: &dyn BackendAdapter,
    limit: Duration,
) -> Result<SubsystemState, CommandError> {
    match tokio::time::timeout(limit, adapter.poll()).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(adapter.kind(), "poll", limit)),
    }
}

fn timed_out(kind: SubsystemKind, what: &str, limit: Duration) -> CommandError {
    CommandError::Transient(format!("{} {} timed out after {:?}", kind, what, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AudioAction, BrightnessAction};
    use crate::testing::FakeAdapter;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            retries: 1,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_once() {
        let fake = FakeAdapter::new(SubsystemKind::Audio);
        fake.push_apply_result(Err(CommandError::Transient("busy".into())));
        fake.push_apply_result(Ok(()));

        let cmd = Command::Audio(AudioAction::SetVolume(40));
        assert_eq!(apply_with_retry(&fake, &cmd, policy()).await, Ok(()));
        assert_eq!(fake.apply_calls(), 2);
    }

    #[tokio::test]
    async fn second_transient_failure_surfaces() {
        let fake = FakeAdapter::new(SubsystemKind::Audio);
        fake.push_apply_result(Err(CommandError::Transient("busy".into())));
        fake.push_apply_result(Err(CommandError::Transient("still busy".into())));
        fake.push_apply_result(Ok(()));

        let cmd = Command::Audio(AudioAction::ToggleMute);
        assert_eq!(
            apply_with_retry(&fake, &cmd, policy()).await,
            Err(CommandError::Transient("still busy".into()))
        );
        assert_eq!(fake.apply_calls(), 2);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let fake = FakeAdapter::new(SubsystemKind::Brightness);
        fake.push_apply_result(Err(CommandError::Rejected("permission denied".into())));

        let cmd = Command::Brightness(BrightnessAction::Set(10));
        assert!(matches!(
            apply_with_retry(&fake, &cmd, policy()).await,
            Err(CommandError::Rejected(_))
        ));
        assert_eq!(fake.apply_calls(), 1);
    }

    #[tokio::test]
    async fn hung_apply_times_out_as_transient() {
        let fake = FakeAdapter::new(SubsystemKind::Brightness);
        fake.set_apply_delay(Duration::from_secs(5));

        let cmd = Command::Brightness(BrightnessAction::Set(10));
        let policy = RetryPolicy {
            timeout: Duration::from_millis(20),
            retries: 0,
            backoff: Duration::ZERO,
        };
        assert!(matches!(
            apply_with_retry(&fake, &cmd, policy).await,
            Err(CommandError::Transient(_))
        ));
    }

    #[test]
    fn dropping_subscription_cancels() {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let sub = Subscription::new(move || flag.store(true, Ordering::SeqCst));
        assert!(!cancelled.load(Ordering::SeqCst));
        drop(sub);
        assert!(cancelled.load(Ordering::SeqCst));
    }
}
