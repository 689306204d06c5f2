//! Poll loop and slow re-probe cadence.
//!
//! Drives every usable adapter that has no live push subscription, each at
//! its own interval. A poll that stalls is cut off by a timeout and skipped
//! for that tick only.

use crate::adapter::bounded_poll;
use crate::aggregator::AggregatorHandle;
use crate::registry::Registry;
use crate::types::{ChangeEvent, EventSource, SubsystemKind};
use futures_util::future::join_all;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};

pub struct Scheduler {
    registry: Arc<Registry>,
    aggregator: AggregatorHandle,
    last_poll: HashMap<SubsystemKind, Instant>,
    last_probe: Instant,
}

impl Scheduler {
    pub fn new(registry: Arc<Registry>, aggregator: AggregatorHandle) -> Self {
        Self {
            registry,
            aggregator,
            last_poll: HashMap::new(),
            last_probe: Instant::now(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut period = self.registry.config().tick();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.tick(Instant::now()).await;

            // Picks up a reloaded tick setting
            let wanted = self.registry.config().tick();
            if wanted != period {
                debug!("Scheduler tick changed to {:?}", wanted);
                period = wanted;
                ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.reset();
            }
        }
    }

    /// Run one tick at `now`. Returns how many poll results were fed.
    pub async fn tick(&mut self, now: Instant) -> usize {
        let config = self.registry.config();

        let due: Vec<SubsystemKind> = SubsystemKind::ALL
            .into_iter()
            .filter(|&kind| self.should_poll(kind))
            .filter(|kind| {
                self.last_poll
                    .get(kind)
                    .is_none_or(|last| now.duration_since(*last) >= config.poll_interval(*kind))
            })
            .collect();

        let limit = config.poll_timeout();
        let mut polls = Vec::with_capacity(due.len());
        for kind in due {
            self.last_poll.insert(kind, now);
            if let Some(adapter) = self.registry.adapter(kind) {
                polls.push(async move { (kind, bounded_poll(adapter.as_ref(), limit).await) });
            }
        }
        let results = join_all(polls).await;

        let mut fed = 0;
        for (kind, result) in results {
            match result {
                Ok(state) => {
                    self.aggregator
                        .submit(ChangeEvent::new(state, EventSource::Poll));
                    fed += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!("{} poll skipped this tick: {}", kind, e);
                }
                Err(e) => debug!("{} poll failed: {}", kind, e),
            }
        }

        if now.duration_since(self.last_probe) >= config.reprobe_interval() {
            self.last_probe = now;
            self.registry.refresh().await;
        }

        fed
    }

    fn should_poll(&self, kind: SubsystemKind) -> bool {
        if !self.registry.availability(kind).is_usable() || self.registry.has_push(kind) {
            return false;
        }
        self.registry
            .adapter(kind)
            .is_some_and(|adapter| adapter.capabilities().poll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreConfig, SubsystemConfig};
    use crate::testing::{FakeAdapter, audio_at};
    use crate::types::{Availability, BrightnessState, SubsystemState};
    use std::time::Duration;

    fn config() -> CoreConfig {
        let mut cfg = CoreConfig {
            poll_timeout_ms: 50,
            probe_timeout_ms: 50,
            reprobe_secs: 10,
            ..Default::default()
        };
        cfg.subsystems.insert(
            SubsystemKind::Audio,
            SubsystemConfig {
                enabled: true,
                poll_interval_ms: Some(100),
            },
        );
        cfg.subsystems.insert(
            SubsystemKind::Power,
            SubsystemConfig {
                enabled: true,
                poll_interval_ms: Some(1000),
            },
        );
        cfg
    }

    async fn setup(
        adapters: Vec<Arc<dyn crate::adapter::BackendAdapter>>,
    ) -> (Scheduler, Arc<Registry>, AggregatorHandle) {
        let (aggregator, _join) = AggregatorHandle::spawn();
        let registry = Arc::new(Registry::new(
            adapters,
            Arc::new(config()),
            aggregator.clone(),
        ));
        registry.refresh().await;
        aggregator.flush().await;
        let scheduler = Scheduler::new(Arc::clone(&registry), aggregator.clone());
        (scheduler, registry, aggregator)
    }

    #[tokio::test(start_paused = true)]
    async fn only_usable_poll_driven_kinds_are_polled() {
        let polled = FakeAdapter::new(SubsystemKind::Audio).shared();
        let pushed = FakeAdapter::new(SubsystemKind::Network)
            .with_capabilities(true, true, true)
            .shared();
        let silent = FakeAdapter::new(SubsystemKind::BlueLight)
            .with_capabilities(false, false, false)
            .shared();
        let gone = FakeAdapter::new(SubsystemKind::Bluetooth).shared();
        gone.set_availability(Availability::Unavailable);

        let (mut scheduler, _registry, _aggregator) = setup(vec![
            polled.clone(),
            pushed.clone(),
            silent.clone(),
            gone.clone(),
        ])
        .await;

        assert_eq!(scheduler.tick(Instant::now()).await, 1);
        assert_eq!(polled.poll_calls(), 1);
        assert_eq!(pushed.poll_calls(), 0);
        assert_eq!(silent.poll_calls(), 0);
        assert_eq!(gone.poll_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_poll_does_not_hold_up_others() {
        let stuck = FakeAdapter::new(SubsystemKind::Power).shared();
        stuck.set_poll_delay(Duration::from_secs(60));
        let brightness = FakeAdapter::new(SubsystemKind::Brightness)
            .with_state(SubsystemState::Brightness(BrightnessState {
                device: "acpi_video0".into(),
                percent: 66,
            }))
            .shared();

        let (mut scheduler, _registry, aggregator) =
            setup(vec![stuck.clone(), brightness.clone()]).await;

        let started = Instant::now();
        assert_eq!(scheduler.tick(Instant::now()).await, 1);
        assert!(started.elapsed() < Duration::from_secs(1));

        aggregator.flush().await;
        let snap = aggregator.snapshot();
        assert_eq!(
            snap.state(SubsystemKind::Brightness)
                .and_then(|s| s.as_brightness())
                .map(|b| b.percent),
            Some(66)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn each_kind_keeps_its_own_interval() {
        let audio = FakeAdapter::new(SubsystemKind::Audio)
            .with_state(audio_at(5))
            .shared();
        let power = FakeAdapter::new(SubsystemKind::Power).shared();
        let (mut scheduler, _registry, _aggregator) = setup(vec![audio.clone(), power.clone()]).await;

        let start = Instant::now();
        scheduler.tick(start).await;
        scheduler.tick(start + Duration::from_millis(150)).await;
        scheduler.tick(start + Duration::from_millis(300)).await;
        assert_eq!(audio.poll_calls(), 3);
        assert_eq!(power.poll_calls(), 1);

        scheduler.tick(start + Duration::from_millis(1100)).await;
        assert_eq!(power.poll_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_is_reprobed_on_slow_cadence() {
        let fake = FakeAdapter::new(SubsystemKind::Brightness).shared();
        let (mut scheduler, registry, _aggregator) = setup(vec![fake.clone()]).await;
        assert_eq!(fake.probe_calls(), 1);

        let start = Instant::now();
        scheduler.tick(start + Duration::from_secs(1)).await;
        assert_eq!(fake.probe_calls(), 1);

        fake.set_availability(Availability::Unavailable);
        scheduler.tick(start + Duration::from_secs(11)).await;
        assert_eq!(fake.probe_calls(), 2);
        assert_eq!(
            registry.availability(SubsystemKind::Brightness),
            Availability::Unavailable
        );
    }
}
