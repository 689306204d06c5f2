//! Capability registry: which subsystems are usable right now.
//!
//! - Probes every adapter under a per-adapter timeout, concurrently
//! - Publishes availability changes through the aggregator
//! - Owns push subscriptions: started when a kind becomes usable, dropped
//!   when it becomes unavailable
//! - Refreshes are serialized, so one refresh yields one value per kind

use crate::adapter::{BackendAdapter, EventSink, Subscription, bounded_current_state};
use crate::aggregator::AggregatorHandle;
use crate::config::CoreConfig;
use crate::types::{Availability, ChangeEvent, EventSource, SubsystemKind};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

pub struct Registry {
    adapters: HashMap<SubsystemKind, Arc<dyn BackendAdapter>>,
    config: RwLock<Arc<CoreConfig>>,
    status: RwLock<HashMap<SubsystemKind, Availability>>,
    /// Kinds with a live push subscription. Others fall back to polling.
    push_active: RwLock<HashSet<SubsystemKind>>,
    /// Held for the duration of a refresh.
    subscriptions: Mutex<HashMap<SubsystemKind, Subscription>>,
    aggregator: AggregatorHandle,
}

impl Registry {
    pub fn new(
        adapters: Vec<Arc<dyn BackendAdapter>>,
        config: Arc<CoreConfig>,
        aggregator: AggregatorHandle,
    ) -> Self {
        let mut by_kind = HashMap::new();
        for adapter in adapters {
            let kind = adapter.kind();
            if by_kind.insert(kind, adapter).is_some() {
                warn!("Duplicate adapter for {}, keeping the last one", kind);
            }
        }

        Self {
            adapters: by_kind,
            config: RwLock::new(config),
            status: RwLock::new(HashMap::new()),
            push_active: RwLock::new(HashSet::new()),
            subscriptions: Mutex::new(HashMap::new()),
            aggregator,
        }
    }

    pub fn adapter(&self, kind: SubsystemKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    pub fn availability(&self, kind: SubsystemKind) -> Availability {
        self.status
            .read()
            .ok()
            .and_then(|map| map.get(&kind).cloned())
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> HashMap<SubsystemKind, Availability> {
        self.status
            .read()
            .map(|map| map.clone())
            .unwrap_or_default()
    }

    pub fn config(&self) -> Arc<CoreConfig> {
        self.config
            .read()
            .map(|c| Arc::clone(&c))
            .unwrap_or_default()
    }

    /// Replace the configuration snapshot. Takes effect on the next refresh.
    pub fn set_config(&self, config: Arc<CoreConfig>) {
        if let Ok(mut guard) = self.config.write() {
            *guard = config;
        }
    }

    /// Whether `kind` currently delivers push events.
    pub fn has_push(&self, kind: SubsystemKind) -> bool {
        self.push_active
            .read()
            .map(|set| set.contains(&kind))
            .unwrap_or(false)
    }

    /// Probe every subsystem. Returns the entries whose availability changed.
    pub async fn refresh(&self) -> Vec<(SubsystemKind, Availability)> {
        self.refresh_kinds(&SubsystemKind::ALL).await
    }

    /// Re-probe one subsystem right away, e.g. after a command found its
    /// service unreachable.
    pub async fn invalidate(&self, kind: SubsystemKind) -> Availability {
        debug!("Invalidating {}", kind);
        self.refresh_kinds(&[kind]).await;
        self.availability(kind)
    }

    async fn refresh_kinds(&self, kinds: &[SubsystemKind]) -> Vec<(SubsystemKind, Availability)> {
        let mut subscriptions = self.subscriptions.lock().await;
        let config = self.config();

        let probes = kinds.iter().map(|&kind| {
            let config = Arc::clone(&config);
            async move { (kind, self.probe_one(kind, &config).await) }
        });
        let results = join_all(probes).await;

        let mut changed = Vec::new();
        for (kind, availability) in results {
            let previous = self.status.read().ok().and_then(|m| m.get(&kind).cloned());
            if previous.as_ref() == Some(&availability) {
                continue;
            }

            if let Ok(mut guard) = self.status.write() {
                guard.insert(kind, availability.clone());
            }
            self.aggregator.set_availability(kind, availability.clone());

            let was_usable = previous.as_ref().is_some_and(|p| p.is_usable());
            if availability.is_usable() && !was_usable {
                self.activate(kind, &config, &mut subscriptions).await;
            } else if !availability.is_usable() {
                if subscriptions.remove(&kind).is_some() {
                    debug!("Dropped {} subscription", kind);
                }
                self.set_push_active(kind, false);
            }

            changed.push((kind, availability));
        }

        if !changed.is_empty() {
            info!("Registry refresh: {} change(s)", changed.len());
        }
        changed
    }

    async fn probe_one(&self, kind: SubsystemKind, config: &CoreConfig) -> Availability {
        if !config.is_enabled(kind) {
            debug!("{} disabled in config", kind);
            return Availability::Unavailable;
        }
        let Some(adapter) = self.adapter(kind) else {
            return Availability::Unavailable;
        };

        match tokio::time::timeout(config.probe_timeout(), adapter.probe()).await {
            Ok(availability) => availability,
            Err(_) => {
                warn!(
                    "{} probe timed out after {:?}",
                    kind,
                    config.probe_timeout()
                );
                Availability::Unavailable
            }
        }
    }

    /// Kind just became usable: start push and seed the snapshot.
    async fn activate(
        &self,
        kind: SubsystemKind,
        config: &CoreConfig,
        subscriptions: &mut HashMap<SubsystemKind, Subscription>,
    ) {
        let Some(adapter) = self.adapter(kind) else {
            return;
        };

        // Seed first so adapters without any notification model still show up.
        match bounded_current_state(adapter.as_ref(), config.poll_timeout()).await {
            Ok(state) => {
                self.aggregator
                    .submit(ChangeEvent::new(state, EventSource::Poll));
            }
            Err(e) => debug!("Initial {} state read failed: {}", kind, e),
        }

        if !adapter.capabilities().push {
            return;
        }

        let sink = EventSink::new(kind, self.aggregator.clone());
        match tokio::time::timeout(config.probe_timeout(), adapter.subscribe(sink)).await {
            Ok(Some(subscription)) => {
                info!("Listening for {} changes", kind);
                subscriptions.insert(kind, subscription);
                self.set_push_active(kind, true);
            }
            Ok(None) => {
                warn!("{} subscription failed. Falling back to polling.", kind);
                self.set_push_active(kind, false);
            }
            Err(_) => {
                warn!("{} subscription timed out. Falling back to polling.", kind);
                self.set_push_active(kind, false);
            }
        }
    }

    fn set_push_active(&self, kind: SubsystemKind, active: bool) {
        if let Ok(mut set) = self.push_active.write() {
            if active {
                set.insert(kind);
            } else {
                set.remove(&kind);
            }
        }
    }
}
