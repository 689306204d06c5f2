//! Top-level handle wiring the registry, aggregator, scheduler and dispatcher.

use crate::adapter::BackendAdapter;
use crate::aggregator::{AggregatorHandle, ListenerId, Notification, NotificationReceiver, Snapshot};
use crate::command::Command;
use crate::config::CoreConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::types::{Availability, SubsystemKind};
use log::info;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// The running control core. Dropping it stops every background task.
pub struct ControlCore {
    aggregator: AggregatorHandle,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlCore {
    /// Probe every backend once, then start polling and command handling.
    /// Returns once the first snapshot reflects the startup probe.
    pub async fn start(config: CoreConfig, adapters: Vec<Arc<dyn BackendAdapter>>) -> Self {
        let (aggregator, aggregator_task) = AggregatorHandle::spawn();
        let registry = Arc::new(Registry::new(
            adapters,
            Arc::new(config),
            aggregator.clone(),
        ));

        registry.refresh().await;
        aggregator.flush().await;

        let usable = registry
            .statuses()
            .values()
            .filter(|a| a.is_usable())
            .count();
        info!(
            "Control core started: {} of {} subsystems usable",
            usable,
            SubsystemKind::ALL.len()
        );

        let scheduler = Scheduler::new(Arc::clone(&registry), aggregator.clone()).spawn();
        let dispatcher = Dispatcher::spawn(Arc::clone(&registry), aggregator.clone());

        Self {
            aggregator,
            registry,
            dispatcher,
            tasks: vec![aggregator_task, scheduler],
        }
    }

    /// Queue a command. Never blocks; the outcome arrives as a notification.
    pub fn dispatch(&self, command: Command) -> bool {
        self.dispatcher.dispatch(command)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.aggregator.snapshot()
    }

    pub fn availability(&self, kind: SubsystemKind) -> Availability {
        self.registry.availability(kind)
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.aggregator.subscribe()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.aggregator.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.aggregator.remove_listener(id)
    }

    /// Re-probe every backend now instead of waiting for the slow cadence.
    pub async fn refresh(&self) -> Vec<(SubsystemKind, Availability)> {
        self.registry.refresh().await
    }

    /// Swap in a new configuration and re-probe with it.
    pub async fn reload(&self, config: CoreConfig) -> Vec<(SubsystemKind, Availability)> {
        info!("Reloading control core config");
        self.registry.set_config(Arc::new(config));
        self.registry.refresh().await
    }

    /// Wait until everything submitted so far has been merged and published.
    pub async fn flush(&self) {
        self.aggregator.flush().await
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for ControlCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
