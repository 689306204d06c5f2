//! Command dispatcher.
//!
//! One worker task and FIFO queue per subsystem: a command reaches its
//! adapter only after the previous command for the same kind has had its
//! outcome published. Kinds never wait on each other.

use crate::adapter::{RetryPolicy, apply_with_retry, bounded_current_state};
use crate::aggregator::AggregatorHandle;
use crate::command::Command;
use crate::error::CommandError;
use crate::registry::Registry;
use crate::types::{Availability, ChangeEvent, EventSource, SubsystemKind};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Dispatcher {
    queues: HashMap<SubsystemKind, mpsc::UnboundedSender<Command>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(registry: Arc<Registry>, aggregator: AggregatorHandle) -> Self {
        let mut queues = HashMap::new();
        let mut workers = Vec::new();

        for kind in SubsystemKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = Worker {
                kind,
                registry: Arc::clone(&registry),
                aggregator: aggregator.clone(),
            };
            workers.push(tokio::spawn(worker.run(rx)));
            queues.insert(kind, tx);
        }

        Self { queues, workers }
    }

    /// Queue a command. The outcome arrives later as a notification.
    /// Returns false once the dispatcher has shut down.
    pub fn dispatch(&self, command: Command) -> bool {
        let kind = command.kind();
        debug!("Queueing {} {}", kind, command.action_name());
        match self.queues.get(&kind) {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    kind: SubsystemKind,
    registry: Arc<Registry>,
    aggregator: AggregatorHandle,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            let result = self.execute(&command).await;
            self.aggregator
                .report_outcome(self.kind, command.action_name(), result)
                .await;
        }
        debug!("{} dispatcher stopped", self.kind);
    }

    async fn execute(&self, command: &Command) -> Result<(), CommandError> {
        let kind = self.kind;
        let action = command.action_name();

        // Checked when dequeued, so commands queued behind a service that
        // vanished are cancelled rather than attempted.
        if self.registry.availability(kind) == Availability::Unavailable {
            info!("{} {} not attempted: subsystem unavailable", kind, action);
            return Err(CommandError::Unavailable(format!("{} is not available", kind)));
        }
        let Some(adapter) = self.registry.adapter(kind) else {
            return Err(CommandError::Unavailable(format!("no {} backend", kind)));
        };

        let config = self.registry.config();
        let policy = RetryPolicy {
            timeout: config.apply_timeout(),
            retries: config.effective_retries(),
            backoff: config.retry_backoff(),
        };

        match apply_with_retry(adapter.as_ref(), command, policy).await {
            Ok(()) => {
                let confirms = adapter.capabilities().self_reports && self.registry.has_push(kind);
                if !confirms {
                    // Close the loop ourselves so the UI reflects the change.
                    match bounded_current_state(adapter.as_ref(), config.poll_timeout()).await {
                        Ok(state) => {
                            self.aggregator
                                .submit(ChangeEvent::new(state, EventSource::CommandResult));
                        }
                        Err(e) => warn!("{} read-back after {} failed: {}", kind, action, e),
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("{} {} failed: {}", kind, action, e);
                if matches!(e, CommandError::Unavailable(_)) {
                    self.registry.invalidate(kind).await;
                }
                Err(e)
            }
        }
    }
}
