//! UI-side view of the core's notification bus.
//!
//! Design principles:
//! - One `NotificationReceiver` per view, in aggregator order
//! - Single polling timer per view, draining everything pending per tick
//! - Only the latest state per subsystem is worth rendering
//!
//! Command outcomes and availability changes are never deduplicated, each
//! one may carry something the user has to see.

use ctl_core::{Notification, NotificationReceiver, SubsystemKind};
use std::collections::HashSet;

/// How often a view drains its receiver.
pub const EVENT_POLL_INTERVAL_MS: u64 = 50;

/// Drain all pending notifications, keeping only the latest `State` per kind.
pub fn drain_latest(rx: &mut NotificationReceiver) -> Vec<Notification> {
    let mut pending = Vec::with_capacity(8);
    while let Ok(notification) = rx.try_recv() {
        pending.push(notification);
    }
    latest_only(pending)
}

/// Collapse a batch to the latest `State` per kind, keeping everything else.
fn latest_only(pending: Vec<Notification>) -> Vec<Notification> {
    if pending.len() <= 1 {
        return pending;
    }

    let mut seen: HashSet<SubsystemKind> = HashSet::new();
    let mut result = Vec::with_capacity(pending.len());

    // Walk newest first so the first State seen per kind is the latest
    for notification in pending.into_iter().rev() {
        match &notification {
            Notification::State { kind, .. } => {
                if seen.insert(*kind) {
                    result.push(notification);
                }
            }
            _ => result.push(notification),
        }
    }

    result.reverse();
    result
}
