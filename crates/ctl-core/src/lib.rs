//! Live-state core of the control panel.
//!
//! Keeps one consistent picture of the host's network, Bluetooth, audio,
//! brightness, power and blue-light state, and routes user commands back to
//! the services that own that state.
//!
//! - [`adapter`]: contract every backend implements
//! - [`registry`]: probing, availability and push subscriptions
//! - [`aggregator`]: merges change events into immutable snapshots
//! - [`dispatcher`]: per-subsystem command queues
//! - [`scheduler`]: poll loop and re-probe cadence
//! - [`control`]: [`ControlCore`], the handle a UI holds

pub mod adapter;
pub mod aggregator;
pub mod command;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod testing;

pub use adapter::{BackendAdapter, Capabilities, EventSink, Subscription};
pub use aggregator::{Entry, ListenerId, Notification, NotificationReceiver, Snapshot};
pub use command::{
    AudioAction, BlueLightAction, BluetoothAction, BrightnessAction, Command, NetworkAction,
    PowerAction,
};
pub use config::{CoreConfig, SubsystemConfig};
pub use control::ControlCore;
pub use error::{CommandError, ConfigError};
pub use types::*;
