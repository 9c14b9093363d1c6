//! Process-local status notification.
//!
//! [`StatusNotifier`] fans a status event out to every registered listener,
//! synchronously, in the publisher's thread. [`StatusWaiter`] builds an
//! async wait-for-final-status primitive on top of a notifier subscription.

pub mod error;
pub mod notifier;
pub mod waiter;

pub use error::{BusError, Result};
pub use notifier::{ListenerId, StatusListener, StatusNotifier};
pub use waiter::StatusWaiter;
