//! The two notification capabilities.
//!
//! [`StatusNotifier`] is what a check runner holds: a synchronous,
//! fire-and-forget hook. [`Notifier`] is one concrete action (a webhook)
//! that the dispatcher runs in the background.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use watchpost_core::Status;

use crate::error::NotifyResult;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A status transition of one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: Status,
    pub group: String,
    pub name: String,
}

impl StatusEvent {
    pub fn new(status: Status, group: &str, name: &str) -> Self {
        Self {
            status,
            group: group.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} is {}", self.group, self.name, self.status)
    }
}

/// One notification action.
pub trait Notifier: Send + Sync {
    /// Deliver `event`. Errors are reported, never retried.
    fn execute<'a>(&'a self, event: &'a StatusEvent) -> BoxFuture<'a, NotifyResult<()>>;

    /// Short human-readable label for logs.
    fn describe(&self) -> String;
}

/// Receives the outcome of every completed check cycle that changed status.
///
/// Implementations must return promptly; any slow work belongs on a
/// background task.
pub trait StatusNotifier: Send + Sync {
    fn notify(&self, status: Status, group: &str, name: &str);
}

/// A notifier that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl StatusNotifier for NoopNotifier {
    fn notify(&self, _status: Status, _group: &str, _name: &str) {}
}
