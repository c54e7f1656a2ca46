//! watchpost-notify — status-change notifications.
//!
//! Check runners hold a [`StatusNotifier`] and call it with every status
//! transition. The [`Dispatcher`] implementation looks up the handlers
//! configured for the check's group and globally, and runs each matching
//! [`Notifier`] on its own task so a slow or broken endpoint never delays
//! the next check cycle.
//!
//! ```text
//! CheckRunner ──notify(status, group, name)──► Dispatcher
//!                                                ├── global EventHandlers
//!                                                └── groups[group] EventHandlers
//!                                                       └── spawn(timeout(execute))
//! ```

pub mod dispatcher;
pub mod error;
pub mod notifier;
pub mod webhook;

pub use dispatcher::{Dispatcher, EventHandlers};
pub use error::{NotifyError, NotifyResult};
pub use notifier::{BoxFuture, NoopNotifier, Notifier, StatusEvent, StatusNotifier};
pub use webhook::WebhookNotifier;
