//! Routes status events to the handlers configured for them.
//!
//! Handlers come from two independent sets: global ones fire for every
//! check, per-group ones only for checks in that group. Each matching
//! handler runs on its own task with a timeout; the caller never waits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use watchpost_core::config::NotificationConfig;
use watchpost_core::{Status, WatchpostConfig};

use crate::error::{NotifyError, NotifyResult};
use crate::notifier::{Notifier, StatusEvent, StatusNotifier};
use crate::webhook::WebhookNotifier;

/// Upper bound on one handler run, on top of any timeout of its own.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(120);

/// Handlers keyed by the status that triggers them.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub on_success: Vec<Arc<dyn Notifier>>,
    pub on_failure: Vec<Arc<dyn Notifier>>,
    pub on_recovered: Vec<Arc<dyn Notifier>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build handlers from the three notification lists of a config scope.
    pub fn from_config(
        on_success: &[NotificationConfig],
        on_failure: &[NotificationConfig],
        on_recovered: &[NotificationConfig],
    ) -> NotifyResult<Self> {
        Ok(Self {
            on_success: build_notifiers(on_success)?,
            on_failure: build_notifiers(on_failure)?,
            on_recovered: build_notifiers(on_recovered)?,
        })
    }

    pub fn on(mut self, status: Status, notifier: Arc<dyn Notifier>) -> Self {
        match status {
            Status::Healthy => self.on_success.push(notifier),
            Status::Unhealthy => self.on_failure.push(notifier),
            Status::Recovered => self.on_recovered.push(notifier),
        }
        self
    }

    pub fn for_status(&self, status: Status) -> &[Arc<dyn Notifier>] {
        match status {
            Status::Healthy => &self.on_success,
            Status::Unhealthy => &self.on_failure,
            Status::Recovered => &self.on_recovered,
        }
    }

    pub fn len(&self) -> usize {
        self.on_success.len() + self.on_failure.len() + self.on_recovered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_notifiers(configs: &[NotificationConfig]) -> NotifyResult<Vec<Arc<dyn Notifier>>> {
    configs
        .iter()
        .map(|config| match &config.webhook {
            Some(webhook) => {
                let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::from_config(webhook)?);
                Ok(notifier)
            }
            None => Err(NotifyError::Invalid(
                "notification entry has no notifier configured".to_string(),
            )),
        })
        .collect()
}

/// The notification dispatcher handed to every check runner.
#[derive(Clone, Default)]
pub struct Dispatcher {
    global: EventHandlers,
    groups: HashMap<String, EventHandlers>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(global: EventHandlers) -> Self {
        Self {
            global,
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: &str, handlers: EventHandlers) -> Self {
        self.groups.insert(group.to_string(), handlers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Global handlers from the top level, one handler set per service.
    pub fn from_config(config: &WatchpostConfig) -> NotifyResult<Self> {
        let global =
            EventHandlers::from_config(&config.on_success, &config.on_failure, &config.on_recovered)?;
        let mut dispatcher = Self::new(global);
        for (group, service) in &config.services {
            let handlers = EventHandlers::from_config(
                &service.on_success,
                &service.on_failure,
                &service.on_recovered,
            )?;
            if !handlers.is_empty() {
                dispatcher = dispatcher.with_group(group, handlers);
            }
        }
        Ok(dispatcher)
    }

    /// Total number of configured handlers across all scopes.
    pub fn handler_count(&self) -> usize {
        self.global.len() + self.groups.values().map(EventHandlers::len).sum::<usize>()
    }

    /// Fire every handler matching `status` for `group`.
    ///
    /// Returns the number of handlers started. Needs a tokio runtime; with
    /// none available nothing fires.
    pub fn dispatch(&self, status: Status, group: &str, name: &str) -> usize {
        let group_handlers = self
            .groups
            .get(group)
            .map(|h| h.for_status(status))
            .unwrap_or_default();
        let handlers: Vec<_> = self
            .global
            .for_status(status)
            .iter()
            .chain(group_handlers)
            .cloned()
            .collect();

        if handlers.is_empty() {
            return 0;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%group, %name, %status, "no async runtime, notification dropped");
            return 0;
        };

        let event = StatusEvent::new(status, group, name);
        let timeout = self.timeout.unwrap_or(DEFAULT_HANDLER_TIMEOUT);
        debug!(%group, %name, %status, handlers = handlers.len(), "dispatching notifications");

        let fired = handlers.len();
        for handler in handlers {
            let event = event.clone();
            runtime.spawn(async move {
                let result = tokio::time::timeout(timeout, handler.execute(&event))
                    .await
                    .unwrap_or(Err(NotifyError::Timeout(timeout)));
                if let Err(e) = result {
                    warn!(
                        group = %event.group,
                        name = %event.name,
                        status = %event.status,
                        handler = %handler.describe(),
                        error = %e,
                        "notification failed"
                    );
                }
            });
        }
        fired
    }
}

impl StatusNotifier for Dispatcher {
    fn notify(&self, status: Status, group: &str, name: &str) {
        self.dispatch(status, group, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Recorder {
        label: &'static str,
        tx: mpsc::UnboundedSender<(&'static str, StatusEvent)>,
    }

    impl Notifier for Recorder {
        fn execute<'a>(&'a self, event: &'a StatusEvent) -> BoxFuture<'a, NotifyResult<()>> {
            Box::pin(async move {
                let _ = self.tx.send((self.label, event.clone()));
                Ok(())
            })
        }

        fn describe(&self) -> String {
            self.label.to_string()
        }
    }

    struct Failing {
        calls: Arc<AtomicUsize>,
    }

    impl Notifier for Failing {
        fn execute<'a>(&'a self, _event: &'a StatusEvent) -> BoxFuture<'a, NotifyResult<()>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(NotifyError::Request("boom".to_string()))
            })
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    struct Hanging;

    impl Notifier for Hanging {
        fn execute<'a>(&'a self, _event: &'a StatusEvent) -> BoxFuture<'a, NotifyResult<()>> {
            Box::pin(std::future::pending())
        }

        fn describe(&self) -> String {
            "hanging".to_string()
        }
    }

    fn recorder(
        label: &'static str,
        tx: &mpsc::UnboundedSender<(&'static str, StatusEvent)>,
    ) -> Arc<dyn Notifier> {
        Arc::new(Recorder {
            label,
            tx: tx.clone(),
        })
    }

    #[tokio::test]
    async fn routes_by_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            EventHandlers::new()
                .on(Status::Unhealthy, recorder("failure", &tx))
                .on(Status::Recovered, recorder("recovered", &tx)),
        );

        assert_eq!(dispatcher.dispatch(Status::Healthy, "api", "up"), 0);
        assert_eq!(dispatcher.dispatch(Status::Unhealthy, "api", "up"), 1);
        let (label, event) = rx.recv().await.unwrap();
        assert_eq!(label, "failure");
        assert_eq!(event, StatusEvent::new(Status::Unhealthy, "api", "up"));

        assert_eq!(dispatcher.dispatch(Status::Recovered, "api", "up"), 1);
        assert_eq!(rx.recv().await.unwrap().0, "recovered");
    }

    #[tokio::test]
    async fn group_handlers_only_fire_for_their_group() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher =
            Dispatcher::new(EventHandlers::new().on(Status::Unhealthy, recorder("global", &tx)))
                .with_group(
                    "db",
                    EventHandlers::new().on(Status::Unhealthy, recorder("db", &tx)),
                );

        assert_eq!(dispatcher.dispatch(Status::Unhealthy, "api", "up"), 1);
        assert_eq!(rx.recv().await.unwrap().0, "global");

        assert_eq!(dispatcher.dispatch(Status::Unhealthy, "db", "replication"), 2);
        let mut labels = vec![rx.recv().await.unwrap().0, rx.recv().await.unwrap().0];
        labels.sort_unstable();
        assert_eq!(labels, ["db", "global"]);
        assert_eq!(dispatcher.handler_count(), 2);
    }

    #[tokio::test]
    async fn failures_are_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            EventHandlers::new()
                .on(Status::Unhealthy, Arc::new(Failing { calls: calls.clone() }))
                .on(Status::Unhealthy, recorder("after", &tx)),
        );

        dispatcher.notify(Status::Unhealthy, "api", "up");
        dispatcher.notify(Status::Unhealthy, "api", "up");

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatch_does_not_wait_for_handlers() {
        let handlers = EventHandlers::new().on(Status::Unhealthy, Arc::new(Hanging));
        let dispatcher = Dispatcher::new(handlers).with_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        assert_eq!(dispatcher.dispatch(Status::Unhealthy, "api", "up"), 1);
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn without_runtime_nothing_fires() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher =
            Dispatcher::new(EventHandlers::new().on(Status::Unhealthy, recorder("x", &tx)));
        assert_eq!(dispatcher.dispatch(Status::Unhealthy, "api", "up"), 0);
    }

    #[test]
    fn builds_from_config() {
        let config = WatchpostConfig::from_toml_str(
            r#"
            db = "history.jsonl"

            [[on_failure]]
            webhook = { url = "http://localhost:9000/global", method = "post" }

            [services.api]
            checks = [{ name = "up", cmd = "true" }]

            [[services.api.on_recovered]]
            webhook = { url = "https://hooks.example.com/api" }

            [services.db]
            checks = [{ name = "replication", cmd = "true" }]
            "#,
        )
        .unwrap();

        let dispatcher = Dispatcher::from_config(&config).unwrap();
        assert_eq!(dispatcher.handler_count(), 2);
        assert!(dispatcher.groups.contains_key("api"));
        assert!(!dispatcher.groups.contains_key("db"));
        assert_eq!(
            dispatcher.global.on_failure[0].describe(),
            "webhook POST http://localhost:9000/global"
        );
    }
}
