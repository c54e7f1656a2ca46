//! CheckRunner — the scheduling loop for one check.
//!
//! Each runner owns one background task that repeats
//! {run with retries → append → notify on change → sleep} until closed.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use watchpost_history::{HistoryStore, Observation};
use watchpost_notify::StatusNotifier;

use crate::check::CheckSpec;
use crate::error::CheckerResult;
use crate::probe::{cancelled, run_cycle};

pub struct CheckRunner {
    spec: Arc<CheckSpec>,
    store: HistoryStore,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl CheckRunner {
    pub fn new(spec: CheckSpec, store: HistoryStore) -> CheckerResult<Self> {
        spec.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            spec: Arc::new(spec),
            store,
            shutdown_tx,
            handle: None,
        })
    }

    pub fn spec(&self) -> &CheckSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Register the check with the store and start the loop.
    ///
    /// `notifier` hears about every completed cycle whose status differs
    /// from the previous entry. Calling `start` twice is a no-op.
    pub fn start(&mut self, notifier: Arc<dyn StatusNotifier>) {
        if self.handle.is_some() {
            return;
        }
        self.store.register_check(&self.spec.group, &self.spec.name);

        let spec = self.spec.clone();
        let store = self.store.clone();
        let shutdown = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(async move {
            run_loop(spec, store, notifier, shutdown).await;
        }));

        info!(
            group = %self.spec.group,
            name = %self.spec.name,
            interval = ?self.spec.interval,
            "check runner started"
        );
    }

    /// Ask the loop to stop without waiting for it.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Stop the loop and wait until it has exited.
    ///
    /// No appends happen for this check once `close` returns.
    pub async fn close(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(group = %self.spec.group, name = %self.spec.name, error = %e, "check runner task failed");
            }
        }
    }
}

async fn run_loop(
    spec: Arc<CheckSpec>,
    store: HistoryStore,
    notifier: Arc<dyn StatusNotifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let Some((observation, attempts)) = run_cycle(&spec, &mut shutdown).await else {
            break;
        };
        record(&spec, &store, notifier.as_ref(), observation, attempts).await;

        tokio::select! {
            _ = tokio::time::sleep(spec.interval) => {}
            _ = cancelled(&mut shutdown) => break,
        }
    }
    debug!(group = %spec.group, name = %spec.name, "check runner stopped");
}

async fn record(
    spec: &CheckSpec,
    store: &HistoryStore,
    notifier: &dyn StatusNotifier,
    observation: Observation,
    attempts: u32,
) {
    match store.append(observation).await {
        Ok(appended) => {
            let status = appended.item.status;
            info!(
                group = %spec.group,
                name = %spec.name,
                %status,
                attempts,
                error = %appended.item.error,
                "check completed"
            );
            if appended.changed() {
                notifier.notify(status, &spec.group, &spec.name);
            }
        }
        Err(e) => {
            error!(group = %spec.group, name = %spec.name, error = %e, "failed to record check result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use watchpost_core::Status;
    use watchpost_history::HistoryOptions;
    use watchpost_notify::{
        BoxFuture, Dispatcher, EventHandlers, Notifier, NotifyError, NotifyResult, StatusEvent,
    };

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<Status>>,
    }

    impl StatusNotifier for Recording {
        fn notify(&self, status: Status, _group: &str, _name: &str) {
            self.events.lock().unwrap().push(status);
        }
    }

    struct AlwaysFails;

    impl Notifier for AlwaysFails {
        fn execute<'a>(&'a self, _event: &'a StatusEvent) -> BoxFuture<'a, NotifyResult<()>> {
            Box::pin(async { Err(NotifyError::Request("endpoint is down".to_string())) })
        }

        fn describe(&self) -> String {
            "always fails".to_string()
        }
    }

    struct NeverReturns;

    impl Notifier for NeverReturns {
        fn execute<'a>(&'a self, _event: &'a StatusEvent) -> BoxFuture<'a, NotifyResult<()>> {
            Box::pin(std::future::pending())
        }

        fn describe(&self) -> String {
            "never returns".to_string()
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> HistoryStore {
        HistoryStore::open(HistoryOptions::new(dir.path().join("history.jsonl"))).unwrap()
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn counter() -> CheckSpec {
        CheckSpec::new("api", "requests", "echo 1")
            .metric("req")
            .every(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn loop_appends_every_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut runner = CheckRunner::new(counter(), store.clone()).unwrap();

        runner.start(Arc::new(Recording::default()));
        assert!(store.is_registered("api", "requests"));
        wait_for(|| store.series("api", "requests").len() >= 3).await;

        runner.close().await;
        assert!(!runner.is_running());
        let settled = store.series("api", "requests").len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.series("api", "requests").len(), settled);

        store.close().await;
    }

    #[tokio::test]
    async fn notifies_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let notifier = Arc::new(Recording::default());
        let mut runner = CheckRunner::new(counter(), store.clone()).unwrap();

        runner.start(notifier.clone());
        wait_for(|| store.series("api", "requests").len() >= 4).await;
        runner.close().await;

        assert_eq!(*notifier.events.lock().unwrap(), [Status::Healthy]);
        store.close().await;
    }

    #[tokio::test]
    async fn failing_check_persists_one_item_per_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let spec = CheckSpec::new("api", "errors", "exit 1")
            .metric("req")
            .every(Duration::from_secs(60))
            .retries(2, Duration::from_millis(5));
        let notifier = Arc::new(Recording::default());
        let mut runner = CheckRunner::new(spec, store.clone()).unwrap();

        runner.start(notifier.clone());
        wait_for(|| !store.series("api", "errors").is_empty()).await;
        runner.close().await;

        let series = store.series("api", "errors");
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].status, Status::Unhealthy);
        assert_eq!(*notifier.events.lock().unwrap(), [Status::Unhealthy]);
        store.close().await;
    }

    #[tokio::test]
    async fn broken_notifiers_do_not_delay_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let handlers = EventHandlers::new()
            .on(Status::Healthy, Arc::new(AlwaysFails))
            .on(Status::Unhealthy, Arc::new(AlwaysFails))
            .on(Status::Healthy, Arc::new(NeverReturns))
            .on(Status::Unhealthy, Arc::new(NeverReturns));
        let dispatcher = Arc::new(Dispatcher::new(handlers));

        // Alternates between success and failure so every cycle notifies.
        let flag = dir.path().join("flag");
        let script = format!(
            "if [ -e {0} ]; then rm {0}; exit 1; else touch {0}; echo 1; fi",
            flag.display()
        );
        let spec = CheckSpec::new("api", "flapping", &script)
            .metric("req")
            .every(Duration::from_millis(20))
            .retries(0, Duration::from_millis(1));
        let mut runner = CheckRunner::new(spec, store.clone()).unwrap();

        runner.start(dispatcher);
        wait_for(|| store.series("api", "flapping").len() >= 5).await;
        runner.close().await;
        store.close().await;
    }

    #[tokio::test]
    async fn close_interrupts_sleep_and_execution() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut sleeping = CheckRunner::new(
            CheckSpec::new("api", "idle", "true").every(Duration::from_secs(3600)),
            store.clone(),
        )
        .unwrap();
        let mut busy = CheckRunner::new(
            CheckSpec::new("api", "busy", "sleep 30").timeout(Duration::from_secs(60)),
            store.clone(),
        )
        .unwrap();

        sleeping.start(Arc::new(Recording::default()));
        busy.start(Arc::new(Recording::default()));
        wait_for(|| !store.series("api", "idle").is_empty()).await;

        let started = std::time::Instant::now();
        sleeping.close().await;
        busy.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(store.series("api", "busy").is_empty());
        store.close().await;
    }

    #[tokio::test]
    async fn append_failure_keeps_loop_alive() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let mut runner = CheckRunner::new(counter(), store.clone()).unwrap();

        store.close().await;
        runner.start(Arc::new(Recording::default()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runner.is_running());
        runner.close().await;
    }
}
