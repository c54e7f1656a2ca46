//! Supervisor — owns the history store and every check runner.

use std::sync::Arc;

use tracing::info;
use watchpost_history::HistoryStore;
use watchpost_notify::StatusNotifier;

use crate::check::CheckSpec;
use crate::error::{CheckerError, CheckerResult};
use crate::runner::CheckRunner;

pub struct Supervisor {
    store: HistoryStore,
    notifier: Arc<dyn StatusNotifier>,
    runners: Vec<CheckRunner>,
}

impl Supervisor {
    pub fn new(store: HistoryStore, notifier: Arc<dyn StatusNotifier>) -> Self {
        Self {
            store,
            notifier,
            runners: Vec::new(),
        }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Validate `spec` and start a runner for it.
    pub fn start(&mut self, spec: CheckSpec) -> CheckerResult<()> {
        if self.runners.iter().any(|r| r.spec().key() == spec.key()) {
            return Err(CheckerError::Duplicate(spec.key()));
        }
        let mut runner = CheckRunner::new(spec, self.store.clone())?;
        runner.start(self.notifier.clone());
        self.runners.push(runner);
        Ok(())
    }

    /// Start every spec, stopping at the first invalid one.
    pub fn start_all(&mut self, specs: impl IntoIterator<Item = CheckSpec>) -> CheckerResult<usize> {
        let mut started = 0;
        for spec in specs {
            self.start(spec)?;
            started += 1;
        }
        Ok(started)
    }

    pub fn runner_count(&self) -> usize {
        self.runners.len()
    }

    /// Stop every runner, then close the store.
    pub async fn close(&mut self) {
        let runners = self.runners.len();
        for runner in &self.runners {
            runner.stop();
        }
        for runner in &mut self.runners {
            runner.close().await;
        }
        self.runners.clear();
        self.store.close().await;
        info!(runners, "supervisor stopped");
    }
}
