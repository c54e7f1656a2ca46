//! Check definitions as the runner sees them.

use std::time::Duration;

use watchpost_core::config::{
    CheckDefinition, DEFAULT_INTERVAL, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_INTERVAL,
    DEFAULT_TIMEOUT,
};
use watchpost_core::{CheckKey, CheckKind};

use crate::error::{CheckerError, CheckerResult};

pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Everything needed to run one check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckSpec {
    pub group: String,
    pub name: String,
    pub kind: CheckKind,
    /// Script passed to `<shell> -e -c`.
    pub command: String,
    pub shell: String,
    pub interval: Duration,
    /// Bound on one execution.
    pub timeout: Duration,
    /// Extra attempts after a failed one, per cycle.
    pub max_retries: u32,
    pub retry_interval: Duration,
    /// Required for metric checks, ignored otherwise.
    pub metric_unit: Option<String>,
}

impl CheckSpec {
    /// A boolean check with the stock defaults.
    pub fn new(group: &str, name: &str, command: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            kind: CheckKind::Boolean,
            command: command.to_string(),
            shell: DEFAULT_SHELL.to_string(),
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            metric_unit: None,
        }
    }

    pub fn from_definition(group: &str, shell: &str, definition: &CheckDefinition) -> Self {
        Self {
            group: group.to_string(),
            name: definition.name.clone(),
            kind: definition.kind,
            command: definition.command.clone(),
            shell: shell.to_string(),
            interval: definition.interval,
            timeout: definition.timeout,
            max_retries: definition.max_retries,
            retry_interval: definition.retry_interval,
            metric_unit: definition.metric_unit.clone(),
        }
    }

    pub fn metric(mut self, unit: &str) -> Self {
        self.kind = CheckKind::Metric;
        self.metric_unit = Some(unit.to_string());
        self
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retries(mut self, max_retries: u32, retry_interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = retry_interval;
        self
    }

    pub fn shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }

    pub fn key(&self) -> CheckKey {
        CheckKey::new(&self.group, &self.name)
    }

    pub fn validate(&self) -> CheckerResult<()> {
        let invalid = |reason: &str| CheckerError::InvalidCheck {
            key: self.key(),
            reason: reason.to_string(),
        };

        if self.group.is_empty() || self.name.is_empty() {
            return Err(invalid("group and name are required"));
        }
        if self.command.trim().is_empty() {
            return Err(invalid("command is empty"));
        }
        if self.interval.is_zero() {
            return Err(invalid("interval must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be greater than zero"));
        }
        let has_unit = self.metric_unit.as_deref().is_some_and(|u| !u.is_empty());
        match self.kind {
            CheckKind::Metric if !has_unit => Err(invalid("metric checks require a unit")),
            CheckKind::Boolean if has_unit => Err(invalid("only metric checks take a unit")),
            _ => Ok(()),
        }
    }
}
