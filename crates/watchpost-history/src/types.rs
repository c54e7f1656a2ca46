//! Domain types for the history store.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use watchpost_core::{CheckKey, CheckKind, Status};

use crate::clock::DAY_MS;

/// The outcome of one probe run, as submitted by a check runner.
///
/// Everything the store derives (`created_at`, `seq`, `id`, the final
/// status) is left out; the store turns an observation into an [`Item`].
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub group: String,
    pub name: String,
    pub kind: CheckKind,
    /// Combined stdout + stderr of the probe.
    pub output: Vec<u8>,
    pub duration: Duration,
    pub metric_value: Option<f64>,
    pub metric_unit: Option<String>,
    /// Raw outcome. `Recovered` is decided by the store, never by callers.
    pub status: Status,
    pub error: String,
}

impl Observation {
    /// A successful observation with no output.
    pub fn healthy(group: &str, name: &str, kind: CheckKind) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            kind,
            output: Vec::new(),
            duration: Duration::ZERO,
            metric_value: None,
            metric_unit: None,
            status: Status::Healthy,
            error: String::new(),
        }
    }

    /// A failed observation carrying an error message.
    pub fn unhealthy(group: &str, name: &str, kind: CheckKind, error: &str) -> Self {
        Self {
            status: Status::Unhealthy,
            error: error.to_string(),
            ..Self::healthy(group, name, kind)
        }
    }

    pub fn with_output(mut self, output: impl Into<Vec<u8>>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_metric(mut self, value: f64, unit: &str) -> Self {
        self.metric_value = Some(value);
        self.metric_unit = Some(unit.to_string());
        self
    }

    pub fn key(&self) -> CheckKey {
        CheckKey::new(&self.group, &self.name)
    }
}

/// One persisted observation of one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Durable identity within the series; derived, never persisted.
    pub id: String,
    /// Store-wide append sequence number.
    pub seq: u64,
    pub group: String,
    pub name: String,
    pub kind: CheckKind,
    pub output: String,
    /// Unix milliseconds, assigned by the store.
    pub created_at: u64,
    pub duration_ms: u64,
    pub metric_value: Option<f64>,
    pub metric_unit: String,
    pub status: Status,
    pub error: String,
}

impl Item {
    /// Derive the durable id for this item.
    ///
    /// Booleans share one slot per UTC day; metrics get one id per append.
    pub fn derive_id(&self) -> String {
        match self.kind {
            CheckKind::Boolean => format!(
                "{}\0{}\0{}",
                self.group,
                self.name,
                self.created_at / DAY_MS
            ),
            CheckKind::Metric => format!(
                "{}\0{}\0{}\0{}",
                self.group, self.name, self.created_at, self.seq
            ),
        }
    }

    /// Ordering key within a series.
    pub fn order_key(&self) -> (u64, u64) {
        (self.created_at, self.seq)
    }

    pub fn key(&self) -> CheckKey {
        CheckKey::new(&self.group, &self.name)
    }

    pub fn belongs_to(&self, group: &str, name: &str) -> bool {
        self.group == group && self.name == name
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} [{}] {} at {}",
            self.group, self.name, self.kind, self.status, self.created_at
        )?;
        if let Some(value) = self.metric_value {
            write!(f, " value={value}{}", self.metric_unit)?;
        }
        if !self.error.is_empty() {
            write!(f, " error={:?}", self.error)?;
        }
        Ok(())
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    /// The item as stored.
    pub item: Item,
    /// Status of the most recent entry of the series before this append.
    pub previous: Option<Status>,
}

impl Appended {
    /// True when the stored status differs from the last known one.
    pub fn changed(&self) -> bool {
        self.previous != Some(self.item.status)
    }
}
