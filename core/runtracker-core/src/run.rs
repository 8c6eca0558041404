//! Domain types: runs and the location samples recorded during them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id of a run that has not been saved, and the "no current run" marker value.
pub const NO_RUN: i64 = -1;

/// A single tracked run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    /// Milliseconds since the Unix epoch.
    pub start_date: i64,
}

impl Run {
    /// An unsaved run starting now.
    pub fn new() -> Self {
        Self::with_start_date(now_millis())
    }

    /// An unsaved run with an explicit start date.
    pub fn with_start_date(start_date: i64) -> Self {
        Self {
            id: NO_RUN,
            start_date,
        }
    }

    pub fn set_start_date(&mut self, start_date: i64) {
        self.start_date = start_date;
    }

    pub fn is_saved(&self) -> bool {
        self.id != NO_RUN
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.start_date)
    }

    /// Whole seconds between the start date and `now_millis`.
    ///
    /// Negative when `now_millis` precedes the start; the division truncates
    /// toward zero.
    pub fn duration_seconds(&self, now_millis: i64) -> i64 {
        (now_millis - self.start_date) / 1000
    }
}

impl Default for Run {
    fn default() -> Self {
        Self::new()
    }
}

/// A geolocated fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    /// Fix time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Empty when the producer did not name one.
    #[serde(default)]
    pub provider: String,
    /// Owning run; set on samples read back from the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<i64>,
}

impl LocationSample {
    pub fn new(
        latitude: f64,
        longitude: f64,
        altitude: f64,
        timestamp: i64,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            timestamp,
            provider: provider.into(),
            run_id: None,
        }
    }

    /// Same fix, different timestamp.
    pub fn retimestamped(&self, timestamp: i64) -> Self {
        Self {
            timestamp,
            run_id: None,
            ..self.clone()
        }
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
