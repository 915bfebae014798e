//! Aggregate statistics shapes shared by the store, the session and the viewers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-class count and mean confidence over a trailing window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassStatistics {
    #[serde(rename = "class")]
    pub class_name: String,
    pub count: u64,
    /// Rounded to 3 decimals.
    pub avg_confidence: f64,
}

/// Lifetime per-class metrics used by the batch report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    #[serde(rename = "class")]
    pub class_name: String,
    pub count: u64,
    pub avg_confidence: f64,
    pub max_confidence: f64,
    pub min_confidence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateStatistics {
    pub class_statistics: Vec<ClassStatistics>,
    pub total_detections: u64,
    /// `H:MM:SS`.
    pub session_duration: String,
    pub session_elapsed_secs: u64,
}

impl AggregateStatistics {
    pub fn new(class_statistics: Vec<ClassStatistics>, total_detections: u64, elapsed: Duration) -> Self {
        Self {
            class_statistics,
            total_detections,
            session_duration: format_duration(elapsed),
            session_elapsed_secs: elapsed.as_secs(),
        }
    }
}

pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formats_as_clock() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "1:02:05");
    }
}
