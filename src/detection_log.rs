use std::collections::VecDeque;
use std::sync::Mutex;

use crate::detect::Detection;

/// Bounded ring of the most recent detections. Oldest entries are evicted first.
///
/// Display-only; the store is authoritative.
#[derive(Debug)]
pub struct DetectionLog {
    capacity: usize,
    entries: Mutex<VecDeque<Detection>>,
}

impl DetectionLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn extend(&self, detections: &[Detection]) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for det in detections {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(det.clone());
        }
    }

    /// Up to `n` newest entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Detection> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        match self.entries.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use chrono::Utc;

    fn det(i: usize) -> Detection {
        Detection {
            class_name: format!("c{}", i),
            confidence: 0.9,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            timestamp: Utc::now(),
            source: "webcam".into(),
        }
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let log = DetectionLog::new(3);
        log.extend(&(0..5).map(det).collect::<Vec<_>>());
        let names: Vec<String> = log.recent(10).into_iter().map(|d| d.class_name).collect();
        assert_eq!(names, vec!["c2", "c3", "c4"]);
    }

    #[test]
    fn recent_returns_newest_slice() {
        let log = DetectionLog::new(50);
        log.extend(&(0..30).map(det).collect::<Vec<_>>());
        let recent = log.recent(20);
        assert_eq!(recent.len(), 20);
        assert_eq!(recent[0].class_name, "c10");
        assert_eq!(recent[19].class_name, "c29");
    }

    #[test]
    fn clear_empties_the_ring() {
        let log = DetectionLog::new(5);
        log.extend(&[det(1)]);
        log.clear();
        assert!(log.is_empty());
    }
}
