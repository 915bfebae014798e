//! Class-specific confidence policy.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const DEFAULT_THRESHOLD: f32 = 0.6;

/// Immutable threshold table. Swapped as a whole on reload.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicyTable {
    pub thresholds: HashMap<String, f32>,
    pub default_threshold: f32,
}

impl PolicyTable {
    pub fn threshold(&self, class_name: &str) -> f32 {
        self.thresholds
            .get(class_name)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

/// Process-wide policy mapping class names to minimum acceptance confidence.
///
/// Readers take an `Arc` snapshot of the current table, so a concurrent
/// `reload` can never expose a half-written map.
#[derive(Debug)]
pub struct ConfidencePolicy {
    table: RwLock<Arc<PolicyTable>>,
}

impl ConfidencePolicy {
    pub fn new(thresholds: HashMap<String, f32>, default_threshold: f32) -> Self {
        Self {
            table: RwLock::new(Arc::new(PolicyTable {
                thresholds,
                default_threshold,
            })),
        }
    }

    pub fn threshold(&self, class_name: &str) -> f32 {
        self.snapshot().threshold(class_name)
    }

    /// Current table. Hold on to it for the duration of one detection pass.
    pub fn snapshot(&self) -> Arc<PolicyTable> {
        match self.table.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the whole table.
    pub fn reload(&self, thresholds: HashMap<String, f32>, default_threshold: f32) {
        let next = Arc::new(PolicyTable {
            thresholds,
            default_threshold,
        });
        match self.table.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        log::info!("confidence policy reloaded (default={:.2})", default_threshold);
    }
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self::new(HashMap::new(), DEFAULT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn policy() -> ConfidencePolicy {
        ConfidencePolicy::new(
            HashMap::from([("person".to_string(), 0.7), ("knife".to_string(), 0.5)]),
            0.6,
        )
    }

    #[test]
    fn listed_classes_use_their_threshold() {
        let policy = policy();
        assert_eq!(policy.threshold("person"), 0.7);
        assert_eq!(policy.threshold("knife"), 0.5);
    }

    #[test]
    fn unlisted_classes_fall_back_to_default() {
        let policy = policy();
        for class in ["car", "dog", "", "Person"] {
            assert_eq!(policy.threshold(class), 0.6, "class {class:?}");
        }
    }

    #[test]
    fn reload_replaces_whole_table() {
        let policy = policy();
        let before = policy.snapshot();
        policy.reload(HashMap::from([("car".to_string(), 0.9)]), 0.4);

        assert_eq!(policy.threshold("car"), 0.9);
        assert_eq!(policy.threshold("person"), 0.4);
        // An in-flight pass keeps the table it started with.
        assert_eq!(before.threshold("person"), 0.7);
    }

    #[test]
    fn readers_never_see_partial_tables() {
        let policy = Arc::new(policy());
        let writer = {
            let policy = policy.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let value = if i % 2 == 0 { 0.1 } else { 0.9 };
                    policy.reload(
                        HashMap::from([("a".to_string(), value), ("b".to_string(), value)]),
                        value,
                    );
                }
            })
        };
        for _ in 0..200 {
            let table = policy.snapshot();
            if table.thresholds.contains_key("a") {
                assert_eq!(table.threshold("a"), table.threshold("b"));
                assert_eq!(table.threshold("a"), table.default_threshold);
            }
        }
        writer.join().unwrap();
    }
}
