//! Business reference generation.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Generator of unique business references for messages and aggregates.
pub trait ReferenceGenerator: Send + Sync {
    /// Produce the next reference with the given prefix, e.g. `GTR`.
    fn next(&self, prefix: &str) -> String;
}

/// Counter-based generator: `PREFIX-RRRR-NNNNNN`.
///
/// The random run component keeps references from colliding across
/// process restarts; the counter keeps them unique and ordered within
/// a run.
pub struct CounterReferenceGenerator {
    run: String,
    counter: AtomicU64,
}

impl CounterReferenceGenerator {
    pub fn new() -> Self {
        let run: u16 = rand::thread_rng().r#gen();
        Self {
            run: format!("{run:04X}"),
            counter: AtomicU64::new(1),
        }
    }
}

impl Default for CounterReferenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceGenerator for CounterReferenceGenerator {
    fn next(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}-{}-{n:06}", self.run)
    }
}
