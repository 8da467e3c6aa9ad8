//! Clock capability — isolates `now()` behind a trait so workflow and store
//! tests can run against deterministic timestamps instead of wall-clock time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait Clock: Send + Sync {
    async fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    async fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed or steppable clock for tests.
#[derive(Debug, Clone)]
pub struct FixedClock {
    inner: std::sync::Arc<parking_lot::Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            inner: std::sync::Arc::new(parking_lot::Mutex::new(at)),
        }
    }

    /// Advance the clock and return the new value.
    pub fn advance(&self, by: chrono::Duration) -> DateTime<Utc> {
        let mut guard = self.inner.lock();
        *guard += by;
        *guard
    }
}

#[async_trait]
impl Clock for FixedClock {
    async fn now(&self) -> DateTime<Utc> {
        *self.inner.lock()
    }
}
