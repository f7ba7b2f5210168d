//! Time-boxed memoization of a single value

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Remembers one value for `ttl`.
///
/// A stored value is returned only while `now - stored_at < ttl`; after that
/// it is treated as unknown until refreshed.
#[derive(Debug, Clone)]
pub struct TtlCache<T> {
    entry: Option<(T, Instant)>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { entry: None, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The stored value, if it is still fresh
    pub fn get(&self) -> Option<T> {
        match &self.entry {
            Some((value, stored_at)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    pub fn put(&mut self, value: T) {
        self.entry = Some((value, Instant::now()));
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }

    /// Return the fresh value, or compute, store and return a new one.
    /// `force` skips the freshness check.
    pub async fn get_or_refresh<F, Fut>(&mut self, force: bool, refresh: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !force {
            if let Some(value) = self.get() {
                return value;
            }
        }

        let value = refresh().await;
        self.put(value.clone());
        value
    }
}
