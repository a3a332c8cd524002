use std::ops::{Deref, DerefMut};

use crate::cache::RewardCache;
use crate::oracle::OracleEvaluator;
use crate::types::CacheError;

/// Owns a [`RewardCache`] for the duration of a training run and rewrites it
/// when dropped.
///
/// Wrap the RL loop's cache in this guard: the drop runs on normal return, on
/// an early `?` return and while unwinding from a panic, so outcomes already
/// paid for reach disk. Call [`finish`](Self::finish) on the happy path to
/// see persistence errors instead of having them logged.
pub struct CacheFlushGuard<O: OracleEvaluator> {
    cache: RewardCache<O>,
}

impl<O: OracleEvaluator> CacheFlushGuard<O> {
    pub fn new(cache: RewardCache<O>) -> Self {
        Self { cache }
    }

    /// Rewrite now, reporting errors. Dropping afterwards is a no-op unless
    /// new entries arrive in between.
    pub fn finish(&mut self) -> Result<bool, CacheError> {
        self.cache.rewrite()
    }
}

impl<O: OracleEvaluator> Deref for CacheFlushGuard<O> {
    type Target = RewardCache<O>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl<O: OracleEvaluator> DerefMut for CacheFlushGuard<O> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cache
    }
}

impl<O: OracleEvaluator> Drop for CacheFlushGuard<O> {
    fn drop(&mut self) {
        let pending = self.cache.stats().pending;
        if pending == 0 {
            return;
        }
        match self.cache.rewrite() {
            Ok(_) => tracing::info!(
                pending,
                path = %self.cache.path().display(),
                "Flushed reward cache on exit"
            ),
            Err(e) => tracing::error!(
                error = %e,
                pending,
                path = %self.cache.path().display(),
                "Failed to flush reward cache on exit"
            ),
        }
    }
}
