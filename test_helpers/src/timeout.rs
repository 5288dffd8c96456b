//! A wall-clock timeout wrapper for futures in tests, so a hung await fails
//! the test instead of hanging the suite.

use std::{future::Future, time::Duration};

use async_trait::async_trait;

/// Adds a `with_timeout()` method to all futures.
#[async_trait]
pub trait FutureTimeout: Future + Sized + Send {
    /// Await the receiver, panicking if it does not resolve within `duration`.
    async fn with_timeout_panic(self, duration: Duration) -> Self::Output
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self)
            .await
            .expect("timeout waiting for future")
    }

    /// Await the receiver for at most `duration`.
    async fn with_timeout(
        self,
        duration: Duration,
    ) -> Result<Self::Output, tokio::time::error::Elapsed>
    where
        Self::Output: Send,
    {
        tokio::time::timeout(duration, self).await
    }
}

#[async_trait]
impl<F> FutureTimeout for F where F: Future + Send {}
