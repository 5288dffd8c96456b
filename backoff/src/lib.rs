//! Bounded exponential backoff with jitter, used wherever the controller
//! polls or retries a slow collaborator (catalog at startup, replica
//! lifecycle phases).

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

// Workaround for "unused crate" lint false positives.
use workspace_hack as _;

use std::ops::ControlFlow;
use std::time::Duration;

use observability_deps::tracing::warn;
use rand::prelude::*;
use snafu::Snafu;

/// Exponential backoff with jitter
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Total duration after which retries stop and the last error is
    /// surfaced. `None` retries forever.
    pub deadline: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(500),
            base: 3.0,
            deadline: None,
        }
    }
}

/// Error after the deadline is exceeded.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum BackoffError<E>
where
    E: std::error::Error + 'static,
{
    #[snafu(display("Retry did not succeed within {deadline:?}: {source}"))]
    DeadlineExceeded { deadline: Duration, source: E },
}

/// Backoff result.
pub type BackoffResult<T, E> = Result<T, BackoffError<E>>;

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff
/// interval, bounded by the configured maximum.
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    total: f64,
    deadline: Option<f64>,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .field("total", &self.total)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`].
    ///
    /// # Panic
    ///
    /// Panics if the config is invalid, e.g. a non-positive base.
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`, used for testing with
    /// a deterministic generator.
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        assert!(init_backoff.is_finite() && init_backoff >= 0.0, "invalid init backoff");
        let max_backoff = config.max_backoff.as_secs_f64();
        assert!(
            max_backoff.is_finite() && max_backoff >= init_backoff,
            "invalid max backoff"
        );
        assert!(config.base.is_finite() && config.base >= 1.0, "invalid base");

        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: max_backoff,
            base: config.base,
            total: 0.0,
            deadline: config.deadline.map(|d| d.as_secs_f64()),
            rng,
        }
    }

    /// Fade this backoff over to a different backoff config, keeping the
    /// accumulated total so an existing deadline keeps counting down.
    pub fn fade_to(&mut self, config: &BackoffConfig) {
        let mut new = Self::new(config);
        new.total = self.total;
        new.rng = self.rng.take();
        *self = new;
    }

    /// Returns the next backoff duration to wait for, if any.
    ///
    /// `None` means the deadline has been reached.
    pub fn next(&mut self) -> Option<Duration> {
        if let Some(deadline) = self.deadline {
            if self.total >= deadline {
                return None;
            }
        }

        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        // a base of 1.0 leaves nothing to jitter over
        let rand_backoff = if range.is_empty() {
            self.init_backoff
        } else {
            match self.rng.as_mut() {
                Some(rng) => rng.gen_range(range),
                None => thread_rng().gen_range(range),
            }
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        self.total += next_backoff;
        Some(Duration::from_secs_f64(std::mem::replace(
            &mut self.next_backoff_secs,
            next_backoff,
        )))
    }

    /// Perform an async operation that retries with this backoff.
    pub async fn retry_all_errors<F, F1, B, E>(
        &mut self,
        task_name: &str,
        do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (Fn() -> F1) + Send + Sync,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        E: std::error::Error + Send + 'static,
    {
        self.retry_with_backoff(task_name, || async {
            match do_stuff().await {
                Ok(b) => ControlFlow::Break(Ok(b)),
                Err(e) => ControlFlow::Continue(e),
            }
        })
        .await
    }

    /// Perform an async operation that retries with this backoff, where the
    /// operation decides per attempt whether the error is retryable.
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        task_name: &str,
        do_stuff: F,
    ) -> BackoffResult<B, E>
    where
        F: (Fn() -> F1) + Send + Sync,
        F1: std::future::Future<Output = ControlFlow<Result<B, E>, E>> + Send,
        E: std::error::Error + Send + 'static,
    {
        loop {
            // split match statement from `tokio::time::sleep` so we don't
            // hold the future across the await point
            let e = match do_stuff().await {
                // terminal outcome, success or not
                ControlFlow::Break(res) => {
                    return res.map_err(|e| BackoffError::DeadlineExceeded {
                        deadline: Duration::from_secs_f64(self.total),
                        source: e,
                    })
                }
                ControlFlow::Continue(e) => e,
            };

            let backoff = match self.next() {
                Some(backoff) => backoff,
                None => {
                    return Err(BackoffError::DeadlineExceeded {
                        deadline: Duration::from_secs_f64(self.deadline.unwrap_or_default()),
                        source: e,
                    });
                }
            };

            warn!(
                error = %e,
                task_name,
                backoff_secs = backoff.as_secs(),
                "request encountered non-fatal error - backing off",
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
