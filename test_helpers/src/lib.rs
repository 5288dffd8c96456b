//! Helpers shared by the workspace's test suites.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use parking_lot::Once;

pub mod timeout;

pub use timeout::FutureTimeout;

static LOG_SETUP: Once = Once::new();

/// Enables debug logging if the RUST_LOG environment variable is set. Set
/// `RUST_LOG=trace` (or a more selective filter) before running a test to see
/// the service's output.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Start logging for a test, regardless of environment. Panics from duplicate
/// subscriber registration are swallowed so every test can call this freely.
pub fn start_logging() {
    // ensure the global has been initialized
    LOG_SETUP.call_once(|| {
        // honor any logging directives in RUST_LOG
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        // capture both log and tracing records
        tracing_log::LogTracer::init().expect("log tracer init");

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init()
            .ok();
    })
}
