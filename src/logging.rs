//! Structured logging setup for the server binary.
//!
//! An env-filter-plus-formatting-layer subscriber setup, without a
//! Bunyan/JSON layer since this crate has no HTTP-facing service to feed.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs a global `tracing` subscriber reading its filter from the `LOG`
/// environment variable (falling back to `info`). Idempotent: a second call
/// in the same process is a no-op, which keeps tests that call it safe to
/// run alongside each other.
pub fn init_tracing() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    let env_filter = EnvFilter::try_from_env("LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_target(true);

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);

    if subscriber.try_init().is_err() {
        // another subscriber already installed (e.g. by a test harness); leave it be.
    }
}
