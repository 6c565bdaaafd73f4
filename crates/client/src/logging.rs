//! Logging for the chat core.
//!
//! Every component logs through the `log_*` macros so chat output shares one
//! `tracing` target and can be filtered with `RUST_LOG=chat=debug`.

#[doc(hidden)]
pub use tracing as __tracing;

/// Install a `tracing-subscriber` formatter. `RUST_LOG` overrides `default_filter`.
pub fn init(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A subscriber may already be installed (tests, embedding hosts).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Log an info message
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::info!(target: "chat", $($arg)*)
    };
}

/// Log an error message
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::error!(target: "chat", $($arg)*)
    };
}

/// Log a warning message
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::warn!(target: "chat", $($arg)*)
    };
}

/// Log a debug message
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logging::__tracing::debug!(target: "chat", $($arg)*)
    };
}
