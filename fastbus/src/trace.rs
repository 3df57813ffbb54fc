//! Logging for fastbus.
//!
//! Enable with `--features tracing`. Without the feature every macro here
//! expands to an empty block, so the receive hot path carries no logging
//! cost and the macros stay usable wherever an expression is expected.

/// Installs a global subscriber with thread names and uptime stamps.
///
/// The filter is read from `RUST_LOG` and defaults to `fastbus=trace`.
/// Returns `false` when another subscriber is already installed, or when
/// the `tracing` feature is disabled.
#[cfg(feature = "tracing")]
pub fn init_tracing() -> bool {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fastbus=trace"));
    let layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(fmt::time::uptime());

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() -> bool {
    false
}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! disabled {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {
    disabled as debug, disabled as error, disabled as info, disabled as trace, disabled as warn,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_are_expressions() {
        let outcome: Result<u8, u8> = Err(3);
        match outcome {
            Ok(value) => debug!(value, "ok"),
            Err(code) => warn!(code, "failed"),
        }
        if outcome.is_err() {
            info!("branch")
        }
    }
}
