//! Construction-time choice between the fast and degraded paths.

use crate::config::BusConfig;
use crate::error::{DegradeCause, OpenError, Rejection};
use crate::trace::{debug, info};
use crate::transport::{Backend, BusTransport};

use super::AdaptiveReceiver;
use super::fast::FastPath;

/// Opens a receiver for `config` on `backend`.
///
/// Eligible parameters get a fast-mode receiver. If the backend rejects them
/// while opening the fast path, the partially opened handles are closed and
/// a degraded receiver is built from the same parameters. Ineligible
/// parameters go straight to degraded mode without allocating a fast path.
///
/// # Errors
///
/// Returns [`OpenError::Io`] if a device cannot be opened or the poll thread
/// cannot be spawned, and [`OpenError::Rejected`] only if the degraded
/// transport itself refuses the parameters.
pub fn create<B: Backend>(backend: &B, config: BusConfig) -> Result<AdaptiveReceiver, OpenError> {
    if let Err(rejection) = config.fast_eligibility() {
        debug!(channel = %config.channel, reason = %rejection, "fast path not eligible");
        return open_degraded(backend, config, rejection);
    }

    match open_fast(backend, &config) {
        Ok((transport, fast)) => {
            info!(
                channel = %config.channel,
                capacity = config.fast.capacity,
                overflow = ?config.fast.overflow,
                deferred = config.fast.defer_start,
                "receiver opened in fast mode"
            );
            Ok(AdaptiveReceiver::new_fast(config, transport, fast))
        }
        Err(OpenError::Rejected(rejection)) => {
            info!(channel = %config.channel, reason = %rejection, "fast path rejected by backend");
            open_degraded(backend, config, rejection)
        }
        Err(e) => Err(e),
    }
}

/// Opens and parks the transport, opens the primitive and starts the poll
/// thread unless deferred. Anything opened is closed again on failure.
fn open_fast<B: Backend>(
    backend: &B,
    config: &BusConfig,
) -> Result<(Box<dyn BusTransport>, FastPath), OpenError> {
    let mut transport = backend.open_transport(config)?;
    transport.park()?;
    let primitive = backend.open_fast(config)?;

    let mut fast = FastPath::new(Box::new(primitive), &config.fast, &config.channel);
    if !config.fast.defer_start {
        fast.start()?;
    }
    Ok((Box::new(transport), fast))
}

fn open_degraded<B: Backend>(
    backend: &B,
    config: BusConfig,
    rejection: Rejection,
) -> Result<AdaptiveReceiver, OpenError> {
    let transport = backend.open_transport(&config)?;
    info!(channel = %config.channel, "receiver opened in degraded mode");
    Ok(AdaptiveReceiver::new_degraded(
        config,
        Box::new(transport),
        DegradeCause::Ineligible(rejection),
    ))
}
