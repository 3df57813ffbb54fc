//! Degraded path: pass-through to the transport's blocking receive.

use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::ReceiveError;
use crate::frame::Frame;
use crate::transport::BusTransport;

/// Serializes callers onto the single transport handle. A caller blocked in
/// `receive` holds the handle for at most its own timeout.
pub(crate) struct DegradedPath {
    transport: Mutex<Box<dyn BusTransport>>,
}

impl DegradedPath {
    pub(crate) fn new(transport: Box<dyn BusTransport>) -> Self {
        Self {
            transport: Mutex::new(transport),
        }
    }

    pub(crate) fn resume(&self) -> io::Result<()> {
        self.transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resume()
    }

    pub(crate) fn receive(&self, timeout: Duration) -> Result<Option<Frame>, ReceiveError> {
        let mut transport = self
            .transport
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(transport.blocking_receive(timeout)?)
    }
}
