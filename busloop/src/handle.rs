//! Single-owner wrapper around a raw bus resource.

use crate::bus::{Bus, BusResult, Errno};

/// Owns exactly one opened [`Bus`] and releases it exactly once.
///
/// Release flushes pending outbound data, then unregisters from the bus,
/// then frees the resource. Releasing again is a no-op; dropping an
/// unreleased handle releases it.
pub struct BusHandle {
    bus: Option<Box<dyn Bus>>,
}

impl BusHandle {
    pub fn new(bus: Box<dyn Bus>) -> Self {
        BusHandle { bus: Some(bus) }
    }

    pub fn is_released(&self) -> bool {
        self.bus.is_none()
    }

    /// The live resource, `ENOTCONN` once released.
    pub fn get(&self) -> BusResult<&(dyn Bus + 'static)> {
        self.bus.as_deref().ok_or(Errno::ENOTCONN)
    }

    pub fn get_mut(&mut self) -> BusResult<&mut (dyn Bus + 'static)> {
        self.bus.as_deref_mut().ok_or(Errno::ENOTCONN)
    }

    /// Flush, unregister, free. Returns the flush failure, if any; the
    /// resource is released either way.
    pub fn release(&mut self) -> BusResult<()> {
        let mut bus = match self.bus.take() {
            Some(bus) => bus,
            None => return Ok(()),
        };
        let flushed = bus.flush();
        bus.close();
        drop(bus);
        flushed
    }
}

impl Drop for BusHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn_flush_failed(e);
        }
    }
}

fn warn_flush_failed(e: Errno) {
    tracing::warn!(error = %e, "outbound data lost while releasing bus");
}
