//! Transport layer for bus I/O abstraction

use crate::error::Result;

mod serial;
pub use serial::SerialTransport;

mod simulated;
pub use simulated::SimulatedBus;

/// Byte transport underneath the bus server
pub trait Transport: Send {
    /// Read available bytes into buffer, returns 0 on timeout
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write all bytes of a frame
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flush pending writes
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop stale input before a new request
    fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }

    /// Human-readable name for logs
    fn name(&self) -> String;
}
