//! Coverage handler that logs.

use super::HandleCoverage;

/// Coverage handler that logs every reconstructed instruction pointer.
#[derive(Default)]
pub struct LogCoverageHandler {}

impl HandleCoverage for LogCoverageHandler {
    // Logging does not produce high-level errors
    type Error = std::convert::Infallible;

    fn on_block(&mut self, ip: u64) -> Result<(), Self::Error> {
        log::trace!("Block {ip:#x} executed");
        Ok(())
    }
}
