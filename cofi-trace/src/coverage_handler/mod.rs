//! Coverage sinks fed by the trace follower.

#[cfg(feature = "fuzz_bitmap")]
pub mod fuzz_bitmap;
mod log;

pub use self::log::LogCoverageHandler;

/// Coverage handler receiving every reconstructed instruction pointer.
///
/// This is the sole coverage signal the follower produces: one callback per
/// observed edge destination, in strict execution order.
pub trait HandleCoverage {
    /// Error of the coverage handler
    type Error: std::error::Error;

    /// Callback for one reconstructed instruction pointer.
    ///
    /// Suggest marking `#[inline]` on the implementation
    fn on_block(&mut self, ip: u64) -> Result<(), Self::Error>;
}
