//! This module contains definition of errors made when reconstructing traces
//! with [`Disassembler`][crate::Disassembler].

use perfect_derive::perfect_derive;
use thiserror::Error;

use crate::{HandleCoverage, ReadMemory};

/// Error for session creation
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpenError {
    /// The lower bound of the monitored range exceeds the upper bound
    #[error("Invalid monitored range: min {min:#x} exceeds max {max:#x}")]
    InvalidRange {
        /// Lower bound requested
        min: u64,
        /// Upper bound requested
        max: u64,
    },
    /// The monitored range exceeds the supported span
    #[error("Monitored range of {span:#x} bytes exceeds the 128 MiB limit")]
    RangeTooLarge {
        /// Requested span in bytes
        span: u64,
    },
}

/// Fatal error during graph building or trace following.
///
/// Recoverable trace verdicts (TNT underflow, inconsistent streams) are
/// reported through the boolean returned by
/// [`trace`][crate::Disassembler::trace]; an `Err` means the session hit a
/// condition it cannot continue from.
#[derive(Error)]
#[perfect_derive(Debug)]
#[non_exhaustive]
pub enum DisassemblerError<H: HandleCoverage, R: ReadMemory> {
    /// Coverage handler error
    #[error("Coverage handler error")]
    CoverageHandler(#[source] H::Error),
    /// Memory reader error
    #[error("Memory reader error")]
    MemoryReader(#[source] R::Error),
    /// No instruction could be disassembled behind `addr`, even across the
    /// page boundary
    #[error("No decodable fall-through after {addr:#x}")]
    MissingFallthrough {
        /// Address whose successor could not be materialized
        addr: u64,
    },
}

pub(crate) type DisassemblerResult<T, H, R> = core::result::Result<T, DisassemblerError<H, R>>;
