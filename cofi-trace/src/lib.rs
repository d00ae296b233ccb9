//! Reconstruct executed basic blocks from Intel PT TNT streams.
//!
//! Intel PT reports control flow as a compressed stream: one taken/not-taken
//! bit per conditional branch plus separate target packets for indirect
//! branches. Turning that stream back into the exact sequence of executed
//! instruction pointers requires disassembling the traced code. This crate
//! does so lazily and exactly once per instruction: a [`Disassembler`]
//! session decodes guest code into a persistent graph of
//! control-flow-of-instruction (COFI) waypoints and walks that graph under
//! TNT control, reporting every reconstructed instruction pointer to a
//! [`HandleCoverage`] sink.
//!
//! A session is bound to one monitored address range and one guest image.
//! The graph survives [`flush`][Disassembler::flush], so repeated traces over
//! the same code (the common case in a fuzzing loop) never touch the
//! instruction decoder again.

mod builder;
mod classifier;
mod coverage_handler;
mod diagnose;
mod error;
mod follower;
mod graph;
mod memory_reader;
mod redqueen;
mod tnt_cache;

pub use crate::{
    classifier::CofiType,
    coverage_handler::{HandleCoverage, LogCoverageHandler},
    diagnose::DiagnosticInformation,
    error::{DisassemblerError, OpenError},
    graph::{LookupBackend, MAX_RANGE_SPAN},
    memory_reader::{PAGE_SIZE, ReadMemory, SparseMemoryError, SparsePageMemory},
    redqueen::{AsmOperand, NoRedqueen, ObserveRedqueen},
    tnt_cache::{TntCache, TntOutcome, TntSource},
};

#[cfg(feature = "fuzz_bitmap")]
pub use crate::coverage_handler::fuzz_bitmap::FuzzBitmapCoverageHandler;
#[cfg(feature = "mmap_memory_reader")]
pub use crate::memory_reader::mmap::{
    MappedImage, MmapMemoryReader, MmapMemoryReaderCreateError, MmapMemoryReaderError,
};

use crate::graph::CofiGraph;

/// Execution mode of the traced guest
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceeMode {
    /// 32-bit mode
    Mode32 = 32,
    /// 64-bit mode
    Mode64 = 64,
}

impl TraceeMode {
    /// Get the bitness of current tracee mode
    #[must_use]
    pub fn bitness(&self) -> u32 {
        *self as u32
    }
}

/// A disassembler session bound to one monitored guest address range.
///
/// The session owns the COFI graph; the coverage handler, memory reader and
/// optional Redqueen observer are borrowed for the session's lifetime. All
/// operations run to completion on the caller's thread.
pub struct Disassembler<'a, H, R, Q = NoRedqueen>
where
    H: HandleCoverage,
    R: ReadMemory,
    Q: ObserveRedqueen,
{
    graph: CofiGraph,
    tracee_mode: TraceeMode,
    handler: &'a mut H,
    reader: &'a mut R,
    redqueen: Option<&'a mut Q>,
    /// Source of an indirect branch or return waiting for its target packet
    pending_indirect_branch_src: Option<u64>,
}

impl<'a, H, R> Disassembler<'a, H, R>
where
    H: HandleCoverage,
    R: ReadMemory,
{
    /// Open a session over `[min_addr, max_addr]` without a Redqueen
    /// observer.
    ///
    /// The bounds are inclusive and the span is capped at
    /// [`MAX_RANGE_SPAN`].
    pub fn open(
        reader: &'a mut R,
        handler: &'a mut H,
        min_addr: u64,
        max_addr: u64,
        tracee_mode: TraceeMode,
    ) -> Result<Self, OpenError> {
        Self::open_with(
            reader,
            handler,
            None,
            min_addr,
            max_addr,
            tracee_mode,
            LookupBackend::DenseArray,
        )
    }
}

impl<'a, H, R, Q> Disassembler<'a, H, R, Q>
where
    H: HandleCoverage,
    R: ReadMemory,
    Q: ObserveRedqueen,
{
    /// Open a session with a Redqueen observer attached.
    pub fn open_with_redqueen(
        reader: &'a mut R,
        handler: &'a mut H,
        redqueen: &'a mut Q,
        min_addr: u64,
        max_addr: u64,
        tracee_mode: TraceeMode,
    ) -> Result<Self, OpenError> {
        Self::open_with(
            reader,
            handler,
            Some(redqueen),
            min_addr,
            max_addr,
            tracee_mode,
            LookupBackend::DenseArray,
        )
    }

    /// Open a session choosing every knob explicitly.
    pub fn open_with(
        reader: &'a mut R,
        handler: &'a mut H,
        redqueen: Option<&'a mut Q>,
        min_addr: u64,
        max_addr: u64,
        tracee_mode: TraceeMode,
        backend: LookupBackend,
    ) -> Result<Self, OpenError> {
        if min_addr > max_addr {
            return Err(OpenError::InvalidRange {
                min: min_addr,
                max: max_addr,
            });
        }
        let span = max_addr - min_addr;
        if span > MAX_RANGE_SPAN {
            return Err(OpenError::RangeTooLarge { span });
        }
        Ok(Self {
            graph: CofiGraph::new(min_addr, max_addr, backend),
            tracee_mode,
            handler,
            reader,
            redqueen,
            pending_indirect_branch_src: None,
        })
    }

    /// Discard the pending indirect-branch hint.
    ///
    /// Called between fuzz iterations; the COFI graph deliberately survives
    /// so later iterations replay from cache.
    pub fn flush(&mut self) {
        self.pending_indirect_branch_src = None;
    }

    /// Deliver the out-of-band target of the last indirect branch or return.
    ///
    /// If a hint is pending, the observer (when attached) is notified of the
    /// completed transition and the hint is cleared; otherwise this is a
    /// no-op. The argument is forwarded exactly as supplied: restoring
    /// compressed kernel IPs to their canonical form is the caller's business
    /// here, unlike for branch targets resolved inside the follower.
    pub fn inform_target_ip(&mut self, target_ip: u64) {
        if let Some(src) = self.pending_indirect_branch_src {
            if let Some(redqueen) = self.redqueen.as_deref_mut() {
                log::trace!("indirect transition {src:#x} -> {target_ip:#x}");
                redqueen.on_transition(src, target_ip);
            }
            self.flush();
        }
    }

    /// Restore the canonical form of a PT-compressed kernel IP.
    ///
    /// PT target packets may arrive with the all-ones upper half dropped.
    /// The extension only applies when the monitored range itself lies above
    /// 4 GiB, since otherwise it would move every in-range IP out of range.
    pub(crate) fn canonical_ip(&self, ip: u64) -> u64 {
        if self.graph.min_addr() > u64::from(u32::MAX) && ip < 0x1_0000_0000 {
            ip | 0xFFFF_FFFF_0000_0000
        } else {
            ip
        }
    }
}
