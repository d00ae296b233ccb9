//! Module handling diagnostic information.

use crate::{Disassembler, HandleCoverage, ObserveRedqueen, ReadMemory};

/// Diagnostic information for a [`Disassembler`] session.
///
/// This struct can be retrieved from [`Disassembler::diagnose`]
pub struct DiagnosticInformation {
    /// Number of COFI nodes in the graph
    pub cofi_nodes: usize,
    /// Number of instruction addresses in the lookup index
    pub indexed_addresses: usize,
    /// Whether an indirect branch is waiting for its target packet
    pub pending_indirect_branch: bool,
}

impl<H: HandleCoverage, R: ReadMemory, Q: ObserveRedqueen> Disassembler<'_, H, R, Q> {
    /// Get diagnostic information
    #[must_use]
    pub fn diagnose(&self) -> DiagnosticInformation {
        DiagnosticInformation {
            cofi_nodes: self.graph.node_count(),
            indexed_addresses: self.graph.indexed_addresses(),
            pending_indirect_branch: self.pending_indirect_branch_src.is_some(),
        }
    }
}
