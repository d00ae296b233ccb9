//! TNT-driven trace follower.
//!
//! One `trace` call walks the COFI graph from an entry IP until the TNT
//! stream runs dry or control leaves the reach of PT's TNT bits (indirect
//! branch, return, far transfer). Conditional branches consume exactly one
//! TNT bit each; every other step moves to a strictly later node, so the walk
//! always terminates.

use crate::{
    Disassembler, HandleCoverage, ReadMemory,
    classifier::CofiType,
    error::{DisassemblerError, DisassemblerResult},
    graph::NodeId,
    redqueen::ObserveRedqueen,
    tnt_cache::{TntOutcome, TntSource},
};

impl<H, R, Q> Disassembler<'_, H, R, Q>
where
    H: HandleCoverage,
    R: ReadMemory,
    Q: ObserveRedqueen,
{
    /// Reconstruct the block sequence starting at `entry_point` under the
    /// control of `tnt`.
    ///
    /// Every reconstructed instruction pointer is reported to the coverage
    /// handler before the next step is taken; nothing is rolled back on
    /// failure. `Ok(false)` marks a corrupted run (TNT underflow, or bits
    /// left over at a point the graph cannot continue from); fatal conditions
    /// surface as `Err`.
    pub fn trace<T: TntSource>(
        &mut self,
        entry_point: u64,
        tnt: &mut T,
    ) -> Result<bool, DisassemblerError<H, R>> {
        // A trace entry is itself the target of the last indirect branch.
        self.inform_target_ip(entry_point);

        let entry = self.canonical_ip(entry_point);
        let Some(mut cur) = self.resolve_entry(entry)? else {
            return Ok(self.stream_consistent(tnt, entry));
        };
        self.emit(entry)?;

        loop {
            let node = *self.graph.node(cur);
            let next = match node.kind {
                CofiType::ConditionalBranch => match tnt.process() {
                    TntOutcome::Empty => {
                        log::trace!("TNT exhausted at conditional {:#x}", node.ins_addr);
                        return Ok(false);
                    }
                    TntOutcome::Taken => {
                        self.notify_transition(node.ins_addr, node.target_addr);
                        let target = self.canonical_ip(node.target_addr);
                        self.emit(target)?;
                        self.resolve_target(cur, target)?
                    }
                    TntOutcome::NotTaken => {
                        let fallthrough_addr = node.ins_addr + u64::from(node.ins_size);
                        self.notify_transition(node.ins_addr, fallthrough_addr);
                        self.emit(fallthrough_addr)?;
                        Some(self.resolve_fallthrough(cur)?)
                    }
                },
                CofiType::UnconditionalDirectBranch => {
                    // The branch source is not a coverage signal; the target
                    // is emitted by whatever the next node dispatches.
                    let target = self.canonical_ip(node.target_addr);
                    self.resolve_target(cur, target)?
                }
                CofiType::IndirectBranch => {
                    // The source IP stands in for the still-unknown target
                    // until inform_target_ip delivers the real one.
                    self.emit(node.ins_addr)?;
                    self.pending_indirect_branch_src = Some(node.ins_addr);
                    return Ok(self.stream_consistent(tnt, node.ins_addr));
                }
                CofiType::NearRet => {
                    self.pending_indirect_branch_src = Some(node.ins_addr);
                    return Ok(self.stream_consistent(tnt, node.ins_addr));
                }
                CofiType::FarTransfer => {
                    return Ok(self.stream_consistent(tnt, node.ins_addr));
                }
                CofiType::NoCofi => match node.fallthrough {
                    Some(next) => Some(next),
                    // A sentinel left behind by an earlier probe into the
                    // middle of a straight-line run. Re-resolving its address
                    // completes the run; the node may come back re-pointed at
                    // the run's terminator, so dispatch it again.
                    None => self.resolve_entry(node.ins_addr)?,
                },
            };

            let Some(next) = next else {
                return Ok(self.stream_consistent(tnt, node.ins_addr));
            };
            cur = next;
        }
    }

    fn emit(&mut self, ip: u64) -> DisassemblerResult<(), H, R> {
        self.handler
            .on_block(ip)
            .map_err(DisassemblerError::CoverageHandler)
    }

    /// Report a resolved conditional transition when transition tracing is on.
    fn notify_transition(&mut self, src: u64, dst: u64) {
        if let Some(redqueen) = self.redqueen.as_deref_mut() {
            if redqueen.transition_mode() {
                log::trace!("transition {src:#x} -> {dst:#x}");
                redqueen.on_transition(src, dst);
            }
        }
    }

    /// Whether the TNT stream is clean at a point where the walk hands
    /// control back. Leftover bits mean the reconstruction diverged.
    fn stream_consistent<T: TntSource>(&self, tnt: &T, at: u64) -> bool {
        let leftover = tnt.count();
        if leftover > 0 {
            log::warn!("{leftover} TNT bits left behind {at:#x}: inconsistent trace");
            return false;
        }
        true
    }

    /// Lookup ladder for an entry or branch-target IP: canonicalize, bounds
    /// check, graph lookup, then a single-page and a two-page builder pass.
    ///
    /// `Ok(None)` means the IP is out of the monitored bounds. A node is only
    /// returned with its fall-through edge materialized; failing that after
    /// both passes is fatal.
    fn resolve_entry(&mut self, entry_point: u64) -> DisassemblerResult<Option<NodeId>, H, R> {
        let entry = self.canonical_ip(entry_point);
        if !self.graph.contains(entry) {
            log::trace!("entry {entry:#x} out of monitored bounds");
            return Ok(None);
        }

        let mut node = match self.graph.lookup(entry) {
            Some(node) => Some(node),
            None => self.analyse_assembly(entry, false)?,
        };
        if node.is_none_or(|node| self.graph.node(node).fallthrough.is_none()) {
            node = self.analyse_assembly(entry, true)?;
        }
        match node {
            Some(node) if self.graph.node(node).fallthrough.is_some() => Ok(Some(node)),
            _ => Err(DisassemblerError::MissingFallthrough { addr: entry }),
        }
    }

    /// Resolve and cache the branch-target node of `cur`.
    fn resolve_target(
        &mut self,
        cur: NodeId,
        target: u64,
    ) -> DisassemblerResult<Option<NodeId>, H, R> {
        if let Some(cached) = self.graph.node(cur).target_ref {
            return Ok(Some(cached));
        }
        let resolved = self.resolve_entry(target)?;
        if let Some(resolved) = resolved {
            self.graph.set_target_ref(cur, resolved);
        }
        Ok(resolved)
    }

    /// Resolve the fall-through edge of `cur`, rebuilding across the page
    /// boundary when the original decode window ended at `cur`.
    fn resolve_fallthrough(&mut self, cur: NodeId) -> DisassemblerResult<NodeId, H, R> {
        if let Some(next) = self.graph.node(cur).fallthrough {
            return Ok(next);
        }
        let ins_addr = self.graph.node(cur).ins_addr;
        self.analyse_assembly(ins_addr, true)?;
        self.graph
            .node(cur)
            .fallthrough
            .ok_or(DisassemblerError::MissingFallthrough { addr: ins_addr })
    }
}
