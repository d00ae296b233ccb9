//! Lazy COFI graph builder.
//!
//! Building is linear disassembly from an entry address over a one- or
//! two-page code window. Runs of straight-line instructions are compressed
//! into a single shared node that is re-pointed at the run's terminating COFI
//! instruction once found, so every decoded address resolves to the COFI
//! waypoint that ends its run. Decoding stops as soon as it re-enters
//! territory whose continuation is already known.

use iced_x86::{Decoder, DecoderOptions, Instruction};

use crate::{
    Disassembler, HandleCoverage, ReadMemory,
    classifier::{CofiType, classify},
    error::{DisassemblerError, DisassemblerResult},
    graph::{CofiGraph, NodeId},
    memory_reader::{PAGE_MASK, PAGE_SIZE},
    redqueen::ObserveRedqueen,
};

impl<H, R, Q> Disassembler<'_, H, R, Q>
where
    H: HandleCoverage,
    R: ReadMemory,
    Q: ObserveRedqueen,
{
    /// Disassemble from `base_address` and populate the graph.
    ///
    /// With `across_page` unset the code window ends at the page boundary;
    /// set, two consecutive pages are spliced into a scratch buffer so an
    /// instruction straddling the boundary decodes. Returns the node covering
    /// `base_address`, or `None` if not even one instruction decoded.
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) fn analyse_assembly(
        &mut self,
        base_address: u64,
        across_page: bool,
    ) -> DisassemblerResult<Option<NodeId>, H, R> {
        let Self {
            graph,
            reader,
            redqueen,
            tracee_mode,
            ..
        } = self;
        let bitness = tracee_mode.bitness();
        let page_offset = (base_address & !PAGE_MASK) as usize;

        if across_page {
            let window_len = PAGE_SIZE * 2 - page_offset;
            let mut window = [0u8; PAGE_SIZE * 2];
            reader
                .read(base_address, &mut window[..window_len])
                .map_err(DisassemblerError::MemoryReader)?;
            Ok(scan_window(
                graph,
                redqueen.as_deref_mut(),
                bitness,
                &window[..window_len],
                base_address,
            ))
        } else {
            reader
                .map_page(base_address, |code| {
                    scan_window(graph, redqueen.as_deref_mut(), bitness, code, base_address)
                })
                .map_err(DisassemblerError::MemoryReader)
        }
    }
}

/// Decode one code window into the graph. Returns the first covered node.
#[expect(clippy::cast_possible_truncation)]
fn scan_window<Q: ObserveRedqueen>(
    graph: &mut CofiGraph,
    mut redqueen: Option<&mut Q>,
    bitness: u32,
    code: &[u8],
    base_address: u64,
) -> Option<NodeId> {
    let mut decoder = Decoder::with_ip(bitness, code, base_address, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut first: Option<NodeId> = None;
    let mut current: Option<NodeId> = None;
    let mut last_was_cofi = false;

    while decoder.can_decode() {
        let position = decoder.position();
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            // Undecodable bytes, or an instruction cut off by the window end.
            break;
        }
        let ins_addr = instruction.ip();
        if ins_addr > graph.max_addr() {
            break;
        }

        if let Some(existing) = graph.lookup(ins_addr) {
            if let Some(cur) = current.filter(|&cur| cur != existing) {
                graph.link_fallthrough(cur, existing);
            }
            if first.is_none() {
                first = Some(existing);
            }
            if graph.node(existing).fallthrough.is_some() {
                // The remainder of this stream is already disassembled.
                break;
            }
            // An unfinished node: adopt it and keep decoding in place. Its
            // instruction was classified when it was first decoded.
            current = Some(existing);
            last_was_cofi = graph.node(existing).kind != CofiType::NoCofi;
            continue;
        }

        let instruction_bytes = &code[position..position + instruction.len()];
        let kind = classify(redqueen.as_deref_mut(), &instruction, instruction_bytes);

        let cur = match current {
            Some(run) if !last_was_cofi => run,
            predecessor => {
                let node = graph.alloc(ins_addr, instruction.len() as u8);
                if let Some(predecessor) = predecessor {
                    graph.link_fallthrough(predecessor, node);
                }
                current = Some(node);
                node
            }
        };

        if kind == CofiType::NoCofi {
            // Straight-line: the address shares the run's node.
            graph.insert(ins_addr, cur);
            last_was_cofi = false;
        } else {
            let target_addr = match kind {
                CofiType::ConditionalBranch | CofiType::UnconditionalDirectBranch => {
                    instruction.near_branch_target()
                }
                _ => 0,
            };
            graph.finalize(cur, ins_addr, instruction.len() as u8, kind, target_addr);
            graph.insert(ins_addr, cur);
            last_was_cofi = true;
        }
        if first.is_none() {
            first = Some(cur);
        }
    }

    first
}
