//! Redqueen observation hooks.
//!
//! The observer is a passive side channel: during classification it is told
//! which instructions are worth hooking for input-to-state (`rq`) or state
//! inspection (`se`) purposes, and while tracing in transition mode it
//! receives every resolved branch transition. The core never interprets the
//! recorded events; a downstream constraint-matching stage does.

use iced_x86::{Instruction, Mnemonic, OpKind, Register};

/// Decoded shape of one instruction operand, as reported by
/// [`ObserveRedqueen::operands_at`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AsmOperand {
    /// Size of the memory access in bytes, 0 for non-memory operands
    pub ptr_size: u8,
    /// Displacement (or immediate) of the operand
    pub offset: i64,
    /// Scale applied to the index register
    pub scale: u8,
    /// Base register, if present
    pub base: Option<Register>,
    /// Index register, if present
    pub index: Option<Register>,
}

/// Redqueen observer attached to a disassembler session.
pub trait ObserveRedqueen {
    /// Whether resolved branch transitions should currently be reported
    /// through [`on_transition`][ObserveRedqueen::on_transition].
    fn transition_mode(&self) -> bool;

    /// An input-to-state candidate instruction was classified at `ip`.
    fn on_rq_instruction(&mut self, ip: u64);

    /// A state-inspection candidate instruction was classified at `ip`.
    fn on_se_instruction(&mut self, ip: u64);

    /// The branch at `src` was resolved to continue at `dst`.
    fn on_transition(&mut self, src: u64, dst: u64);

    /// Operand shapes of the instruction at `ip`, if the observer has them.
    fn operands_at(&mut self, ip: u64) -> Option<(AsmOperand, AsmOperand)>;
}

/// Observer used by sessions without a Redqueen stage attached.
pub struct NoRedqueen;

impl ObserveRedqueen for NoRedqueen {
    fn transition_mode(&self) -> bool {
        false
    }

    fn on_rq_instruction(&mut self, _ip: u64) {}

    fn on_se_instruction(&mut self, _ip: u64) {}

    fn on_transition(&mut self, _src: u64, _dst: u64) {}

    fn operands_at(&mut self, _ip: u64) -> Option<(AsmOperand, AsmOperand)> {
        None
    }
}

fn is_base_pointer(register: Register) -> bool {
    matches!(
        register,
        Register::BPL | Register::BP | Register::EBP | Register::RBP
    )
}

fn is_stack_pointer(register: Register) -> bool {
    matches!(
        register,
        Register::SPL | Register::SP | Register::ESP | Register::RSP
    )
}

/// A `lea` is interesting when it computes `index - large_constant`: scale 1,
/// no base, a multi-byte negative displacement. Stack frame and IP-relative
/// address computations are excluded.
fn is_interesting_lea_at<Q: ObserveRedqueen>(observer: &mut Q, ip: u64) -> bool {
    let Some((_op1, op2)) = observer.operands_at(ip) else {
        return false;
    };
    debug_assert_ne!(op2.ptr_size, 0, "lea source must have a memory shape");
    let interesting = op2.offset < 0
        && -op2.offset > 0xFF
        && op2.scale == 1
        && op2.base.is_none()
        && op2.index.is_some();
    if interesting
        && matches!(
            op2.index,
            Some(Register::RBP | Register::EBP | Register::RIP)
        )
    {
        log::debug!("boring index register in lea at {ip:#x}");
        return false;
    }
    interesting
}

/// An `add` is interesting with a multi-byte immediate above `0x7fff` whose
/// second byte is not part of a sign-extension run, and no addressing
/// registers. Stack frame arithmetic is excluded.
fn is_interesting_add_at<Q: ObserveRedqueen>(observer: &mut Q, ip: u64) -> bool {
    let Some((op1, op2)) = observer.operands_at(ip) else {
        return false;
    };
    let interesting = op2.offset > 0x7FFF
        && (op2.offset >> 8) & 0xFF != 0xFF
        && op2.scale == 1
        && op2.base.is_none()
        && op2.index.is_none();
    if op1.index.is_some_and(is_base_pointer) || op2.index.is_some_and(is_stack_pointer) {
        return false;
    }
    interesting
}

/// A `sub` is interesting with a multi-byte immediate and no addressing
/// registers. Stack frame arithmetic is excluded.
fn is_interesting_sub_at<Q: ObserveRedqueen>(observer: &mut Q, ip: u64) -> bool {
    let Some((op1, op2)) = observer.operands_at(ip) else {
        return false;
    };
    if op2.offset > 0xFF && op2.scale == 1 && op2.base.is_none() && op2.index.is_none() {
        !(op1.index.is_some_and(is_base_pointer) || op2.index.is_some_and(is_stack_pointer))
    } else {
        false
    }
}

/// An `xor` is interesting unless it is the `xor reg, reg` zeroing idiom.
fn is_interesting_xor_at<Q: ObserveRedqueen>(observer: &mut Q, ip: u64) -> bool {
    let Some((op1, op2)) = observer.operands_at(ip) else {
        return false;
    };
    op1 != op2
}

fn has_memory_operand(instruction: &Instruction) -> bool {
    (0..instruction.op_count()).any(|operand| instruction.op_kind(operand) == OpKind::Memory)
}

/// Feed one classified instruction to the observer.
///
/// Comparison-like instructions become `rq` hooks; returns, pops and
/// memory-touching instructions become `se` hooks, except `nop` and the
/// all-zero two-byte `add byte ptr [rax], al` filler.
pub(crate) fn inspect_instruction<Q: ObserveRedqueen>(
    observer: &mut Q,
    instruction: &Instruction,
    instruction_bytes: &[u8],
) {
    let ip = instruction.ip();
    let mnemonic = instruction.mnemonic();
    match mnemonic {
        Mnemonic::Cmp => observer.on_rq_instruction(ip),
        Mnemonic::Lea if is_interesting_lea_at(observer, ip) => {
            log::debug!("hooking lea {ip:#x}");
            observer.on_rq_instruction(ip);
        }
        Mnemonic::Sub if is_interesting_sub_at(observer, ip) => {
            log::debug!("hooking sub {ip:#x}");
            observer.on_rq_instruction(ip);
        }
        Mnemonic::Add if is_interesting_add_at(observer, ip) => {
            log::debug!("hooking add {ip:#x}");
            observer.on_rq_instruction(ip);
        }
        Mnemonic::Xor if is_interesting_xor_at(observer, ip) => {
            log::debug!("hooking xor {ip:#x}");
            observer.on_rq_instruction(ip);
        }
        _ => {}
    }

    if mnemonic != Mnemonic::Lea
        && (mnemonic == Mnemonic::Ret
            || mnemonic == Mnemonic::Pop
            || (has_memory_operand(instruction)
                && mnemonic != Mnemonic::Nop
                && instruction_bytes != [0x00, 0x00]))
    {
        observer.on_se_instruction(ip);
    }

    if mnemonic == Mnemonic::Call {
        log::debug!("hooking call {ip:#x}");
        observer.on_rq_instruction(ip);
    }
}
