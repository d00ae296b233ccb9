//! COFI instruction classifier.
//!
//! Classification matches a decoded instruction against one lookup table per
//! COFI class. An entry can pin the ModR/M reg group and the first opcode
//! byte on top of the mnemonic; this is what separates the three flavors of
//! `jmp` (relative, near indirect, far) that share a mnemonic but behave
//! completely differently under Intel PT.

use derive_more::Display;
use iced_x86::{Instruction, Mnemonic};

use crate::redqueen::{self, ObserveRedqueen};

/// COFI class of an instruction.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum CofiType {
    /// Jcc, LOOP and JCXZ families; consumes one TNT bit
    #[display("conditional branch")]
    ConditionalBranch,
    /// Direct JMP/CALL with a relative encoding
    #[display("unconditional direct branch")]
    UnconditionalDirectBranch,
    /// Near indirect JMP/CALL; the target arrives in a separate PT packet
    #[display("indirect branch")]
    IndirectBranch,
    /// Near RET
    #[display("near return")]
    NearRet,
    /// Far JMP/CALL/RET, interrupts, SYS* and VM entry; opaque to PT here
    #[display("far transfer")]
    FarTransfer,
    /// Straight-line instruction
    #[display("no cofi")]
    NoCofi,
}

/// One lookup table entry.
struct CofiPattern {
    mnemonic: Mnemonic,
    /// Required ModR/M reg group (`/n`), if any
    modrm_reg: Option<i32>,
    /// Required first opcode byte, if any
    opcode: Option<u32>,
}

impl CofiPattern {
    fn matches(&self, instruction: &Instruction) -> bool {
        if instruction.mnemonic() != self.mnemonic {
            return false;
        }
        let op_code = instruction.code().op_code();
        if self
            .modrm_reg
            .is_some_and(|modrm_reg| op_code.group_index() != modrm_reg)
        {
            return false;
        }
        if self.opcode.is_some_and(|opcode| op_code.op_code() != opcode) {
            return false;
        }
        true
    }
}

const fn any(mnemonic: Mnemonic) -> CofiPattern {
    CofiPattern {
        mnemonic,
        modrm_reg: None,
        opcode: None,
    }
}

const fn with_opcode(mnemonic: Mnemonic, opcode: u32) -> CofiPattern {
    CofiPattern {
        mnemonic,
        modrm_reg: None,
        opcode: Some(opcode),
    }
}

const fn with_group(mnemonic: Mnemonic, modrm_reg: i32, opcode: u32) -> CofiPattern {
    CofiPattern {
        mnemonic,
        modrm_reg: Some(modrm_reg),
        opcode: Some(opcode),
    }
}

const CONDITIONAL_BRANCHES: [CofiPattern; 22] = [
    any(Mnemonic::Jae),
    any(Mnemonic::Ja),
    any(Mnemonic::Jbe),
    any(Mnemonic::Jb),
    any(Mnemonic::Jcxz),
    any(Mnemonic::Jecxz),
    any(Mnemonic::Je),
    any(Mnemonic::Jge),
    any(Mnemonic::Jg),
    any(Mnemonic::Jle),
    any(Mnemonic::Jl),
    any(Mnemonic::Jne),
    any(Mnemonic::Jno),
    any(Mnemonic::Jnp),
    any(Mnemonic::Jns),
    any(Mnemonic::Jo),
    any(Mnemonic::Jp),
    any(Mnemonic::Jrcxz),
    any(Mnemonic::Js),
    any(Mnemonic::Loop),
    any(Mnemonic::Loope),
    any(Mnemonic::Loopne),
];

const UNCONDITIONAL_DIRECT_BRANCHES: [CofiPattern; 3] = [
    with_opcode(Mnemonic::Jmp, 0xE9),
    with_opcode(Mnemonic::Jmp, 0xEB),
    with_opcode(Mnemonic::Call, 0xE8),
];

const INDIRECT_BRANCHES: [CofiPattern; 2] = [
    with_group(Mnemonic::Jmp, 4, 0xFF),
    with_group(Mnemonic::Call, 2, 0xFF),
];

const NEAR_RETS: [CofiPattern; 2] = [
    with_opcode(Mnemonic::Ret, 0xC3),
    with_opcode(Mnemonic::Ret, 0xC2),
];

const FAR_TRANSFERS: [CofiPattern; 19] = [
    any(Mnemonic::Int3),
    any(Mnemonic::Int),
    any(Mnemonic::Int1),
    any(Mnemonic::Into),
    any(Mnemonic::Iret),
    any(Mnemonic::Iretd),
    any(Mnemonic::Iretq),
    with_opcode(Mnemonic::Jmp, 0xEA),
    with_group(Mnemonic::Jmp, 5, 0xFF),
    with_opcode(Mnemonic::Call, 0x9A),
    with_group(Mnemonic::Call, 3, 0xFF),
    with_opcode(Mnemonic::Retf, 0xCB),
    with_opcode(Mnemonic::Retf, 0xCA),
    any(Mnemonic::Syscall),
    any(Mnemonic::Sysenter),
    any(Mnemonic::Sysexit),
    any(Mnemonic::Sysret),
    any(Mnemonic::Vmlaunch),
    any(Mnemonic::Vmresume),
];

/// Tables in consultation order; the first table with a matching entry wins.
const LOOKUP_TABLES: [(&[CofiPattern], CofiType); 5] = [
    (&CONDITIONAL_BRANCHES, CofiType::ConditionalBranch),
    (
        &UNCONDITIONAL_DIRECT_BRANCHES,
        CofiType::UnconditionalDirectBranch,
    ),
    (&INDIRECT_BRANCHES, CofiType::IndirectBranch),
    (&NEAR_RETS, CofiType::NearRet),
    (&FAR_TRANSFERS, CofiType::FarTransfer),
];

/// Classify one decoded instruction.
///
/// When a Redqueen observer is attached it is consulted first, so it sees
/// every instruction exactly once (the graph caches classification results).
pub(crate) fn classify<Q: ObserveRedqueen>(
    redqueen: Option<&mut Q>,
    instruction: &Instruction,
    instruction_bytes: &[u8],
) -> CofiType {
    if let Some(observer) = redqueen {
        redqueen::inspect_instruction(observer, instruction, instruction_bytes);
    }

    for (patterns, kind) in LOOKUP_TABLES {
        if patterns.iter().any(|pattern| pattern.matches(instruction)) {
            return kind;
        }
    }
    CofiType::NoCofi
}

#[cfg(test)]
mod tests {
    use iced_x86::{Decoder, DecoderOptions};

    use super::*;
    use crate::redqueen::NoRedqueen;

    fn classify_bytes(bitness: u32, bytes: &[u8]) -> CofiType {
        let mut decoder = Decoder::with_ip(bitness, bytes, 0x1000, DecoderOptions::NONE);
        let instruction = decoder.decode();
        assert!(!instruction.is_invalid(), "test bytes must decode");
        classify(None::<&mut NoRedqueen>, &instruction, bytes)
    }

    #[test]
    fn test_conditional_branches() {
        assert_eq!(classify_bytes(64, &[0x74, 0x10]), CofiType::ConditionalBranch); // je
        assert_eq!(classify_bytes(64, &[0x7F, 0x02]), CofiType::ConditionalBranch); // jg
        assert_eq!(
            classify_bytes(64, &[0x0F, 0x84, 0x00, 0x10, 0x00, 0x00]),
            CofiType::ConditionalBranch
        ); // je near
        assert_eq!(classify_bytes(64, &[0xE2, 0xFE]), CofiType::ConditionalBranch); // loop
        assert_eq!(classify_bytes(64, &[0xE3, 0x04]), CofiType::ConditionalBranch); // jrcxz
    }

    #[test]
    fn test_direct_branches_by_opcode_byte() {
        assert_eq!(
            classify_bytes(64, &[0xE9, 0x00, 0x10, 0x00, 0x00]),
            CofiType::UnconditionalDirectBranch
        );
        assert_eq!(
            classify_bytes(64, &[0xEB, 0x10]),
            CofiType::UnconditionalDirectBranch
        );
        assert_eq!(
            classify_bytes(64, &[0xE8, 0x00, 0x10, 0x00, 0x00]),
            CofiType::UnconditionalDirectBranch
        );
    }

    #[test]
    fn test_indirect_branches_by_modrm_group() {
        assert_eq!(classify_bytes(64, &[0xFF, 0xE0]), CofiType::IndirectBranch); // jmp rax
        assert_eq!(classify_bytes(64, &[0xFF, 0xD0]), CofiType::IndirectBranch); // call rax
        assert_eq!(classify_bytes(64, &[0xFF, 0x20]), CofiType::IndirectBranch); // jmp [rax]
        assert_eq!(classify_bytes(64, &[0xFF, 0x10]), CofiType::IndirectBranch); // call [rax]
    }

    #[test]
    fn test_near_returns() {
        assert_eq!(classify_bytes(64, &[0xC3]), CofiType::NearRet);
        assert_eq!(classify_bytes(64, &[0xC2, 0x08, 0x00]), CofiType::NearRet);
    }

    #[test]
    fn test_far_transfers() {
        assert_eq!(classify_bytes(64, &[0xCC]), CofiType::FarTransfer); // int3
        assert_eq!(classify_bytes(64, &[0xCD, 0x80]), CofiType::FarTransfer); // int 0x80
        assert_eq!(classify_bytes(64, &[0x0F, 0x05]), CofiType::FarTransfer); // syscall
        assert_eq!(classify_bytes(64, &[0x0F, 0x07]), CofiType::FarTransfer); // sysret
        assert_eq!(classify_bytes(64, &[0x48, 0xCF]), CofiType::FarTransfer); // iretq
        assert_eq!(classify_bytes(64, &[0xCB]), CofiType::FarTransfer); // retf
        assert_eq!(classify_bytes(64, &[0xCA, 0x08, 0x00]), CofiType::FarTransfer); // retf imm16
        assert_eq!(classify_bytes(64, &[0xFF, 0x28]), CofiType::FarTransfer); // jmp far [rax]
        assert_eq!(classify_bytes(64, &[0xFF, 0x18]), CofiType::FarTransfer); // call far [rax]
        assert_eq!(classify_bytes(64, &[0x0F, 0x01, 0xC2]), CofiType::FarTransfer); // vmlaunch
        assert_eq!(classify_bytes(64, &[0x0F, 0x01, 0xC3]), CofiType::FarTransfer); // vmresume
    }

    #[test]
    fn test_far_transfers_32bit_only_encodings() {
        assert_eq!(
            classify_bytes(32, &[0xEA, 0x00, 0x10, 0x00, 0x00, 0x08, 0x00]),
            CofiType::FarTransfer
        ); // jmp ptr16:32
        assert_eq!(
            classify_bytes(32, &[0x9A, 0x00, 0x10, 0x00, 0x00, 0x08, 0x00]),
            CofiType::FarTransfer
        ); // call ptr16:32
        assert_eq!(classify_bytes(32, &[0xCE]), CofiType::FarTransfer); // into
        assert_eq!(classify_bytes(32, &[0xE3, 0x04]), CofiType::ConditionalBranch); // jecxz
    }

    #[test]
    fn test_straight_line_is_no_cofi() {
        assert_eq!(classify_bytes(64, &[0x90]), CofiType::NoCofi); // nop
        assert_eq!(classify_bytes(64, &[0x48, 0x89, 0xD8]), CofiType::NoCofi); // mov rax, rbx
        assert_eq!(classify_bytes(64, &[0x00, 0x00]), CofiType::NoCofi); // add [rax], al
        assert_eq!(classify_bytes(64, &[0x50]), CofiType::NoCofi); // push rax
    }
}
