//! Builders and register helpers for the x86-64 sequences passes synthesize.
//!
//! Every synthesized sequence that touches the stack first steps over the
//! System V red zone so that leaf code keeping live data below `rsp` is not
//! clobbered.

use iced_x86::{
    Code, ConditionCode, Formatter, IcedError, Instruction, IntelFormatter, MemoryOperand,
    Register,
};

/// Size of the System V red zone below `rsp`.
pub const RED_ZONE: i64 = 128;

const GPR64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GPR32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GPR8: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

/// Registers passes may borrow after saving them. `rsp` and `rbp` are never used.
pub const SCRATCH: [Register; 9] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
];

/// Index 0..16 of a general purpose register in encoding order.
pub fn gpr_index(reg: Register) -> Option<usize> {
    let full = reg.full_register();
    GPR64.iter().position(|r| *r == full)
}

/// 64-bit register with the given encoding index.
pub fn gpr64(index: usize) -> Register {
    GPR64[index & 15]
}

/// 32-bit view of a 64-bit register.
pub fn gpr32(reg: Register) -> Register {
    gpr_index(reg).map_or(Register::None, |i| GPR32[i])
}

/// Low 8-bit view of a 64-bit register.
pub fn gpr8(reg: Register) -> Register {
    gpr_index(reg).map_or(Register::None, |i| GPR8[i])
}

/// `lea rsp, [rsp - 128]`
pub fn red_zone_enter() -> Result<Instruction, IcedError> {
    Instruction::with2(
        Code::Lea_r64_m,
        Register::RSP,
        MemoryOperand::with_base_displ(Register::RSP, -RED_ZONE),
    )
}

/// `lea rsp, [rsp + 128]`
pub fn red_zone_leave() -> Result<Instruction, IcedError> {
    Instruction::with2(
        Code::Lea_r64_m,
        Register::RSP,
        MemoryOperand::with_base_displ(Register::RSP, RED_ZONE),
    )
}

/// `push r64`
pub fn push(reg: Register) -> Result<Instruction, IcedError> {
    Instruction::with1(Code::Push_r64, reg)
}

/// `pop r64`
pub fn pop(reg: Register) -> Result<Instruction, IcedError> {
    Instruction::with1(Code::Pop_r64, reg)
}

/// `pushfq`
pub fn pushfq() -> Instruction {
    Instruction::with(Code::Pushfq)
}

/// `popfq`
pub fn popfq() -> Instruction {
    Instruction::with(Code::Popfq)
}

/// `mov r32, imm32` (zero-extends into the full register).
pub fn mov_imm32(reg: Register, value: u32) -> Result<Instruction, IcedError> {
    Instruction::with2(Code::Mov_r32_imm32, gpr32(reg), value)
}

/// `cmp r32, imm32`
pub fn cmp_imm32(reg: Register, value: u32) -> Result<Instruction, IcedError> {
    Instruction::with2(Code::Cmp_rm32_imm32, gpr32(reg), value)
}

/// Near `jmp` with a placeholder target; the emitter resolves the real one.
pub fn jmp_near() -> Result<Instruction, IcedError> {
    Instruction::with_branch(Code::Jmp_rel32_64, 0)
}

/// Near `call` with a placeholder target.
pub fn call_near() -> Result<Instruction, IcedError> {
    Instruction::with_branch(Code::Call_rel32_64, 0)
}

/// `ud2`
pub fn ud2() -> Instruction {
    Instruction::with(Code::Ud2)
}

/// Near `ret`.
pub fn ret() -> Instruction {
    Instruction::with(Code::Retnq)
}

/// Near `jcc` code for a condition.
pub const fn jcc(condition: ConditionCode) -> Code {
    match condition {
        ConditionCode::o => Code::Jo_rel32_64,
        ConditionCode::no => Code::Jno_rel32_64,
        ConditionCode::b => Code::Jb_rel32_64,
        ConditionCode::ae => Code::Jae_rel32_64,
        ConditionCode::e => Code::Je_rel32_64,
        ConditionCode::ne => Code::Jne_rel32_64,
        ConditionCode::be => Code::Jbe_rel32_64,
        ConditionCode::a => Code::Ja_rel32_64,
        ConditionCode::s => Code::Js_rel32_64,
        ConditionCode::ns => Code::Jns_rel32_64,
        ConditionCode::p => Code::Jp_rel32_64,
        ConditionCode::np => Code::Jnp_rel32_64,
        ConditionCode::l => Code::Jl_rel32_64,
        ConditionCode::ge => Code::Jge_rel32_64,
        ConditionCode::le => Code::Jle_rel32_64,
        ConditionCode::g => Code::Jg_rel32_64,
        ConditionCode::None => Code::Jmp_rel32_64,
    }
}

/// Encoded length of a relative branch with `code`, in its current form.
pub fn branch_len(code: Code) -> Result<usize, IcedError> {
    let insn = Instruction::with_branch(code, 0x1000)?;
    let mut encoder = iced_x86::Encoder::new(64);
    encoder.encode(&insn, 0x1000)
}

/// Intel-syntax text of one instruction.
pub fn format(insn: &Instruction) -> String {
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    formatter.format(insn, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_views() {
        assert_eq!(gpr32(Register::R10), Register::R10D);
        assert_eq!(gpr8(Register::RSI), Register::SIL);
        assert_eq!(gpr_index(Register::ECX), Some(1));
        assert_eq!(gpr64(9), Register::R9);
    }

    #[test]
    fn red_zone_sequences_format() {
        assert_eq!(format(&red_zone_enter().unwrap()), "lea rsp,[rsp-80h]");
        assert_eq!(format(&red_zone_leave().unwrap()), "lea rsp,[rsp+80h]");
    }

    #[test]
    fn branch_lengths() {
        assert_eq!(branch_len(Code::Jmp_rel8_64).unwrap(), 2);
        assert_eq!(branch_len(Code::Jmp_rel32_64).unwrap(), 5);
        assert_eq!(branch_len(Code::Jne_rel32_64).unwrap(), 6);
        assert_eq!(jcc(ConditionCode::e), Code::Je_rel32_64);
    }
}
