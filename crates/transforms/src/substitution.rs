//! Instruction substitution with equivalent sequences.

use crate::util::{for_each_function, PassStats, Transform};
use iced_x86::{Code, IcedError, Mnemonic, OpKind, Register};
use rand::{rngs::StdRng, Rng};
use shroud_analysis::FlagsLiveness;
use shroud_core::cfg_ir::{BlockKind, Function, Instruction};
use shroud_core::insn::{self, gpr32, SCRATCH};
use shroud_core::module::Module;
use shroud_utils::errors::TransformError;
use tracing::debug;

/// Instruction substitution.
///
/// Rewrites integer arithmetic on 32/64-bit registers into longer sequences
/// that compute the same value. Only sites whose status flags are dead
/// afterwards qualify, since the replacements set flags differently.
#[derive(Debug, Clone)]
pub struct Substitution {
    percent: u8,
}

impl Substitution {
    /// Rewrites roughly `percent` percent of eligible instructions.
    pub const fn new(percent: u8) -> Self {
        Self { percent }
    }

    fn substitute_function(&self, function: &mut Function, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        let mut stats = PassStats::default();
        let liveness = FlagsLiveness::compute(function);
        for index in 0..function.blocks.len() {
            if function.blocks[index].kind != BlockKind::Original {
                continue;
            }
            let live_after = liveness.live_after(function, index);
            let block = &mut function.blocks[index];
            let mut rewritten = Vec::with_capacity(block.instructions.len());
            for (instr, live) in std::mem::take(&mut block.instructions).into_iter().zip(live_after) {
                let site = (live == 0).then(|| Site::of(&instr)).flatten();
                let Some(site) = site else {
                    rewritten.push(instr);
                    continue;
                };
                stats.note("eligible_sites", 1);
                if rng.random_range(0..100u8) >= self.percent {
                    rewritten.push(instr);
                    continue;
                }
                let origin = instr.origin;
                let replacement = site.rewrite(rng)?;
                for (position, insn) in replacement.into_iter().enumerate() {
                    let new = Instruction::new(insn);
                    rewritten.push(if position == 0 { new.with_origin(origin) } else { new });
                }
                stats.bump("substitutions", 1);
            }
            block.instructions = rewritten;
        }
        if stats.get("substitutions") > 0 {
            debug!(
                function = %function.name,
                substitutions = stats.get("substitutions"),
                "substituted instructions"
            );
        }
        Ok(stats)
    }
}

impl Transform for Substitution {
    fn name(&self) -> &'static str {
        "subst"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        for_each_function(module, rng, |function, rng| self.substitute_function(function, rng))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alu {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

impl Alu {
    const fn imm_code(self, wide: bool) -> Code {
        match (self, wide) {
            (Self::Add, false) => Code::Add_rm32_imm32,
            (Self::Add, true) => Code::Add_rm64_imm32,
            (Self::Sub, false) => Code::Sub_rm32_imm32,
            (Self::Sub, true) => Code::Sub_rm64_imm32,
            (Self::And, false) => Code::And_rm32_imm32,
            (Self::And, true) => Code::And_rm64_imm32,
            (Self::Or, false) => Code::Or_rm32_imm32,
            (Self::Or, true) => Code::Or_rm64_imm32,
            (Self::Xor, false) => Code::Xor_rm32_imm32,
            (Self::Xor, true) => Code::Xor_rm64_imm32,
        }
    }

    const fn reg_code(self, wide: bool) -> Code {
        match (self, wide) {
            (Self::Add, false) => Code::Add_rm32_r32,
            (Self::Add, true) => Code::Add_rm64_r64,
            (Self::Sub, false) => Code::Sub_rm32_r32,
            (Self::Sub, true) => Code::Sub_rm64_r64,
            (Self::And, false) => Code::And_rm32_r32,
            (Self::And, true) => Code::And_rm64_r64,
            (Self::Or, false) => Code::Or_rm32_r32,
            (Self::Or, true) => Code::Or_rm64_r64,
            (Self::Xor, false) => Code::Xor_rm32_r32,
            (Self::Xor, true) => Code::Xor_rm64_r64,
        }
    }
}

/// A rewritable instruction, reduced to what the replacements need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Site {
    AluImm { op: Alu, dst: Register, imm: i32 },
    AluReg { op: Alu, dst: Register, src: Register },
    MovImm { dst: Register, imm: u64 },
    Neg(Register),
    Inc(Register),
    Dec(Register),
    Not(Register),
}

fn is_rewritable(reg: Register) -> bool {
    reg.is_gpr32() || reg.is_gpr64()
}

impl Site {
    fn of(instr: &Instruction) -> Option<Self> {
        if instr.reloc.is_some() || instr.target.is_some() {
            return None;
        }
        let insn = instr.insn();
        if insn.has_lock_prefix() || insn.op_count() == 0 || insn.op0_kind() != OpKind::Register {
            return None;
        }
        let dst = insn.op0_register();
        if !is_rewritable(dst) || dst.full_register() == Register::RSP {
            return None;
        }
        let wide = dst.is_gpr64();
        let op = match insn.mnemonic() {
            Mnemonic::Add => Some(Alu::Add),
            Mnemonic::Sub => Some(Alu::Sub),
            Mnemonic::And => Some(Alu::And),
            Mnemonic::Or => Some(Alu::Or),
            Mnemonic::Xor => Some(Alu::Xor),
            _ => None,
        };
        if let Some(op) = op {
            if insn.op_count() != 2 {
                return None;
            }
            return match insn.op1_kind() {
                OpKind::Register => {
                    let src = insn.op1_register();
                    let distinct = src.full_register() != dst.full_register()
                        && src.full_register() != Register::RSP;
                    let supported = matches!(op, Alu::Add | Alu::Sub | Alu::Xor);
                    (supported && distinct && src.size() == dst.size())
                        .then_some(Self::AluReg { op, dst, src })
                }
                OpKind::Immediate8
                | OpKind::Immediate32
                | OpKind::Immediate8to32
                | OpKind::Immediate8to64
                | OpKind::Immediate32to64 => {
                    let raw = insn.immediate(1);
                    let imm = if wide {
                        i32::try_from(raw as i64).ok()?
                    } else {
                        raw as u32 as i32
                    };
                    Some(Self::AluImm { op, dst, imm })
                }
                _ => None,
            };
        }
        match (insn.mnemonic(), insn.op_count()) {
            (Mnemonic::Mov, 2)
                if matches!(
                    insn.op1_kind(),
                    OpKind::Immediate32 | OpKind::Immediate64 | OpKind::Immediate32to64
                ) =>
            {
                let raw = insn.immediate(1);
                let imm = if wide { raw } else { u64::from(raw as u32) };
                Some(Self::MovImm { dst, imm })
            }
            (Mnemonic::Neg, 1) => Some(Self::Neg(dst)),
            (Mnemonic::Inc, 1) => Some(Self::Inc(dst)),
            (Mnemonic::Dec, 1) => Some(Self::Dec(dst)),
            (Mnemonic::Not, 1) => Some(Self::Not(dst)),
            _ => None,
        }
    }

    /// An equivalent sequence for the site.
    fn rewrite(self, rng: &mut StdRng) -> Result<Vec<iced_x86::Instruction>, IcedError> {
        match self {
            Self::AluImm { op, dst, imm } => alu_imm_rewrite(op, dst, imm, rng),
            Self::AluReg { op, dst, src } => alu_reg_rewrite(op, dst, src, rng),
            Self::MovImm { dst, imm } => {
                let key: i32 = rng.random();
                if dst.is_gpr64() {
                    let key64 = i64::from(key) as u64;
                    let masked = imm ^ key64;
                    let mov = match i32::try_from(masked as i64) {
                        Ok(small) => iced_x86::Instruction::with2(Code::Mov_rm64_imm32, dst, small)?,
                        Err(_) => iced_x86::Instruction::with2(Code::Mov_r64_imm64, dst, masked)?,
                    };
                    Ok(vec![mov, alu(Alu::Xor, dst, key)?])
                } else {
                    let masked = (imm as u32) ^ (key as u32);
                    Ok(vec![
                        iced_x86::Instruction::with2(Code::Mov_r32_imm32, dst, masked)?,
                        alu(Alu::Xor, dst, key)?,
                    ])
                }
            }
            // -a == ~a + 1
            Self::Neg(dst) => Ok(vec![not(dst)?, alu(Alu::Add, dst, 1)?]),
            Self::Inc(dst) => Ok(vec![alu(Alu::Add, dst, 1)?]),
            Self::Dec(dst) => Ok(vec![alu(Alu::Sub, dst, 1)?]),
            Self::Not(dst) => Ok(vec![alu(Alu::Xor, dst, -1)?]),
        }
    }
}

fn alu(op: Alu, dst: Register, imm: i32) -> Result<iced_x86::Instruction, IcedError> {
    iced_x86::Instruction::with2(op.imm_code(dst.is_gpr64()), dst, imm)
}

fn alu_rr(op: Alu, dst: Register, src: Register) -> Result<iced_x86::Instruction, IcedError> {
    iced_x86::Instruction::with2(op.reg_code(dst.is_gpr64()), dst, src)
}

fn not(dst: Register) -> Result<iced_x86::Instruction, IcedError> {
    let code = if dst.is_gpr64() { Code::Not_rm64 } else { Code::Not_rm32 };
    iced_x86::Instruction::with1(code, dst)
}

/// `~(~a - k) == a + k` and `~(~a + k) == a - k`.
fn complement_sandwich(dst: Register, inner: iced_x86::Instruction) -> Result<Vec<iced_x86::Instruction>, IcedError> {
    Ok(vec![not(dst)?, inner, not(dst)?])
}

/// Two constants that combine into `imm`, both encodable as sign-extended imm32.
fn split_sum(imm: i32, rng: &mut StdRng) -> (i32, i32) {
    let first = if imm >= 0 {
        rng.random_range(0..=imm)
    } else {
        rng.random_range(imm..=0)
    };
    (first, imm - first)
}

fn alu_imm_rewrite(op: Alu, dst: Register, imm: i32, rng: &mut StdRng) -> Result<Vec<iced_x86::Instruction>, IcedError> {
    match op {
        Alu::Add if rng.random_bool(0.5) => complement_sandwich(dst, alu(Alu::Sub, dst, imm)?),
        Alu::Add => {
            let (a, b) = split_sum(imm, rng);
            Ok(vec![alu(Alu::Add, dst, a)?, alu(Alu::Add, dst, b)?])
        }
        Alu::Sub => complement_sandwich(dst, alu(Alu::Add, dst, imm)?),
        Alu::Xor => {
            let key: i32 = rng.random();
            Ok(vec![alu(Alu::Xor, dst, key)?, alu(Alu::Xor, dst, imm ^ key)?])
        }
        // (a & (imm | r)) & (imm | !r) == a & imm
        Alu::And => {
            let noise: i32 = rng.random();
            Ok(vec![
                alu(Alu::And, dst, imm | (noise & !imm))?,
                alu(Alu::And, dst, imm | (!noise & !imm))?,
            ])
        }
        // (a | (imm & r)) | (imm & !r) == a | imm
        Alu::Or => {
            let noise: i32 = rng.random();
            Ok(vec![
                alu(Alu::Or, dst, imm & noise)?,
                alu(Alu::Or, dst, imm & !noise)?,
            ])
        }
    }
}

/// A scratch register distinct from both operands, in the destination's width.
fn temp_for(dst: Register, src: Register, rng: &mut StdRng) -> (Register, Register) {
    let full = loop {
        let candidate = SCRATCH[rng.random_range(0..SCRATCH.len())];
        if candidate != dst.full_register() && candidate != src.full_register() {
            break candidate;
        }
    };
    let view = if dst.is_gpr64() { full } else { gpr32(full) };
    (full, view)
}

/// Runs `body` with a saved temporary, stepping over the red zone first.
fn with_temp(
    full: Register,
    body: Vec<iced_x86::Instruction>,
) -> Result<Vec<iced_x86::Instruction>, IcedError> {
    let mut code = vec![insn::red_zone_enter()?, insn::push(full)?];
    code.extend(body);
    code.extend([insn::pop(full)?, insn::red_zone_leave()?]);
    Ok(code)
}

fn alu_reg_rewrite(
    op: Alu,
    dst: Register,
    src: Register,
    rng: &mut StdRng,
) -> Result<Vec<iced_x86::Instruction>, IcedError> {
    let mov = if dst.is_gpr64() { Code::Mov_r64_rm64 } else { Code::Mov_r32_rm32 };
    match op {
        Alu::Add if rng.random_bool(0.5) => complement_sandwich(dst, alu_rr(Alu::Sub, dst, src)?),
        // a + b == (a ^ b) + 2 (a & b)
        Alu::Add => {
            let (full, t) = temp_for(dst, src, rng);
            with_temp(
                full,
                vec![
                    iced_x86::Instruction::with2(mov, t, dst)?,
                    alu_rr(Alu::Xor, dst, src)?,
                    alu_rr(Alu::And, t, src)?,
                    alu_rr(Alu::Add, t, t)?,
                    alu_rr(Alu::Add, dst, t)?,
                ],
            )
        }
        Alu::Sub => complement_sandwich(dst, alu_rr(Alu::Add, dst, src)?),
        // a ^ b == (a | b) - (a & b)
        Alu::Xor => {
            let (full, t) = temp_for(dst, src, rng);
            with_temp(
                full,
                vec![
                    iced_x86::Instruction::with2(mov, t, dst)?,
                    alu_rr(Alu::And, t, src)?,
                    alu_rr(Alu::Or, dst, src)?,
                    alu_rr(Alu::Sub, dst, t)?,
                ],
            )
        }
        // Not produced by `Site::of`.
        Alu::And | Alu::Or => Ok(vec![alu_rr(op, dst, src)?]),
    }
}
