//! Proofs for opaque predicates.
//!
//! A guard is accepted only when its code is built from T-functions, i.e.
//! operations whose low `k` result bits depend only on the low `k` bits of
//! their operands. The final flag computation masks the result to `W` bits,
//! so evaluating the predicate over every assignment of the low `W` bits of
//! its inputs covers all 2^64 values of each input. Predicates without inputs
//! are constant-folded by a single evaluation.

use crate::semantics::{self, Cpu, Effect, ScratchMemory, RSP};
use iced_x86::{
    ConditionCode, Instruction, InstructionInfoFactory, Mnemonic, OpAccess, OpKind, Register,
};
use serde::{Deserialize, Serialize};
use shroud_core::cfg_ir::{Function, OpaqueGuard, PredicateKind, Terminator};
use shroud_core::module::Module;
use shroud_utils::errors::VerificationError;
use tracing::{debug, info};

/// Widest input space evaluated exhaustively, in bits.
pub const MAX_INPUT_BITS: u32 = 16;

const STACK: u64 = 0x7ff0_0000;

/// High halves mixed into every low-bit assignment as a sanity check.
const HIGH_PATTERNS: [u64; 3] = [0, 0xffff_ffff_ffff_0000, 0x5a5a_a5a5_0123_4500];

/// How a predicate was discharged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofMethod {
    /// No inputs; evaluated once.
    ConstantFold,
    /// Every assignment of the low `width` bits of each input.
    Exhaustive { width: u32, inputs: usize },
}

/// A discharged opaque predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateProof {
    /// Function holding the guard.
    pub function: String,
    /// Guard block id.
    pub block: usize,
    /// Predicate kind inserted.
    pub kind: PredicateKind,
    /// How the predicate was discharged.
    pub method: ProofMethod,
    /// Evaluations performed.
    pub cases: u64,
}

/// Proves every opaque guard of a module.
#[derive(Debug, Default)]
pub struct FormalVerifier;

impl FormalVerifier {
    /// A verifier with no state.
    pub const fn new() -> Self {
        Self
    }

    /// Proves every guard of every function. The first unproven guard fails.
    pub fn prove(&self, module: &Module) -> Result<Vec<PredicateProof>, VerificationError> {
        let mut proofs = Vec::new();
        for function in &module.functions {
            for guard in &function.guards {
                let proof = prove_guard(function, guard)?;
                debug!(
                    function = %function.name,
                    block = guard.guard.0,
                    cases = proof.cases,
                    "proved opaque predicate"
                );
                proofs.push(proof);
            }
        }
        if !proofs.is_empty() {
            info!(proofs = proofs.len(), "opaque predicates proven");
        }
        Ok(proofs)
    }
}

fn is_t_function(insn: &Instruction) -> bool {
    match insn.mnemonic() {
        Mnemonic::Mov
        | Mnemonic::Lea
        | Mnemonic::Add
        | Mnemonic::Sub
        | Mnemonic::And
        | Mnemonic::Or
        | Mnemonic::Xor
        | Mnemonic::Not
        | Mnemonic::Neg
        | Mnemonic::Push
        | Mnemonic::Pop
        | Mnemonic::Test
        | Mnemonic::Cmp => true,
        Mnemonic::Imul => insn.op_count() >= 2,
        Mnemonic::Shl => insn.op_count() == 2 && insn.op_kind(1) != OpKind::Register,
        _ => false,
    }
}

/// Stack bookkeeping around the predicate body.
fn is_frame(insn: &Instruction) -> bool {
    match insn.mnemonic() {
        Mnemonic::Push | Mnemonic::Pop => true,
        Mnemonic::Lea => insn.op0_register() == Register::RSP,
        _ => false,
    }
}

/// Registers the body reads before writing them.
fn inputs(body: &[&Instruction]) -> Vec<Register> {
    let mut factory = InstructionInfoFactory::new();
    let mut written: Vec<Register> = Vec::new();
    let mut read: Vec<Register> = Vec::new();
    for insn in body {
        let info = factory.info(insn);
        for used in info.used_registers() {
            let reg = used.register().full_register();
            if reg == Register::RSP || !reg.is_gpr64() {
                continue;
            }
            if matches!(
                used.access(),
                OpAccess::Read | OpAccess::CondRead | OpAccess::ReadWrite | OpAccess::ReadCondWrite
            ) && !written.contains(&reg)
                && !read.contains(&reg)
            {
                read.push(reg);
            }
        }
        for used in info.used_registers() {
            let reg = used.register().full_register();
            if matches!(used.access(), OpAccess::Write | OpAccess::ReadWrite) && !written.contains(&reg) {
                written.push(reg);
            }
        }
    }
    read
}

fn bit_length(value: u64) -> u32 {
    64 - value.leading_zeros()
}

fn immediate(insn: &Instruction) -> Option<u64> {
    match insn.op_kind(1) {
        OpKind::Register | OpKind::Memory => None,
        _ => Some(insn.immediate(1) & semantics::mask(insn.op0_register().size())),
    }
}

/// Bits of the final flag computation that decide `zf`.
fn width(body: &[&Instruction]) -> Option<u32> {
    let (&last, rest) = body.split_last()?;
    if last.op_kind(0) != OpKind::Register {
        return None;
    }
    match last.mnemonic() {
        Mnemonic::Test => immediate(last).map(bit_length),
        Mnemonic::Cmp => {
            let compared = immediate(last)?;
            let &masked = rest.last()?;
            if masked.mnemonic() != Mnemonic::And
                || masked.op_kind(0) != OpKind::Register
                || masked.op0_register() != last.op0_register()
            {
                return None;
            }
            let mask = immediate(masked)?;
            (compared & !mask == 0).then(|| bit_length(mask))
        }
        _ => None,
    }
}

fn refuse(function: &Function, guard: &OpaqueGuard, reason: impl Into<String>) -> VerificationError {
    VerificationError::OpaquePredicate {
        function: function.name.clone(),
        block: guard.guard.0,
        reason: reason.into(),
    }
}

/// Whether the dead edge is taken with `inputs` set to `values`.
fn dead_edge_taken(
    code: &[Instruction],
    condition: ConditionCode,
    inputs: &[Register],
    values: &[u64],
) -> Result<bool, String> {
    let mut cpu = Cpu::default();
    cpu.regs[RSP] = STACK;
    for (reg, value) in inputs.iter().zip(values) {
        cpu.write_reg(*reg, *value);
    }
    let mut memory = ScratchMemory::default();
    for insn in code {
        match semantics::execute(&mut cpu, &mut memory, insn) {
            Ok(Effect::Next) => {}
            Ok(effect) => return Err(format!("unexpected control transfer {effect:?}")),
            Err(e) => return Err(e.to_string()),
        }
    }
    if cpu.regs[RSP] != STACK {
        return Err("stack pointer not restored".into());
    }
    Ok(cpu.flags.holds(condition))
}

fn prove_guard(function: &Function, guard: &OpaqueGuard) -> Result<PredicateProof, VerificationError> {
    let block = function.block(guard.guard);
    let condition = match &block.terminator {
        Terminator::Branch {
            condition,
            taken,
            fallthrough,
        } if *taken == guard.dead && *fallthrough == guard.real => *condition,
        _ => return Err(refuse(function, guard, "guard does not branch to its dead block")),
    };
    let condition = condition.condition_code();
    if condition == ConditionCode::None {
        return Err(refuse(function, guard, "guard branch is not a jcc"));
    }

    let code: Vec<Instruction> = block.instructions.iter().map(|i| *i.insn()).collect();
    if let Some(bad) = code.iter().find(|i| !is_t_function(i)) {
        return Err(refuse(function, guard, format!("{:?} is not a T-function", bad.mnemonic())));
    }
    let body: Vec<&Instruction> = code.iter().filter(|i| !is_frame(i)).collect();
    let inputs = inputs(&body);

    let evaluate = |values: &[u64]| -> Result<(), VerificationError> {
        match dead_edge_taken(&code, condition, &inputs, values) {
            Ok(false) => Ok(()),
            Ok(true) => Err(refuse(
                function,
                guard,
                format!("dead edge taken for inputs {values:#x?}"),
            )),
            Err(reason) => Err(refuse(function, guard, reason)),
        }
    };

    if inputs.is_empty() {
        evaluate(&[])?;
        return Ok(PredicateProof {
            function: function.name.clone(),
            block: guard.guard.0,
            kind: guard.kind,
            method: ProofMethod::ConstantFold,
            cases: 1,
        });
    }

    if !matches!(condition, ConditionCode::e | ConditionCode::ne) {
        return Err(refuse(function, guard, "input-dependent predicate must test zf"));
    }
    let width = width(&body).ok_or_else(|| refuse(function, guard, "width of the final flag computation is unbounded"))?;
    let total = width * inputs.len() as u32;
    if total > MAX_INPUT_BITS {
        return Err(refuse(function, guard, format!("{total} input bits exceed the exhaustive limit")));
    }

    let mut cases = 0u64;
    for assignment in 0..(1u64 << total) {
        for high in HIGH_PATTERNS {
            let values: Vec<u64> = (0..inputs.len())
                .map(|i| {
                    let low = (assignment >> (i as u32 * width)) & semantics::mask_bits(width);
                    (high & !semantics::mask_bits(width)) | low
                })
                .collect();
            evaluate(&values)?;
            cases += 1;
        }
    }
    Ok(PredicateProof {
        function: function.name.clone(),
        block: guard.guard.0,
        kind: guard.kind,
        method: ProofMethod::Exhaustive {
            width,
            inputs: inputs.len(),
        },
        cases,
    })
}
