//! Bogus control flow guarded by opaque predicates.

use crate::util::{for_each_function, wrap, PassStats, Transform};
use iced_x86::{Code, ConditionCode, IcedError, MemoryOperand, Register};
use rand::prelude::SliceRandom;
use rand::{rngs::StdRng, Rng};
use sha3::{Digest, Keccak256};
use shroud_analysis::FlagsLiveness;
use shroud_core::cfg_ir::{
    BlockId, BlockKind, Function, Invariant, OpaqueGuard, PredicateKind, Terminator,
};
use shroud_core::insn::{self, gpr32, gpr64, SCRATCH};
use shroud_core::module::Module;
use shroud_utils::errors::TransformError;
use tracing::debug;

/// Inserts opaque-predicate guards in front of basic blocks.
///
/// A guard evaluates a predicate whose outcome is fixed and branches to a dead
/// block on the outcome that never happens. The dead block holds junk and
/// jumps back to the real block, so the CFG looks like a genuine two-way split.
#[derive(Debug, Clone)]
pub struct OpaquePredicate {
    percent: u8,
}

impl OpaquePredicate {
    /// Guards roughly `percent` percent of eligible blocks.
    pub const fn new(percent: u8) -> Self {
        Self { percent }
    }

    fn generate_constant(seed: u64) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(seed.to_le_bytes());
        hasher.finalize().into()
    }

    fn guard_function(&self, function: &mut Function, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        let mut stats = PassStats::default();
        let liveness = FlagsLiveness::compute(function);
        let reachable = function.reachable();
        let mut eligible: Vec<BlockId> = function
            .blocks
            .iter()
            .filter(|b| {
                reachable[b.id.0]
                    && b.kind == BlockKind::Original
                    && !b.address_taken
                    && liveness.live_in(b.id.0) == 0
            })
            .map(|b| b.id)
            .collect();

        let count = (eligible.len() * usize::from(self.percent)).div_ceil(100);
        stats.note("eligible_blocks", eligible.len() as u64);
        if count == 0 {
            return Ok(stats);
        }
        eligible.shuffle(rng);

        for real in eligible.into_iter().take(count) {
            let kind = match rng.random_range(0..4) {
                0 => PredicateKind::AlwaysTrue,
                1 => PredicateKind::AlwaysFalse,
                2 => PredicateKind::Invariant(Invariant::ProductParity),
                _ => PredicateKind::Invariant(Invariant::SquareResidue),
            };
            let scratch = SCRATCH[rng.random_range(0..SCRATCH.len())];
            let input = loop {
                let candidate = gpr64(rng.random_range(0..16));
                if candidate != Register::RSP && candidate != scratch {
                    break candidate;
                }
            };
            let constant = Self::generate_constant(rng.random());
            let (body, condition) =
                predicate(kind, scratch, input, &constant).map_err(|e| TransformError::Function {
                    pass: self.name().into(),
                    function: function.name.clone(),
                    reason: e.to_string(),
                })?;

            let mut guard_code = vec![insn::red_zone_enter(), insn::push(scratch)];
            guard_code.extend(body.into_iter().map(Ok));
            guard_code.extend([insn::pop(scratch), insn::red_zone_leave()]);
            let dead = function.add_block(wrap(junk(rng))?, Terminator::Jump(real), BlockKind::Dead);
            let guard = function.add_block(
                wrap(guard_code)?,
                Terminator::Branch {
                    condition,
                    taken: dead,
                    fallthrough: real,
                },
                BlockKind::Guard,
            );
            function.redirect(real, guard, &[guard, dead]);
            function.place_before(guard, real);
            let at = rng.random_range(1..=function.layout.len());
            function.layout.insert(at, dead);
            function.guards.push(OpaqueGuard {
                guard,
                real,
                dead,
                kind,
            });
            stats.bump("bogus_blocks", 1);
        }
        debug!(
            function = %function.name,
            guards = stats.get("bogus_blocks"),
            "inserted opaque predicates"
        );
        Ok(stats)
    }
}

impl Transform for OpaquePredicate {
    fn name(&self) -> &'static str {
        "bogus"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        for_each_function(module, rng, |function, rng| self.guard_function(function, rng))
    }
}

/// Predicate code over `scratch` and the branch code that reaches the dead path.
///
/// The dead branch is never taken:
/// - `AlwaysTrue`: `(c1 ^ c2) == (c1 ^ c2)`, dead on inequality;
/// - `AlwaysFalse`: `c1 + c2 == (c1 + c2) ^ d` with `d != 0`, dead on equality;
/// - `ProductParity`: `x * (x + 1)` has its low bit clear, dead when set;
/// - `SquareResidue`: `x * x mod 4` is 0 or 1, dead when it equals 2.
fn predicate(
    kind: PredicateKind,
    scratch: Register,
    input: Register,
    constant: &[u8; 32],
) -> Result<(Vec<iced_x86::Instruction>, Code), IcedError> {
    let word = |at: usize| u32::from_le_bytes([constant[at], constant[at + 1], constant[at + 2], constant[at + 3]]);
    let (c1, c2, delta) = (word(0), word(4), word(8) | 1);
    let sr = gpr32(scratch);
    let x = gpr32(input);
    Ok(match kind {
        PredicateKind::AlwaysTrue => (
            vec![
                insn::mov_imm32(scratch, c1)?,
                iced_x86::Instruction::with2(Code::Xor_rm32_imm32, sr, c2)?,
                insn::cmp_imm32(scratch, c1 ^ c2)?,
            ],
            insn::jcc(ConditionCode::ne),
        ),
        PredicateKind::AlwaysFalse => (
            vec![
                insn::mov_imm32(scratch, c1)?,
                iced_x86::Instruction::with2(Code::Add_rm32_imm32, sr, c2)?,
                insn::cmp_imm32(scratch, c1.wrapping_add(c2) ^ delta)?,
            ],
            insn::jcc(ConditionCode::e),
        ),
        PredicateKind::Invariant(Invariant::ProductParity) => (
            vec![
                iced_x86::Instruction::with2(
                    Code::Lea_r32_m,
                    sr,
                    MemoryOperand::with_base_displ(input, 1),
                )?,
                iced_x86::Instruction::with2(Code::Imul_r32_rm32, sr, x)?,
                iced_x86::Instruction::with2(Code::Test_rm32_imm32, sr, 1u32)?,
            ],
            insn::jcc(ConditionCode::ne),
        ),
        PredicateKind::Invariant(Invariant::SquareResidue) => (
            vec![
                iced_x86::Instruction::with2(Code::Mov_r32_rm32, sr, x)?,
                iced_x86::Instruction::with2(Code::Imul_r32_rm32, sr, sr)?,
                iced_x86::Instruction::with2(Code::And_rm32_imm8, sr, 3i32)?,
                iced_x86::Instruction::with2(Code::Cmp_rm32_imm8, sr, 2i32)?,
            ],
            insn::jcc(ConditionCode::e),
        ),
    })
}

/// Plausible arithmetic for a block that never runs.
fn junk(rng: &mut StdRng) -> Vec<Result<iced_x86::Instruction, IcedError>> {
    let mut code = Vec::new();
    for _ in 0..rng.random_range(2..=5) {
        let a = SCRATCH[rng.random_range(0..SCRATCH.len())];
        let b = SCRATCH[rng.random_range(0..SCRATCH.len())];
        let value: u32 = rng.random();
        code.push(match rng.random_range(0..5) {
            0 => insn::mov_imm32(a, value),
            1 => iced_x86::Instruction::with2(Code::Add_rm64_r64, a, b),
            2 => iced_x86::Instruction::with2(Code::Xor_rm32_imm32, gpr32(a), value),
            3 => iced_x86::Instruction::with2(Code::Imul_r32_rm32, gpr32(a), gpr32(b)),
            _ => iced_x86::Instruction::with2(
                Code::Lea_r64_m,
                a,
                MemoryOperand::with_base_index_scale_displ_size(b, a, 2, i64::from(value as i8), 1),
            ),
        });
    }
    code
}
