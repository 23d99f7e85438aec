//! Anti-debugging checks inserted at function entries.

use crate::util::{for_each_function, wrap, PassStats, Transform};
use iced_x86::{Code, ConditionCode, MemoryOperand, Register};
use rand::rngs::StdRng;
use shroud_core::cfg_ir::{BlockId, BlockKind, Function, Instruction, Target, Terminator};
use shroud_core::insn;
use shroud_core::module::Module;
use shroud_utils::errors::TransformError;
use tracing::debug;

/// Instructions at the start of a function checked for breakpoints.
const CHECKED_INSTRUCTIONS: usize = 3;

/// Software breakpoint opcode.
const INT3: u8 = 0xcc;

/// Breakpoint detection at function entry.
///
/// A chain of check blocks in front of the entry reads the first byte of each
/// of the first few entry instructions and traps with `ud2` when one of them
/// has been patched to `int3`. Flags are dead at entry under the System V
/// ABI, so the comparisons are invisible to the function body.
#[derive(Debug, Clone, Copy, Default)]
pub struct AntiDebug;

impl AntiDebug {
    fn protect_function(function: &mut Function) -> Result<PassStats, TransformError> {
        let mut stats = PassStats::default();
        let entry = function.entry;
        let targets = checked_targets(function, entry)?;
        if targets.is_empty() {
            return Ok(stats);
        }

        let trap = function.add_block(
            Vec::new(),
            Terminator::Trap(Instruction::new(insn::ud2())),
            BlockKind::Check,
        );
        let mut next = entry;
        let mut checks = Vec::with_capacity(targets.len());
        for target in targets.into_iter().rev() {
            let load = iced_x86::Instruction::with2(
                Code::Movzx_r32_rm8,
                Register::EAX,
                MemoryOperand::with_base_displ(Register::RIP, 0),
            )?;
            let mut code = wrap([
                insn::red_zone_enter(),
                insn::push(Register::RAX),
                Ok(load),
                iced_x86::Instruction::with2(Code::Cmp_rm8_imm8, Register::AL, u32::from(INT3)),
                insn::pop(Register::RAX),
                insn::red_zone_leave(),
            ])?;
            code[2].target = Some(target);
            let check = function.add_block(
                code,
                Terminator::Branch {
                    condition: insn::jcc(ConditionCode::e),
                    taken: trap,
                    fallthrough: next,
                },
                BlockKind::Check,
            );
            checks.push(check);
            next = check;
        }
        checks.reverse();
        function.entry = next;
        function.layout.splice(0..0, checks.iter().copied());
        function.layout.push(trap);
        stats.bump("checks", checks.len() as u64);
        debug!(function = %function.name, checks = checks.len(), "inserted breakpoint checks");
        Ok(stats)
    }
}

/// Addresses of the entry instructions worth checking. Instructions that
/// already start with `0xcc` are left out; later ones need their input offset
/// to be addressable.
fn checked_targets(function: &Function, entry: BlockId) -> Result<Vec<Target>, TransformError> {
    let mut targets = Vec::new();
    for (index, instr) in function
        .block(entry)
        .instructions
        .iter()
        .take(CHECKED_INSTRUCTIONS)
        .enumerate()
    {
        if instr.first_byte()? == INT3 {
            continue;
        }
        let target = match (index, instr.origin) {
            (0, _) => Target::Block(entry),
            (_, Some(origin)) => Target::Code(origin),
            (_, None) => break,
        };
        targets.push(target);
    }
    Ok(targets)
}

impl Transform for AntiDebug {
    fn name(&self) -> &'static str {
        "anti"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        for_each_function(module, rng, |function, _| Self::protect_function(function))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{max_module, ret, single_function};
    use rand::SeedableRng;

    #[test]
    fn entry_moves_to_the_check_chain() {
        let mut module = max_module();
        let mut rng = StdRng::seed_from_u64(0);
        let stats = AntiDebug.apply(&mut module, &mut rng).unwrap();
        let function = &module.functions[0];
        function.validate().unwrap();
        // Only the first instruction has an address without an input offset.
        assert_eq!(stats.get("checks"), 1);
        let check = function.block(function.entry);
        assert_eq!(check.kind, BlockKind::Check);
        assert_eq!(check.instructions[2].target, Some(Target::Block(BlockId(0))));
        let Terminator::Branch { taken, fallthrough, .. } = check.terminator else {
            panic!("check must branch");
        };
        assert_eq!(fallthrough, BlockId(0));
        assert!(matches!(function.block(taken).terminator, Terminator::Trap(_)));
    }

    #[test]
    fn decoded_instructions_are_checked_by_offset() {
        let mut module = max_module();
        let block = &mut module.functions[0].blocks[0];
        for (offset, instr) in block.instructions.iter_mut().enumerate() {
            instr.origin = Some(offset as u64 * 2);
        }
        let mut rng = StdRng::seed_from_u64(0);
        let stats = AntiDebug.apply(&mut module, &mut rng).unwrap();
        assert_eq!(stats.get("checks"), 2);
        let function = &module.functions[0];
        let second = function.layout[1];
        assert_eq!(function.block(second).instructions[2].target, Some(Target::Code(2)));
    }

    #[test]
    fn empty_entry_is_not_checked() {
        let mut module = single_function("leaf", |f| {
            f.add_block(Vec::new(), ret(), BlockKind::Original);
        });
        let mut rng = StdRng::seed_from_u64(0);
        let stats = AntiDebug.apply(&mut module, &mut rng).unwrap();
        assert!(!stats.changed);
    }
}
