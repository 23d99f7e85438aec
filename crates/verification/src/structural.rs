//! Symbol, relocation and reachability checks.
//!
//! Ids are stable across passes: symbols, sections, functions and blocks are
//! only ever appended, never removed or renumbered. Every check therefore
//! compares an original entity with the transformed entity of the same id.

use serde::{Deserialize, Serialize};
use shroud_core::cfg_ir::{BlockKind, Function};
use shroud_core::module::{Module, Symbol, SymbolPlacement, SymbolType};
use shroud_utils::errors::VerificationError;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Counts of what the structural checks covered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralSummary {
    /// Symbols compared against the input.
    pub symbols_checked: usize,
    /// Local symbols whose names changed.
    pub renamed_symbols: usize,
    /// Functions whose layout was checked.
    pub functions_checked: usize,
    /// Relocations resolved in the output.
    pub relocations_checked: usize,
    /// Originally reachable blocks confirmed reachable.
    pub blocks_checked: usize,
    /// Dead blocks confirmed unreachable once guard edges are pruned.
    pub dead_blocks: usize,
}

fn renamable(symbol: &Symbol) -> bool {
    symbol.is_local() && matches!(symbol.kind, SymbolType::Func | SymbolType::Object | SymbolType::NoType)
}

fn mismatch(symbol: &Symbol, reason: impl Into<String>) -> VerificationError {
    VerificationError::SymbolMismatch {
        symbol: symbol.name.clone(),
        reason: reason.into(),
    }
}

/// Checks symbols and ABI, relocation targets and reachability.
pub fn check(original: &Module, transformed: &Module) -> Result<StructuralSummary, VerificationError> {
    let mut summary = StructuralSummary::default();
    check_symbols(original, transformed, &mut summary)?;
    check_relocations(transformed, &mut summary)?;
    for (index, function) in original.functions.iter().enumerate() {
        let Some(after) = transformed.functions.get(index) else {
            return Err(VerificationError::SymbolMismatch {
                symbol: function.name.clone(),
                reason: "function disappeared".into(),
            });
        };
        check_function(function, after, &mut summary)?;
    }
    debug!(?summary, "structural checks passed");
    Ok(summary)
}

fn check_symbols(
    original: &Module,
    transformed: &Module,
    summary: &mut StructuralSummary,
) -> Result<(), VerificationError> {
    for (index, before) in original.symbols.iter().enumerate() {
        let Some(after) = transformed.symbols.get(index) else {
            return Err(mismatch(before, "symbol disappeared"));
        };
        if after.binding != before.binding {
            return Err(mismatch(before, format!("binding {:?} became {:?}", before.binding, after.binding)));
        }
        if after.visibility != before.visibility {
            return Err(mismatch(before, "visibility changed"));
        }
        if after.kind != before.kind {
            return Err(mismatch(before, format!("type {:?} became {:?}", before.kind, after.kind)));
        }
        if after.placement != before.placement {
            return Err(mismatch(before, "moved to another section"));
        }
        if before.kind == SymbolType::Object && after.size != before.size {
            return Err(mismatch(before, format!("size {} became {}", before.size, after.size)));
        }
        if after.name != before.name {
            if !renamable(before) || after.name.is_empty() {
                return Err(mismatch(before, format!("renamed to `{}`", after.name)));
            }
            summary.renamed_symbols += 1;
        }
        summary.symbols_checked += 1;
    }

    // Renamed locals must not collide with any name; defined globals with
    // each other.
    let mut exported: HashMap<&str, usize> = HashMap::new();
    for (index, symbol) in transformed.symbols.iter().enumerate() {
        let renamed = original
            .symbols
            .get(index)
            .is_some_and(|before| before.name != symbol.name);
        if renamed && transformed.symbols.iter().filter(|s| s.name == symbol.name).count() > 1 {
            return Err(mismatch(symbol, "renamed to a name already in use"));
        }
        if !symbol.is_local() && symbol.placement != SymbolPlacement::Undefined && !symbol.name.is_empty() {
            *exported.entry(symbol.name.as_str()).or_default() += 1;
        }
    }
    if let Some((name, _)) = exported.iter().find(|(_, count)| **count > 1) {
        return Err(VerificationError::SymbolMismatch {
            symbol: (*name).to_string(),
            reason: "defined more than once".into(),
        });
    }
    Ok(())
}

fn check_relocations(module: &Module, summary: &mut StructuralSummary) -> Result<(), VerificationError> {
    let symbols = module.symbols.len();
    for section in &module.sections {
        for rel in &section.relocations {
            if rel.symbol.0 >= symbols {
                return Err(VerificationError::RelocationIntegrity(format!(
                    "relocation at {:#x} in `{}` refers to missing symbol {}",
                    rel.offset, section.name, rel.symbol.0
                )));
            }
            summary.relocations_checked += 1;
        }
    }
    for function in &module.functions {
        for block in &function.blocks {
            let relocs = block
                .instructions
                .iter()
                .chain(block.terminator.instruction())
                .filter_map(|insn| insn.reloc.as_ref());
            for reloc in relocs {
                if reloc.symbol.0 >= symbols {
                    return Err(VerificationError::RelocationIntegrity(format!(
                        "block {} of `{}` refers to missing symbol {}",
                        block.id.0, function.name, reloc.symbol.0
                    )));
                }
                summary.relocations_checked += 1;
            }
        }
    }
    Ok(())
}

fn check_function(
    before: &Function,
    after: &Function,
    summary: &mut StructuralSummary,
) -> Result<(), VerificationError> {
    let lost = |reason: String| VerificationError::SymbolMismatch {
        symbol: before.name.clone(),
        reason,
    };
    if after.symbol != before.symbol || after.section != before.section {
        return Err(lost("function no longer starts at its symbol".into()));
    }
    after
        .validate()
        .map_err(|reason| lost(format!("malformed control flow: {reason}")))?;

    let pruned: Vec<_> = after.guards.iter().map(|g| (g.guard, g.dead)).collect();
    let reachable = after.reachable_without(&pruned);

    for block in before.reachable().iter_ones() {
        if !reachable.get(block).is_some_and(|bit| *bit) {
            return Err(VerificationError::Unreachable {
                function: before.name.clone(),
                block,
            });
        }
        summary.blocks_checked += 1;
    }

    let dead: BTreeSet<usize> = after
        .guards
        .iter()
        .map(|g| g.dead.0)
        .chain(after.blocks.iter().filter(|b| b.kind == BlockKind::Dead).map(|b| b.id.0))
        .collect();
    for block in dead {
        if reachable.get(block).is_some_and(|bit| *bit) {
            return Err(VerificationError::DeadPathReachable {
                function: before.name.clone(),
                block,
            });
        }
        summary.dead_blocks += 1;
    }
    summary.functions_checked += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, ConditionCode};
    use object::{elf, SectionKind};
    use shroud_core::cfg_ir::{BlockId, Instruction, OpaqueGuard, PredicateKind, Terminator};
    use shroud_core::insn;
    use shroud_core::module::{Relocation, Section, SectionRole, SymbolBinding, SymbolId};

    fn ret() -> Terminator {
        Terminator::Return(Instruction::new(insn::ret()))
    }

    /// `f` with a diamond, a local helper symbol and a data object.
    fn module() -> Module {
        let mut module = Module::default();
        let mut text = Section::synthesized(
            ".text",
            SectionKind::Text,
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            16,
            SectionRole::Code,
        );
        text.synthesized = false;
        let text = module.add_section(text);
        let mut symbol = Symbol::local("f", SymbolType::Func, text, 0, 0);
        symbol.binding = SymbolBinding::Global;
        let symbol = module.add_symbol(symbol);
        module.add_symbol(Symbol::local("helper", SymbolType::Func, text, 0, 0));
        module.add_symbol(Symbol::local("table", SymbolType::Object, text, 0, 8));
        let mut f = Function::synthesized("f", symbol, text, 16);
        f.synthesized = false;
        f.add_block(
            Vec::new(),
            Terminator::Branch {
                condition: insn::jcc(ConditionCode::e),
                taken: BlockId(2),
                fallthrough: BlockId(1),
            },
            BlockKind::Original,
        );
        f.add_block(Vec::new(), Terminator::Jump(BlockId(2)), BlockKind::Original);
        f.add_block(Vec::new(), ret(), BlockKind::Original);
        f.layout = vec![BlockId(0), BlockId(1), BlockId(2)];
        module.add_function(f);
        module
    }

    /// Guards block 1 with a guard whose dead block rejoins it.
    fn guard_block_one(module: &mut Module) {
        let f = &mut module.functions[0];
        let dead = f.add_block(Vec::new(), Terminator::Jump(BlockId(1)), BlockKind::Dead);
        let guard = f.add_block(
            Vec::new(),
            Terminator::Branch {
                condition: insn::jcc(ConditionCode::ne),
                taken: dead,
                fallthrough: BlockId(1),
            },
            BlockKind::Guard,
        );
        f.blocks[0].terminator.retarget(BlockId(1), guard);
        f.layout.extend([guard, dead]);
        f.guards.push(OpaqueGuard {
            guard,
            real: BlockId(1),
            dead,
            kind: PredicateKind::AlwaysTrue,
        });
    }

    #[test]
    fn identity_passes() {
        let original = module();
        let summary = check(&original, &original).unwrap();
        assert_eq!(summary.symbols_checked, 3);
        assert_eq!(summary.blocks_checked, 3);
        assert_eq!(summary.renamed_symbols, 0);
    }

    #[test]
    fn guarded_block_stays_reachable_and_dead_block_does_not() {
        let original = module();
        let mut transformed = original.clone();
        guard_block_one(&mut transformed);
        let summary = check(&original, &transformed).unwrap();
        assert_eq!(summary.blocks_checked, 3);
        assert_eq!(summary.dead_blocks, 1);
    }

    #[test]
    fn reachable_dead_block_is_rejected() {
        let original = module();
        let mut transformed = original.clone();
        guard_block_one(&mut transformed);
        // A second edge into the dead block that is not a guard edge.
        let dead = transformed.functions[0].guards[0].dead;
        transformed.functions[0].blocks[2].terminator = Terminator::Jump(dead);
        let err = check(&original, &transformed).unwrap_err();
        assert!(matches!(err, VerificationError::DeadPathReachable { .. }));
    }

    #[test]
    fn dropped_edge_makes_block_unreachable() {
        let original = module();
        let mut transformed = original.clone();
        transformed.functions[0].blocks[0].terminator = Terminator::Jump(BlockId(2));
        let err = check(&original, &transformed).unwrap_err();
        assert!(matches!(err, VerificationError::Unreachable { block: 1, .. }));
    }

    #[test]
    fn only_local_symbols_may_be_renamed() {
        let original = module();
        let mut renamed = original.clone();
        renamed.symbols[1].name = "_x1".into();
        assert_eq!(check(&original, &renamed).unwrap().renamed_symbols, 1);

        let mut global = original.clone();
        global.symbols[0].name = "g".into();
        global.functions[0].name = "g".into();
        assert!(matches!(
            check(&original, &global).unwrap_err(),
            VerificationError::SymbolMismatch { .. }
        ));
    }

    #[test]
    fn renamed_collision_is_rejected() {
        let original = module();
        let mut renamed = original.clone();
        renamed.symbols[1].name = "_dup".into();
        renamed.symbols[2].name = "_dup".into();
        assert!(check(&original, &renamed).is_err());
    }

    #[test]
    fn object_size_is_part_of_the_abi() {
        let original = module();
        let mut resized = original.clone();
        resized.symbols[2].size = 16;
        let err = check(&original, &resized).unwrap_err();
        assert!(err.to_string().contains("size 8 became 16"));
    }

    #[test]
    fn dangling_relocation_is_rejected() {
        let original = module();
        let mut broken = original.clone();
        broken.sections[0].relocations.push(Relocation {
            offset: 0,
            symbol: SymbolId(99),
            r_type: elf::R_X86_64_PC32,
            addend: -4,
        });
        let err = check(&original, &broken).unwrap_err();
        assert!(matches!(err, VerificationError::RelocationIntegrity(_)));
    }

    #[test]
    fn added_instructions_keep_the_structure() {
        let original = module();
        let mut transformed = original.clone();
        transformed.functions[0].blocks[2]
            .instructions
            .push(Instruction::new(iced_x86::Instruction::with(Code::Nopd)));
        assert!(check(&original, &transformed).is_ok());
    }
}
