//! Obfuscation passes over lifted object modules and the pipeline that runs them.

#[cfg(feature = "anti-debug")]
pub mod anti_debug;
pub mod config;
pub mod flatten;
pub mod obfuscator;
pub mod opaque_predicate;
pub mod pass;
pub mod progress;
pub mod string_encryption;
pub mod substitution;
pub mod symbol_rename;
pub mod util;

pub use config::{level_passes, parse_pass_order, PassSpec, PipelineConfig};
pub use obfuscator::{
    obfuscate, CancelToken, FailureReport, ObfuscationError, ObfuscationReport, ObfuscationResult, RunState,
};
pub use pass::{apply_pass, run_pass};
pub use progress::{Event, EventSink, EventState, NullSink, Stage};
pub use util::{PassStats, Transform};

#[cfg(test)]
pub(crate) mod test_support {
    use iced_x86::{Code, Register};
    use object::{elf, SectionKind};
    use shroud_core::cfg_ir::{BlockId, BlockKind, Function, Instruction, Terminator};
    use shroud_core::insn;
    use shroud_core::module::{Module, Section, SectionRole, Symbol, SymbolBinding, SymbolType};

    pub(crate) fn rr(code: Code, a: Register, b: Register) -> Instruction {
        Instruction::new(iced_x86::Instruction::with2(code, a, b).unwrap())
    }

    pub(crate) fn ri(code: Code, a: Register, imm: i32) -> Instruction {
        Instruction::new(iced_x86::Instruction::with2(code, a, imm).unwrap())
    }

    pub(crate) fn ret() -> Terminator {
        Terminator::Return(Instruction::new(insn::ret()))
    }

    /// A module with one global function in `.text`, built by `build`.
    pub(crate) fn single_function(name: &str, build: impl FnOnce(&mut Function)) -> Module {
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
        let mut symbol = Symbol::local(name, SymbolType::Func, text, 0, 0);
        symbol.binding = SymbolBinding::Global;
        let symbol = module.add_symbol(symbol);
        let mut function = Function::synthesized(name, symbol, text, 16);
        function.synthesized = false;
        build(&mut function);
        function.layout = (0..function.blocks.len()).map(BlockId).collect();
        module.add_function(function);
        module
    }

    /// `max(edi, esi)` over signed ints.
    pub(crate) fn max_module() -> Module {
        single_function("max", |f| {
            f.add_block(
                vec![
                    rr(Code::Mov_r32_rm32, Register::EAX, Register::EDI),
                    rr(Code::Cmp_r32_rm32, Register::EDI, Register::ESI),
                ],
                Terminator::Branch {
                    condition: insn::jcc(iced_x86::ConditionCode::ge),
                    taken: BlockId(2),
                    fallthrough: BlockId(1),
                },
                BlockKind::Original,
            );
            f.add_block(
                vec![rr(Code::Mov_r32_rm32, Register::EAX, Register::ESI)],
                Terminator::Jump(BlockId(2)),
                BlockKind::Original,
            );
            f.add_block(Vec::new(), ret(), BlockKind::Original);
        })
    }

    /// `sum(n) = n + (n - 1) + ... + 1` with a counted loop.
    pub(crate) fn sum_module() -> Module {
        single_function("sum", |f| {
            f.add_block(
                vec![
                    rr(Code::Xor_r32_rm32, Register::EAX, Register::EAX),
                    rr(Code::Test_rm32_r32, Register::EDI, Register::EDI),
                ],
                Terminator::Branch {
                    condition: insn::jcc(iced_x86::ConditionCode::le),
                    taken: BlockId(2),
                    fallthrough: BlockId(1),
                },
                BlockKind::Original,
            );
            f.add_block(
                vec![
                    rr(Code::Add_rm32_r32, Register::EAX, Register::EDI),
                    ri(Code::Sub_rm32_imm8, Register::EDI, 1),
                ],
                Terminator::Branch {
                    condition: insn::jcc(iced_x86::ConditionCode::ne),
                    taken: BlockId(1),
                    fallthrough: BlockId(2),
                },
                BlockKind::Original,
            );
            f.add_block(Vec::new(), ret(), BlockKind::Original);
        })
    }

    /// `sum(ecx)` driven by `loop`, which has no rel32 form.
    pub(crate) fn loop_module() -> Module {
        single_function("count", |f| {
            f.add_block(
                vec![rr(Code::Xor_r32_rm32, Register::EAX, Register::EAX)],
                Terminator::Jump(BlockId(1)),
                BlockKind::Original,
            );
            f.add_block(
                vec![rr(Code::Add_rm32_r32, Register::EAX, Register::ECX)],
                Terminator::Branch {
                    condition: Code::Loop_rel8_64_RCX,
                    taken: BlockId(1),
                    fallthrough: BlockId(2),
                },
                BlockKind::Original,
            );
            f.add_block(Vec::new(), ret(), BlockKind::Original);
        })
    }
}
