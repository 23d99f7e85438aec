//! Test programs as modules and as ELF objects.

use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, ConditionCode, InstructionBlock, Register};
use object::write::{Object, StandardSection, Symbol as WriteSymbol, SymbolSection};
use object::{elf, Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope};
use shroud_core::cfg_ir::{BlockId, BlockKind, Function, Instruction, Terminator};
use shroud_core::insn;
use shroud_core::module::{Module, Section, SectionId, SectionRole, Symbol, SymbolBinding, SymbolType};
use shroud_core::{emit, EmitOptions};
use shroud_verification::VerificationConfig;

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Development settings with a step budget sized for the fixtures, so a
/// random `sum` bound gives up early instead of emulating millions of steps.
pub fn verification() -> VerificationConfig {
    VerificationConfig {
        step_limit: 4_000,
        ..VerificationConfig::development()
    }
}

fn rr(code: Code, a: Register, b: Register) -> Instruction {
    Instruction::new(iced_x86::Instruction::with2(code, a, b).expect("valid operands"))
}

fn ri(code: Code, a: Register, imm: i32) -> Instruction {
    Instruction::new(iced_x86::Instruction::with2(code, a, imm).expect("valid operands"))
}

fn ret() -> Terminator {
    Terminator::Return(Instruction::new(insn::ret()))
}

fn branch(condition: ConditionCode, taken: usize, fallthrough: usize) -> Terminator {
    Terminator::Branch {
        condition: insn::jcc(condition),
        taken: BlockId(taken),
        fallthrough: BlockId(fallthrough),
    }
}

fn text_section(module: &mut Module) -> SectionId {
    let mut text = Section::synthesized(
        ".text",
        SectionKind::Text,
        elf::SHT_PROGBITS,
        u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
        16,
        SectionRole::Code,
    );
    text.synthesized = false;
    module.add_section(text)
}

/// Adds a global function built by `build` to `text`.
fn add_function(module: &mut Module, text: SectionId, name: &str, build: impl FnOnce(&mut Function)) {
    let mut symbol = Symbol::local(name, SymbolType::Func, text, 0, 0);
    symbol.binding = SymbolBinding::Global;
    let symbol = module.add_symbol(symbol);
    let mut function = Function::synthesized(name, symbol, text, 16);
    function.synthesized = false;
    build(&mut function);
    function.layout = (0..function.blocks.len()).map(BlockId).collect();
    module.add_function(function);
}

/// `max(a, b)` over signed ints.
fn build_max(f: &mut Function) {
    f.add_block(
        vec![
            rr(Code::Mov_r32_rm32, Register::EAX, Register::EDI),
            rr(Code::Cmp_r32_rm32, Register::EDI, Register::ESI),
        ],
        branch(ConditionCode::ge, 2, 1),
        BlockKind::Original,
    );
    f.add_block(
        vec![rr(Code::Mov_r32_rm32, Register::EAX, Register::ESI)],
        Terminator::Jump(BlockId(2)),
        BlockKind::Original,
    );
    f.add_block(Vec::new(), ret(), BlockKind::Original);
}

/// `classify(x)`: -1 for negatives, 0 for zero, 1 for odd, 2 for even.
fn build_classify(f: &mut Function) {
    f.add_block(
        vec![rr(Code::Test_rm32_r32, Register::EDI, Register::EDI)],
        branch(ConditionCode::l, 1, 2),
        BlockKind::Original,
    );
    f.add_block(
        vec![ri(Code::Mov_r32_imm32, Register::EAX, -1)],
        ret(),
        BlockKind::Original,
    );
    f.add_block(
        vec![rr(Code::Test_rm32_r32, Register::EDI, Register::EDI)],
        branch(ConditionCode::ne, 4, 3),
        BlockKind::Original,
    );
    f.add_block(
        vec![rr(Code::Xor_r32_rm32, Register::EAX, Register::EAX)],
        ret(),
        BlockKind::Original,
    );
    f.add_block(
        vec![
            rr(Code::Mov_r32_rm32, Register::EAX, Register::EDI),
            ri(Code::And_rm32_imm8, Register::EAX, 1),
        ],
        branch(ConditionCode::ne, 5, 6),
        BlockKind::Original,
    );
    f.add_block(
        vec![ri(Code::Mov_r32_imm32, Register::EAX, 1)],
        ret(),
        BlockKind::Original,
    );
    f.add_block(
        vec![ri(Code::Mov_r32_imm32, Register::EAX, 2)],
        ret(),
        BlockKind::Original,
    );
}

/// `sum(n) = n + (n - 1) + ... + 1` with a counted loop.
fn build_sum(f: &mut Function) {
    f.add_block(
        vec![
            rr(Code::Xor_r32_rm32, Register::EAX, Register::EAX),
            rr(Code::Test_rm32_r32, Register::EDI, Register::EDI),
        ],
        branch(ConditionCode::le, 2, 1),
        BlockKind::Original,
    );
    f.add_block(
        vec![
            rr(Code::Add_rm32_r32, Register::EAX, Register::EDI),
            ri(Code::Sub_rm32_imm8, Register::EDI, 1),
        ],
        branch(ConditionCode::ne, 1, 2),
        BlockKind::Original,
    );
    f.add_block(Vec::new(), ret(), BlockKind::Original);
}

/// A module with `max`, `classify` and `sum`.
pub fn program() -> Module {
    let mut module = Module::default();
    let text = text_section(&mut module);
    add_function(&mut module, text, "max", build_max);
    add_function(&mut module, text, "classify", build_classify);
    add_function(&mut module, text, "sum", build_sum);
    module
}

/// A module with `max` only.
pub fn max_program() -> Module {
    let mut module = Module::default();
    let text = text_section(&mut module);
    add_function(&mut module, text, "max", build_max);
    module
}

/// Emits `module` as an ELF relocatable object.
pub fn object(module: &Module) -> Vec<u8> {
    emit(module, &EmitOptions::default()).expect("fixture emits")
}

/// `main` summing 5..1 in a loop and returning 0 when the sum is 15,
/// assembled with the block encoder and written with `object`.
pub fn main_object() -> Vec<u8> {
    const BASE: u64 = 0x1000;
    let at = |index: u64| BASE + index;
    let op = |code: Code, a: Register, imm: i32| iced_x86::Instruction::with2(code, a, imm).expect("valid operands");
    let reg = |code: Code, a: Register, b: Register| iced_x86::Instruction::with2(code, a, b).expect("valid operands");
    let jne = |target: u64| iced_x86::Instruction::with_branch(Code::Jne_rel32_64, target).expect("valid branch");

    let mut code = vec![
        reg(Code::Xor_r32_rm32, Register::EAX, Register::EAX),
        op(Code::Mov_r32_imm32, Register::ECX, 5),
        // loop:
        reg(Code::Add_r32_rm32, Register::EAX, Register::ECX),
        op(Code::Sub_rm32_imm8, Register::ECX, 1),
        jne(at(2)),
        op(Code::Cmp_rm32_imm8, Register::EAX, 15),
        jne(at(9)),
        reg(Code::Xor_r32_rm32, Register::EAX, Register::EAX),
        iced_x86::Instruction::with(Code::Retnq),
        // fail:
        op(Code::Mov_r32_imm32, Register::EAX, 1),
        iced_x86::Instruction::with(Code::Retnq),
    ];
    for (index, insn) in code.iter_mut().enumerate() {
        insn.set_ip(at(index as u64));
    }
    let bytes = BlockEncoder::encode(64, InstructionBlock::new(&code, 0), BlockEncoderOptions::NONE)
        .expect("fixture assembles")
        .code_buffer;

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, &bytes, 16);
    obj.add_symbol(WriteSymbol {
        name: b"main".to_vec(),
        value: offset,
        size: bytes.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    obj.write().expect("fixture writes")
}
