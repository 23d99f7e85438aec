//! String literal encryption.
//!
//! Literals from mergeable string sections move into a writable section in
//! encrypted form. Every instruction that references one is preceded by a
//! call to a per-literal stub that decrypts it in place on first use:
//!
//! ```text
//! lea rsp, [rsp-128]
//! call shroud_decrypt.N
//! lea rsp, [rsp+128]
//! lea rdi, [rip + .data.shroud.str + off]
//! ```
//!
//! The stub serializes concurrent first uses with a per-literal state byte
//! (0 plain, 1 decrypting, 2 done) taken with `lock cmpxchg`, and preserves
//! every register and flag it touches.

use crate::util::{wrap, PassStats, Transform};
use iced_x86::{Code, ConditionCode, IcedError, MemoryOperand, Register};
use object::{elf, SectionKind};
use rand::{rngs::StdRng, Rng};
use shroud_core::cfg_ir::{BlockId, BlockKind, Function, InstrReloc, Instruction, RelocField, Terminator};
use shroud_core::insn;
use shroud_core::module::{
    FunctionId, Module, Section, SectionId, SectionRole, Symbol, SymbolId, SymbolType,
};
use shroud_utils::errors::TransformError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Section receiving the encrypted literals and their state bytes.
pub const DATA_SECTION: &str = ".data.shroud.str";
/// Section receiving the decrypt stubs.
pub const TEXT_SECTION: &str = ".text.shroud";

/// Relocation types whose value is the plain address of symbol plus addend.
const ADDRESS_RELOCS: [u32; 4] = [
    elf::R_X86_64_PC32,
    elf::R_X86_64_32,
    elf::R_X86_64_32S,
    elf::R_X86_64_64,
];

/// A NUL-terminated literal inside a string section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Literal {
    section: SectionId,
    start: u64,
    /// Length including the terminator.
    len: u64,
}

/// A code reference to a literal.
#[derive(Debug, Clone, Copy)]
struct Reference {
    function: FunctionId,
    block: BlockId,
    index: usize,
    literal: usize,
    /// Offset of the referenced byte from the literal start.
    delta: u64,
}

/// Encrypts string literals; see the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringEncryption;

/// `plain[i] ^ (key + i * step)`; the same call decrypts.
pub fn rolling_xor(data: &[u8], key: u8, step: u8) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, byte)| byte ^ key.wrapping_add((i as u8).wrapping_mul(step)))
        .collect()
}

fn literals(module: &Module) -> Vec<Literal> {
    let mut out = Vec::new();
    for (index, section) in module.sections.iter().enumerate() {
        if section.role != SectionRole::Strings {
            continue;
        }
        let mut start = 0u64;
        for (offset, byte) in section.data.iter().enumerate() {
            if *byte == 0 {
                let end = offset as u64 + 1;
                out.push(Literal {
                    section: SectionId(index),
                    start,
                    len: end - start,
                });
                start = end;
            }
        }
    }
    out
}

struct LiteralIndex {
    by_start: BTreeMap<(SectionId, u64), usize>,
    literals: Vec<Literal>,
}

impl LiteralIndex {
    fn find(&self, section: SectionId, offset: u64) -> Option<usize> {
        let (_, index) = self
            .by_start
            .range(..=(section, offset))
            .next_back()?;
        let literal = self.literals[*index];
        (literal.section == section && offset < literal.start + literal.len).then_some(*index)
    }

    /// Whether `symbol` is a compiler label (`.LC0`) naming the start of a
    /// literal. References through it are as plain as section-relative ones;
    /// the label itself stays behind on the zeroed bytes.
    fn is_label(&self, symbol: &Symbol) -> bool {
        symbol.is_local()
            && matches!(symbol.kind, SymbolType::NoType | SymbolType::Object)
            && symbol
                .section()
                .and_then(|section| self.find(section, symbol.value))
                .is_some_and(|literal| self.literals[literal].start == symbol.value)
    }

    /// Literal referenced by `symbol + addend`.
    fn resolve(&self, module: &Module, symbol: SymbolId, addend: i64) -> Option<(usize, u64)> {
        let sym = module.symbol(symbol);
        let section = sym.section()?;
        let offset = sym.value.checked_add_signed(addend)?;
        let literal = self.find(section, offset)?;
        Some((literal, offset - self.literals[literal].start))
    }
}

/// References into literals, with the literals that must stay where they are.
fn scan(module: &Module, index: &LiteralIndex) -> (Vec<Reference>, BTreeSet<usize>) {
    let mut pinned = BTreeSet::new();
    for section in &module.sections {
        for rel in &section.relocations {
            if let Some((literal, _)) = index.resolve(module, rel.symbol, rel.addend) {
                pinned.insert(literal);
            }
        }
    }
    for symbol in module.symbols.iter().filter(|s| !s.is_section() && !index.is_label(s)) {
        if let Some(literal) = symbol.section().and_then(|s| index.find(s, symbol.value)) {
            pinned.insert(literal);
        }
    }

    let mut refs = Vec::new();
    for (fid, function) in module.functions.iter().enumerate() {
        for block in &function.blocks {
            if let Some(reloc) = block.terminator.instruction().and_then(|i| i.reloc.as_ref()) {
                if let Some((literal, _)) = index.resolve(module, reloc.symbol, reloc.addend) {
                    pinned.insert(literal);
                }
            }
            for (position, instr) in block.instructions.iter().enumerate() {
                let Some(reloc) = &instr.reloc else {
                    continue;
                };
                let Some((literal, delta)) = index.resolve(module, reloc.symbol, reloc.addend) else {
                    continue;
                };
                let target = module.symbol(reloc.symbol);
                let plain = (target.is_section() || index.is_label(target))
                    && ADDRESS_RELOCS.contains(&reloc.r_type);
                if function.synthesized || !plain {
                    pinned.insert(literal);
                    continue;
                }
                refs.push(Reference {
                    function: FunctionId(fid),
                    block: block.id,
                    index: position,
                    literal,
                    delta,
                });
            }
        }
    }
    (refs, pinned)
}

fn rip_relative(code: Code, symbol: SymbolId, addend: u64, other: Option<Register>) -> Result<Instruction, IcedError> {
    let mem = MemoryOperand::with_base_displ(Register::RIP, 0);
    let insn = match (code, other) {
        (Code::Lea_r64_m, Some(reg)) => iced_x86::Instruction::with2(code, reg, mem)?,
        (Code::Mov_rm8_imm8, _) => iced_x86::Instruction::with2(code, mem, 2u32)?,
        (_, Some(reg)) => iced_x86::Instruction::with2(code, mem, reg)?,
        (_, None) => iced_x86::Instruction::with1(code, mem)?,
    };
    Ok(Instruction::new(insn).with_reloc(InstrReloc {
        symbol,
        r_type: elf::R_X86_64_PC32,
        addend: addend as i64,
        field: RelocField::Displacement,
        pc_relative: true,
    }))
}

/// Where one encrypted literal lives and how it was encrypted.
#[derive(Debug, Clone, Copy)]
struct Sealed {
    /// Section symbol of the data section.
    data: SymbolId,
    blob: u64,
    state: u64,
    len: u64,
    key: u8,
    step: u8,
}

/// The decrypt stub of one literal.
fn stub(name: String, symbol: SymbolId, section: SectionId, sealed: Sealed) -> Result<Function, TransformError> {
    let Sealed {
        data,
        blob,
        state,
        len,
        key,
        step,
    } = sealed;
    let mut f = Function::synthesized(name, symbol, section, 16);
    let (acquire, check, spin, decrypt, body, publish, done) = (
        BlockId(1),
        BlockId(2),
        BlockId(3),
        BlockId(4),
        BlockId(5),
        BlockId(6),
        BlockId(7),
    );
    let save = wrap([
        Ok(insn::pushfq()),
        insn::push(Register::RAX),
        insn::push(Register::RCX),
        insn::push(Register::RDX),
        insn::push(Register::RSI),
    ])?;
    f.add_block(save, Terminator::Jump(acquire), BlockKind::Stub);

    let mut take = wrap([
        iced_x86::Instruction::with2(Code::Xor_r32_rm32, Register::EAX, Register::EAX),
        insn::mov_imm32(Register::RCX, 1),
    ])?;
    let mut cmpxchg = rip_relative(Code::Cmpxchg_rm8_r8, data, state, Some(Register::CL))?;
    let mut locked = *cmpxchg.insn();
    locked.set_has_lock_prefix(true);
    cmpxchg.set_insn(locked);
    take.push(cmpxchg);
    f.add_block(
        take,
        Terminator::Branch {
            condition: insn::jcc(ConditionCode::e),
            taken: decrypt,
            fallthrough: check,
        },
        BlockKind::Stub,
    );
    f.add_block(
        wrap([iced_x86::Instruction::with2(Code::Cmp_rm8_imm8, Register::AL, 2u32)])?,
        Terminator::Branch {
            condition: insn::jcc(ConditionCode::e),
            taken: done,
            fallthrough: spin,
        },
        BlockKind::Stub,
    );
    f.add_block(
        wrap([Ok(iced_x86::Instruction::with(Code::Pause))])?,
        Terminator::Jump(acquire),
        BlockKind::Stub,
    );

    let mut setup = vec![rip_relative(Code::Lea_r64_m, data, blob, Some(Register::RSI))?];
    setup.extend(wrap([
        iced_x86::Instruction::with2(Code::Xor_r32_rm32, Register::ECX, Register::ECX),
        insn::mov_imm32(Register::RDX, u32::from(key)),
    ])?);
    f.add_block(setup, Terminator::Jump(body), BlockKind::Stub);
    f.add_block(
        wrap([
            iced_x86::Instruction::with2(
                Code::Xor_rm8_r8,
                MemoryOperand::with_base_index(Register::RSI, Register::RCX),
                Register::DL,
            ),
            iced_x86::Instruction::with2(Code::Add_rm8_imm8, Register::DL, u32::from(step)),
            iced_x86::Instruction::with1(Code::Inc_rm64, Register::RCX),
            iced_x86::Instruction::with2(Code::Cmp_rm64_imm32, Register::RCX, len as i32),
        ])?,
        Terminator::Branch {
            condition: insn::jcc(ConditionCode::b),
            taken: body,
            fallthrough: publish,
        },
        BlockKind::Stub,
    );
    f.add_block(
        vec![rip_relative(Code::Mov_rm8_imm8, data, state, None)?],
        Terminator::Jump(done),
        BlockKind::Stub,
    );
    let restore = wrap([
        insn::pop(Register::RSI),
        insn::pop(Register::RDX),
        insn::pop(Register::RCX),
        insn::pop(Register::RAX),
        Ok(insn::popfq()),
    ])?;
    f.add_block(restore, Terminator::Return(Instruction::new(insn::ret())), BlockKind::Stub);

    f.entry = BlockId(0);
    f.layout = (0..f.blocks.len()).map(BlockId).collect();
    Ok(f)
}

fn call_sequence(stub: SymbolId) -> Result<Vec<Instruction>, TransformError> {
    let call = Instruction::new(insn::call_near()?).with_reloc(InstrReloc {
        symbol: stub,
        r_type: elf::R_X86_64_PLT32,
        addend: 0,
        field: RelocField::Branch,
        pc_relative: true,
    });
    Ok(vec![
        Instruction::new(insn::red_zone_enter()?),
        call,
        Instruction::new(insn::red_zone_leave()?),
    ])
}

impl Transform for StringEncryption {
    fn name(&self) -> &'static str {
        "strenc"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        let mut stats = PassStats::default();
        let found = literals(module);
        let index = LiteralIndex {
            by_start: found
                .iter()
                .enumerate()
                .map(|(i, l)| ((l.section, l.start), i))
                .collect(),
            literals: found,
        };
        let (refs, pinned) = scan(module, &index);
        let chosen: Vec<usize> = refs
            .iter()
            .map(|r| r.literal)
            .filter(|l| !pinned.contains(l))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        stats.note("pinned_strings", pinned.len() as u64);
        if chosen.is_empty() {
            return Ok(stats);
        }

        let mut data = Section::synthesized(
            DATA_SECTION,
            SectionKind::Data,
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
            8,
            SectionRole::Data,
        );
        let mut keys = Vec::with_capacity(chosen.len());
        let mut blobs = BTreeMap::new();
        for literal_index in &chosen {
            let literal = index.literals[*literal_index];
            let source = module.section_mut(literal.section);
            let range = literal.start as usize..(literal.start + literal.len) as usize;
            let key: u8 = rng.random();
            let step: u8 = rng.random::<u8>() | 1;
            let offset = data.data.len() as u64;
            data.data.extend(rolling_xor(&source.data[range.clone()], key, step));
            source.data[range].fill(0);
            keys.push((key, step));
            blobs.insert(*literal_index, offset);
        }
        let states = data.data.len() as u64;
        data.data.resize(data.data.len() + chosen.len(), 0);
        data.size = data.data.len() as u64;
        let data_id = module.add_section(data);
        let data_sym = module.add_symbol(Symbol::local(DATA_SECTION, SymbolType::Section, data_id, 0, 0));
        let text_id = module.add_section(Section::synthesized(
            TEXT_SECTION,
            SectionKind::Text,
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            16,
            SectionRole::Code,
        ));

        let mut stubs = BTreeMap::new();
        for (slot, (literal_index, (key, step))) in chosen.iter().zip(keys).enumerate() {
            let literal = index.literals[*literal_index];
            let name = module.unique_symbol_name("shroud_decrypt");
            let symbol = module.add_symbol(Symbol::local(name.clone(), SymbolType::Func, text_id, 0, 0));
            let blob = blobs.get(literal_index).copied().unwrap_or_default();
            let sealed = Sealed {
                data: data_sym,
                blob,
                state: states + slot as u64,
                len: literal.len,
                key,
                step,
            };
            let function = stub(name, symbol, text_id, sealed)?;
            module.add_function(function);
            stubs.insert(*literal_index, symbol);
        }

        // Insert back to front so earlier positions stay valid.
        let mut sites: Vec<&Reference> = refs.iter().filter(|r| stubs.contains_key(&r.literal)).collect();
        sites.sort_by_key(|r| std::cmp::Reverse((r.function, r.block, r.index)));
        for site in sites {
            let (Some(stub), Some(blob)) = (stubs.get(&site.literal), blobs.get(&site.literal)) else {
                continue;
            };
            let block = module.function_mut(site.function).block_mut(site.block);
            if let Some(reloc) = block.instructions[site.index].reloc.as_mut() {
                reloc.symbol = data_sym;
                reloc.addend = (blob + site.delta) as i64;
            }
            let call = call_sequence(*stub)?;
            block.instructions.splice(site.index..site.index, call);
            stats.bump("call_sites", 1);
        }
        stats.bump("string_encryptions", chosen.len() as u64);
        debug!(
            strings = chosen.len(),
            sites = stats.get("call_sites"),
            "encrypted string literals"
        );
        Ok(stats)
    }
}
