//! shroud's single entry-point for turning an ELF relocatable object into a [`Module`].
//!
//! Executable sections are split into functions along their `STT_FUNC`
//! symbols and every function is lifted into blocks. Relocations that patch
//! instructions are attached to the instruction they patch; relocations of
//! any other section stay on that section.

use crate::cfg_ir::{
    Block, BlockId, BlockKind, Function, InstrReloc, Instruction, RelocField, Target, Terminator,
};
use crate::module::{
    Comdat, Module, Relocation, Section, SectionId, SectionRole, Symbol, SymbolBinding, SymbolId,
    SymbolPlacement, SymbolType,
};
use crate::reloc;
use iced_x86::{Code, ConstantOffsets, Decoder, DecoderOptions, FlowControl, Mnemonic, OpKind};
use object::elf;
use object::read::elf::{ElfFile64, SectionHeader as _};
use object::{
    Architecture, Endianness, FileFlags, FileKind, Object, ObjectComdat, ObjectKind, ObjectSection,
    ObjectSymbol, RelocationFlags, RelocationTarget, SectionKind, SymbolFlags, SymbolSection,
};
use sha3::{Digest, Keccak256};
use shroud_utils::errors::ParseError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

/// `SHT_LLVM_ADDRSIG`: address-significance table, rebuilt by nothing and safe to drop.
const SHT_LLVM_ADDRSIG: u32 = 0x6fff_4c03;

/// Metadata about the decoded object file.
#[derive(Debug)]
pub struct DecodeInfo {
    /// number of bytes
    pub byte_length: usize,
    /// a 32-byte Keccak-256 hash of the raw bytes
    pub keccak_hash: [u8; 32],
    /// where the bytes came from
    pub source: SourceType,
}

/// Source of the object bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum SourceType {
    File,
    Memory,
}

impl DecodeInfo {
    /// Hashes `bytes` and records where they came from.
    pub fn of(bytes: &[u8], source: SourceType) -> Self {
        Self {
            byte_length: bytes.len(),
            keccak_hash: Keccak256::digest(bytes).into(),
            source,
        }
    }
}

/// Reads and lifts the object at `path`.
pub fn read_object(path: impl AsRef<Path>) -> Result<(Module, DecodeInfo), ParseError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| ParseError::FileRead {
        path: path.display().to_string(),
        source,
    })?;
    let module = decode_object(&bytes)?;
    Ok((module, DecodeInfo::of(&bytes, SourceType::File)))
}

/// Lifts an in-memory ELF64 x86-64 relocatable object.
pub fn decode_object(bytes: &[u8]) -> Result<Module, ParseError> {
    match FileKind::parse(bytes) {
        Ok(FileKind::Elf64) => {}
        Ok(FileKind::Elf32) => {
            return Err(ParseError::UnsupportedArchitecture(
                "32-bit ELF objects are not supported".into(),
            ));
        }
        Ok(other) => return Err(ParseError::UnsupportedFormat(format!("{other:?}"))),
        Err(e) => return Err(ParseError::UnsupportedFormat(e.to_string())),
    }
    let file = ElfFile64::<Endianness>::parse(bytes).map_err(|e| ParseError::Header(e.to_string()))?;
    if file.architecture() != Architecture::X86_64 {
        return Err(ParseError::UnsupportedArchitecture(format!(
            "{:?}",
            file.architecture()
        )));
    }
    if file.kind() != ObjectKind::Relocatable {
        return Err(ParseError::UnsupportedFormat(format!(
            "expected a relocatable object, found {:?}",
            file.kind()
        )));
    }

    let mut module = Module {
        source_size: bytes.len() as u64,
        ..Module::default()
    };
    if let FileFlags::Elf {
        os_abi,
        abi_version,
        e_flags,
    } = file.flags()
    {
        module.os_abi = os_abi;
        module.abi_version = abi_version;
        module.e_flags = e_flags;
    }

    let sections = load_sections(&file, &mut module)?;
    let symbols = load_symbols(&file, &sections, &mut module)?;
    let code_relocs = load_relocations(&file, &sections, &symbols, &mut module)?;
    load_comdats(&file, &sections, &symbols, &mut module)?;

    let referenced = code_references(&module)?;
    let empty_relocs = BTreeMap::new();
    let empty_refs = BTreeSet::new();
    for section in module.code_sections() {
        lift_section(
            &mut module,
            section,
            code_relocs.get(&section).unwrap_or(&empty_relocs),
            referenced.get(&section).unwrap_or(&empty_refs),
        )?;
    }

    debug!(
        sections = module.sections.len(),
        symbols = module.symbols.len(),
        functions = module.functions.len(),
        instructions = module.instruction_count(),
        "lifted object"
    );
    Ok(module)
}

fn load_sections(
    file: &ElfFile64<'_, Endianness>,
    module: &mut Module,
) -> Result<BTreeMap<usize, SectionId>, ParseError> {
    let endian = file.endian();
    let mut map = BTreeMap::new();
    for section in file.sections() {
        let header = section.elf_section_header();
        let sh_type = header.sh_type(endian);
        let sh_flags: u64 = header.sh_flags(endian);
        let entsize: u64 = header.sh_entsize(endian);
        if matches!(
            sh_type,
            elf::SHT_NULL
                | elf::SHT_SYMTAB
                | elf::SHT_STRTAB
                | elf::SHT_RELA
                | elf::SHT_REL
                | elf::SHT_GROUP
                | elf::SHT_SYMTAB_SHNDX
        ) {
            continue;
        }
        let name = section.name()?.to_string();
        if sh_type == SHT_LLVM_ADDRSIG || sh_type == elf::SHT_X86_64_UNWIND || name == ".eh_frame"
        {
            warn!(section = %name, "dropping section that cannot survive re-layout");
            module.dropped_sections.push(name);
            continue;
        }
        if name.starts_with(".gcc_except_table") {
            return Err(ParseError::Unsupported {
                context: name,
                reason: "exception tables are not supported".into(),
            });
        }

        let role = classify(&name, section.kind(), sh_type, sh_flags, entsize);
        let data = if sh_type == elf::SHT_NOBITS {
            Vec::new()
        } else {
            section.data()?.to_vec()
        };
        let id = module.add_section(Section {
            name,
            kind: section.kind(),
            sh_type,
            sh_flags,
            entsize,
            align: section.align().max(1),
            role,
            data,
            size: section.size(),
            relocations: Vec::new(),
            synthesized: false,
        });
        map.insert(section.index().0, id);
    }
    Ok(map)
}

fn classify(name: &str, kind: SectionKind, sh_type: u32, sh_flags: u64, entsize: u64) -> SectionRole {
    let has = |flag: u32| sh_flags & u64::from(flag) != 0;
    if sh_type == elf::SHT_PROGBITS && has(elf::SHF_EXECINSTR) {
        SectionRole::Code
    } else if sh_type == elf::SHT_NOBITS {
        SectionRole::Bss
    } else if name.starts_with(".debug") || name.starts_with(".zdebug") || kind == SectionKind::Debug {
        SectionRole::Debug
    } else if has(elf::SHF_ALLOC)
        && has(elf::SHF_MERGE)
        && has(elf::SHF_STRINGS)
        && entsize == 1
        && !has(elf::SHF_WRITE)
    {
        SectionRole::Strings
    } else if has(elf::SHF_ALLOC) {
        SectionRole::Data
    } else {
        SectionRole::Other
    }
}

fn load_symbols(
    file: &ElfFile64<'_, Endianness>,
    sections: &BTreeMap<usize, SectionId>,
    module: &mut Module,
) -> Result<BTreeMap<usize, SymbolId>, ParseError> {
    let mut map = BTreeMap::new();
    for symbol in file.symbols() {
        let (st_info, st_other) = match symbol.flags() {
            SymbolFlags::Elf { st_info, st_other } => (st_info, st_other),
            _ => (0, 0),
        };
        let name = String::from_utf8_lossy(symbol.name_bytes()?).into_owned();
        let placement = match symbol.section() {
            SymbolSection::Undefined => SymbolPlacement::Undefined,
            SymbolSection::Absolute => SymbolPlacement::Absolute,
            SymbolSection::Common => SymbolPlacement::Common,
            SymbolSection::None => SymbolPlacement::None,
            SymbolSection::Section(index) => match sections.get(&index.0) {
                Some(id) => SymbolPlacement::Section(*id),
                None if st_info & 0xf == elf::STT_SECTION => continue,
                None => {
                    return Err(ParseError::Unsupported {
                        context: format!("symbol `{name}`"),
                        reason: "defined in a section that is not preserved".into(),
                    });
                }
            },
            _ => {
                return Err(ParseError::Malformed(format!(
                    "symbol #{} has an unknown section index",
                    symbol.index().0
                )));
            }
        };
        let id = module.add_symbol(Symbol::from_elf(
            name,
            st_info,
            st_other,
            placement,
            symbol.address(),
            symbol.size(),
        ));
        map.insert(symbol.index().0, id);
    }
    Ok(map)
}

type CodeRelocations = BTreeMap<SectionId, BTreeMap<u64, Relocation>>;

fn load_relocations(
    file: &ElfFile64<'_, Endianness>,
    sections: &BTreeMap<usize, SectionId>,
    symbols: &BTreeMap<usize, SymbolId>,
    module: &mut Module,
) -> Result<CodeRelocations, ParseError> {
    let mut code = CodeRelocations::new();
    for section in file.sections() {
        let Some(&id) = sections.get(&section.index().0) else {
            continue;
        };
        let name = module.section(id).name.clone();
        let is_code = module.section(id).is_code();
        for (offset, relocation) in section.relocations() {
            let unsupported = |r_type: u32, reason: &str| ParseError::UnsupportedRelocation {
                section: name.clone(),
                offset,
                r_type,
                reason: reason.to_string(),
            };
            let RelocationFlags::Elf { r_type } = relocation.flags() else {
                return Err(ParseError::Malformed(format!(
                    "non-ELF relocation in `{name}` at {offset:#x}"
                )));
            };
            if r_type == elf::R_X86_64_NONE {
                continue;
            }
            if reloc::field_size(r_type).is_none() {
                return Err(unsupported(r_type, "relocation type cannot be preserved"));
            }
            let symbol = match relocation.target() {
                RelocationTarget::Symbol(index) => symbols
                    .get(&index.0)
                    .copied()
                    .ok_or_else(|| unsupported(r_type, "target symbol was dropped"))?,
                _ => return Err(unsupported(r_type, "relocation has no target symbol")),
            };
            let entry = Relocation {
                offset,
                symbol,
                r_type,
                addend: relocation.addend(),
            };
            if is_code {
                code.entry(id).or_default().insert(offset, entry);
            } else {
                module.section_mut(id).relocations.push(entry);
            }
        }
    }
    Ok(code)
}

fn load_comdats(
    file: &ElfFile64<'_, Endianness>,
    sections: &BTreeMap<usize, SectionId>,
    symbols: &BTreeMap<usize, SymbolId>,
    module: &mut Module,
) -> Result<(), ParseError> {
    for comdat in file.comdats() {
        let Some(&symbol) = symbols.get(&comdat.symbol().0) else {
            return Err(ParseError::Malformed(format!(
                "COMDAT group `{}` has no signature symbol",
                comdat.name()?
            )));
        };
        let members = comdat
            .sections()
            .filter_map(|index| sections.get(&index.0).copied())
            .collect();
        module.comdats.push(Comdat {
            kind: comdat.kind(),
            symbol,
            sections: members,
        });
    }
    Ok(())
}

/// Offsets in code sections that are referenced by address from data or by
/// local labels. They start blocks and are kept reachable.
fn code_references(module: &Module) -> Result<BTreeMap<SectionId, BTreeSet<u64>>, ParseError> {
    let mut refs: BTreeMap<SectionId, BTreeSet<u64>> = BTreeMap::new();
    for section in &module.sections {
        if matches!(section.role, SectionRole::Code | SectionRole::Debug) {
            continue;
        }
        for rel in &section.relocations {
            let symbol = module.symbol(rel.symbol);
            let Some(target) = symbol.section() else {
                continue;
            };
            if !module.section(target).is_code() {
                continue;
            }
            if reloc::is_pc_relative(rel.r_type) || !reloc::addresses_symbol(rel.r_type) {
                return Err(ParseError::UnsupportedRelocation {
                    section: section.name.clone(),
                    offset: rel.offset,
                    r_type: rel.r_type,
                    reason: "data may only reference code by absolute address".into(),
                });
            }
            refs.entry(target)
                .or_default()
                .insert(symbol.value.wrapping_add_signed(rel.addend));
        }
    }
    for symbol in &module.symbols {
        if symbol.kind != SymbolType::NoType || symbol.name.is_empty() {
            continue;
        }
        if let Some(section) = symbol.section() {
            if module.section(section).is_code() {
                refs.entry(section).or_default().insert(symbol.value);
            }
        }
    }
    Ok(refs)
}

const fn binding_rank(binding: SymbolBinding) -> u8 {
    match binding {
        SymbolBinding::Global => 0,
        SymbolBinding::Weak => 1,
        SymbolBinding::Local => 2,
        SymbolBinding::Other(_) => 3,
    }
}

fn lift_section(
    module: &mut Module,
    section: SectionId,
    relocs: &BTreeMap<u64, Relocation>,
    referenced: &BTreeSet<u64>,
) -> Result<(), ParseError> {
    let data = module.section(section).data.clone();
    let section_name = module.section(section).name.clone();

    let mut ranges: BTreeMap<(u64, u64), Vec<SymbolId>> = BTreeMap::new();
    for (index, symbol) in module.symbols.iter().enumerate() {
        if symbol.kind == SymbolType::Func
            && symbol.placement == SymbolPlacement::Section(section)
            && symbol.size > 0
        {
            ranges
                .entry((symbol.value, symbol.size))
                .or_default()
                .push(SymbolId(index));
        }
    }

    let mut cursor = 0u64;
    let mut functions = Vec::new();
    for ((start, size), mut names) in ranges {
        if start < cursor {
            return Err(ParseError::Unsupported {
                context: section_name,
                reason: format!("overlapping functions at {start:#x}"),
            });
        }
        let end = start
            .checked_add(size)
            .filter(|end| *end <= data.len() as u64)
            .ok_or_else(|| {
                ParseError::Malformed(format!(
                    "function at {start:#x} in `{section_name}` extends past the section"
                ))
            })?;
        check_padding(&data[cursor as usize..start as usize], &section_name, cursor)?;
        if let Some((offset, _)) = relocs.range(cursor..start).next() {
            return Err(outside_function(&section_name, *offset, relocs));
        }

        names.sort_by_key(|id| binding_rank(module.symbol(*id).binding));
        let primary = names.remove(0);
        let lifter = Lifter {
            module,
            section,
            data: &data,
            start,
            end,
            relocs,
            referenced,
        };
        functions.push(lifter.lift(primary, names)?);
        cursor = end;
    }
    check_padding(&data[cursor as usize..], &section_name, cursor)?;
    if let Some((offset, _)) = relocs.range(cursor..).next() {
        return Err(outside_function(&section_name, *offset, relocs));
    }

    let starts: BTreeSet<u64> = functions
        .iter()
        .flat_map(|f: &Function| f.blocks.iter())
        .flat_map(|b| b.instructions.iter().chain(b.terminator.instruction()))
        .filter_map(|i| i.origin)
        .chain(functions.iter().flat_map(|f| f.blocks.iter().filter_map(|b| b.origin)))
        .collect();
    for function in &functions {
        for block in &function.blocks {
            for insn in block.instructions.iter().chain(block.terminator.instruction()) {
                if let Some(Target::Code(target)) = insn.target {
                    if !starts.contains(&target) {
                        return Err(ParseError::Unsupported {
                            context: function.name.clone(),
                            reason: format!(
                                "reference to {target:#x}, which is not an instruction of any function"
                            ),
                        });
                    }
                }
            }
        }
    }

    debug!(section = %section_name, functions = functions.len(), "lifted code section");
    for function in functions {
        module.add_function(function);
    }
    Ok(())
}

fn outside_function(section: &str, offset: u64, relocs: &BTreeMap<u64, Relocation>) -> ParseError {
    ParseError::UnsupportedRelocation {
        section: section.to_string(),
        offset,
        r_type: relocs.get(&offset).map_or(0, |r| r.r_type),
        reason: "relocation outside every function".into(),
    }
}

/// Bytes between functions must be alignment padding.
fn check_padding(bytes: &[u8], section: &str, base: u64) -> Result<(), ParseError> {
    if bytes.iter().all(|b| matches!(b, 0x00 | 0x90 | 0xcc)) {
        return Ok(());
    }
    let mut decoder = Decoder::with_ip(64, bytes, base, DecoderOptions::NONE);
    for insn in &mut decoder {
        if !matches!(insn.mnemonic(), Mnemonic::Nop | Mnemonic::Int3) {
            return Err(ParseError::Unsupported {
                context: section.to_string(),
                reason: format!("code at {:#x} is not covered by a function symbol", insn.ip()),
            });
        }
    }
    Ok(())
}

const fn is_trap(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Ud0 | Mnemonic::Ud1 | Mnemonic::Ud2 | Mnemonic::Hlt
    )
}

fn is_near_branch(insn: &iced_x86::Instruction) -> bool {
    insn.op0_kind() == OpKind::NearBranch64
}

/// Identifies the relocated field of `insn` at byte `field_offset`.
fn relocated_field(
    insn: &iced_x86::Instruction,
    offsets: &ConstantOffsets,
    field_offset: usize,
) -> Option<(RelocField, usize)> {
    if is_near_branch(insn) && field_offset + 4 == insn.len() {
        return Some((RelocField::Branch, 4));
    }
    if offsets.has_displacement() && offsets.displacement_offset() == field_offset {
        return Some((RelocField::Displacement, offsets.displacement_size()));
    }
    if offsets.has_immediate() && offsets.immediate_offset() == field_offset {
        return Some((RelocField::Immediate, offsets.immediate_size()));
    }
    None
}

/// Lifts one function range.
struct Lifter<'a> {
    module: &'a Module,
    section: SectionId,
    data: &'a [u8],
    start: u64,
    end: u64,
    relocs: &'a BTreeMap<u64, Relocation>,
    referenced: &'a BTreeSet<u64>,
}

impl Lifter<'_> {
    fn contains(&self, offset: u64) -> bool {
        (self.start..self.end).contains(&offset)
    }

    fn in_section(&self, offset: u64) -> bool {
        offset < self.data.len() as u64
    }

    fn unsupported(&self, name: &str, reason: String) -> ParseError {
        ParseError::Unsupported {
            context: name.to_string(),
            reason,
        }
    }

    fn decode(&self, name: &str) -> Result<Vec<Instruction>, ParseError> {
        let section_name = &self.module.section(self.section).name;
        let bytes = &self.data[self.start as usize..self.end as usize];
        let mut decoder = Decoder::with_ip(64, bytes, self.start, DecoderOptions::NONE);
        let mut out = Vec::new();
        while decoder.can_decode() {
            let insn = decoder.decode();
            let offsets = decoder.get_constant_offsets(&insn);
            let at = insn.ip();
            if insn.is_invalid() {
                return Err(ParseError::InvalidInstruction {
                    function: name.to_string(),
                    offset: at,
                });
            }
            if insn.flow_control() == FlowControl::XbeginXabortXend {
                return Err(self.unsupported(name, format!("transactional region at {at:#x}")));
            }
            let len = insn.len() as u64;
            let raw = &self.data[at as usize..(at + len) as usize];
            let mut lifted = Instruction::decoded(insn, raw, at);

            let mut inside = self.relocs.range(at..at + len);
            if let Some((_, rel)) = inside.next() {
                if inside.next().is_some() {
                    return Err(self.unsupported(
                        name,
                        format!("instruction at {at:#x} carries more than one relocation"),
                    ));
                }
                let field_offset = (rel.offset - at) as usize;
                let reject = |reason: &str| ParseError::UnsupportedRelocation {
                    section: section_name.clone(),
                    offset: rel.offset,
                    r_type: rel.r_type,
                    reason: reason.to_string(),
                };
                let (field, width) = relocated_field(&insn, &offsets, field_offset)
                    .ok_or_else(|| reject("relocation does not cover an operand field"))?;
                if reloc::field_size(rel.r_type) != Some(width as u8) {
                    return Err(reject("relocation width does not match the operand field"));
                }
                let pc_relative = reloc::is_pc_relative(rel.r_type);
                let trailing = (len as usize - field_offset) as i64;
                lifted = lifted
                    .with_reloc(InstrReloc {
                        symbol: rel.symbol,
                        r_type: rel.r_type,
                        addend: if pc_relative {
                            rel.addend + trailing
                        } else {
                            rel.addend
                        },
                        field,
                        pc_relative,
                    })
                    .with_raw_field(field_offset as u8);
            } else if is_near_branch(&insn) {
                let target = insn.near_branch_target();
                let flow = insn.flow_control();
                if flow == FlowControl::Call && self.contains(target) {
                    return Err(self.unsupported(
                        name,
                        format!("call at {at:#x} into its own function"),
                    ));
                }
                if !self.contains(target) {
                    if !self.in_section(target) {
                        return Err(ParseError::Malformed(format!(
                            "branch at {at:#x} in `{name}` leaves its section"
                        )));
                    }
                    lifted = lifted.with_target(Target::Code(target));
                }
            } else if insn.is_ip_rel_memory_operand() {
                let target = insn.ip_rel_memory_address();
                if !self.in_section(target) {
                    return Err(ParseError::Malformed(format!(
                        "unrelocated RIP-relative operand at {at:#x} in `{name}` leaves its section"
                    )));
                }
                lifted = lifted.with_target(Target::Code(target));
            }
            out.push(lifted);
        }
        Ok(out)
    }

    fn lift(self, primary: SymbolId, aliases: Vec<SymbolId>) -> Result<Function, ParseError> {
        let name = self.module.symbol(primary).name.clone();
        let decoded = self.decode(&name)?;

        let mut address_taken: BTreeSet<u64> =
            self.referenced.range(self.start..self.end).copied().collect();
        let mut leaders = BTreeSet::from([self.start]);
        for lifted in &decoded {
            let insn = lifted.insn();
            match insn.flow_control() {
                FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch => {
                    if lifted.reloc.is_none() && is_near_branch(insn) {
                        let target = insn.near_branch_target();
                        if self.contains(target) {
                            leaders.insert(target);
                        }
                    }
                    leaders.insert(insn.next_ip());
                }
                FlowControl::IndirectBranch | FlowControl::Return => {
                    leaders.insert(insn.next_ip());
                }
                _ if is_trap(insn.mnemonic()) => {
                    leaders.insert(insn.next_ip());
                }
                _ => {}
            }
            if let Some(Target::Code(target)) = lifted.target {
                if self.contains(target) && lifted.insn().is_ip_rel_memory_operand() {
                    address_taken.insert(target);
                }
            }
        }
        leaders.extend(address_taken.iter().copied());
        leaders.retain(|offset| *offset < self.end);

        let starts: BTreeSet<u64> = decoded.iter().map(|i| i.insn().ip()).collect();
        if let Some(bad) = leaders.iter().find(|l| !starts.contains(l)) {
            return Err(self.unsupported(
                &name,
                format!("control transfer into the middle of an instruction at {bad:#x}"),
            ));
        }

        let block_starts: Vec<u64> = leaders.into_iter().collect();
        let block_of = |offset: u64| block_starts.binary_search(&offset).ok().map(BlockId);
        let original_count = block_starts.len();

        let mut blocks: Vec<Block> = Vec::with_capacity(original_count);
        let mut tails: Vec<Block> = Vec::new();
        let mut has_indirect_branch = false;
        let mut current: Vec<Instruction> = Vec::new();

        for lifted in decoded {
            let insn = *lifted.insn();
            let next = insn.next_ip();
            let terminator = match insn.flow_control() {
                FlowControl::UnconditionalBranch => {
                    let local = lifted.reloc.is_none()
                        && is_near_branch(&insn)
                        && self.contains(insn.near_branch_target());
                    if local {
                        block_of(insn.near_branch_target()).map(Terminator::Jump)
                    } else {
                        Some(Terminator::TailJump(lifted))
                    }
                }
                FlowControl::ConditionalBranch => {
                    let fallthrough = block_of(next).ok_or_else(|| {
                        self.unsupported(
                            &name,
                            format!("conditional branch at {:#x} falls off the function", insn.ip()),
                        )
                    })?;
                    let local = lifted.reloc.is_none() && self.contains(insn.near_branch_target());
                    let taken = if local {
                        block_of(insn.near_branch_target()).ok_or_else(|| {
                            ParseError::Malformed(format!("branch target lost in `{name}`"))
                        })?
                    } else {
                        let tail = tail_jump(&lifted)?;
                        let id = BlockId(original_count + tails.len());
                        tails.push(Block {
                            id,
                            instructions: Vec::new(),
                            terminator: Terminator::TailJump(tail),
                            kind: BlockKind::Tail,
                            origin: None,
                            address_taken: false,
                        });
                        id
                    };
                    Some(Terminator::Branch {
                        condition: insn.code(),
                        taken,
                        fallthrough,
                    })
                }
                FlowControl::IndirectBranch => {
                    has_indirect_branch = true;
                    Some(Terminator::Indirect(lifted))
                }
                FlowControl::Return => Some(Terminator::Return(lifted)),
                _ if is_trap(insn.mnemonic()) => Some(Terminator::Trap(lifted)),
                _ => {
                    current.push(lifted);
                    None
                }
            };

            let closes = terminator.is_some() || next >= self.end || block_of(next).is_some();
            if !closes {
                continue;
            }
            let terminator = terminator.unwrap_or_else(|| match block_of(next) {
                Some(following) if next < self.end => Terminator::Jump(following),
                _ => Terminator::Unreachable,
            });
            let id = BlockId(blocks.len());
            let origin = block_starts[id.0];
            blocks.push(Block {
                id,
                instructions: std::mem::take(&mut current),
                terminator,
                kind: BlockKind::Original,
                origin: Some(origin),
                address_taken: address_taken.contains(&origin),
            });
        }

        if blocks.len() != original_count {
            return Err(ParseError::Malformed(format!(
                "`{name}`: found {} blocks for {original_count} leaders",
                blocks.len()
            )));
        }
        blocks.extend(tails);

        let section_align = self.module.section(self.section).align;
        let align = if self.start == 0 {
            section_align
        } else {
            section_align.min(1 << self.start.trailing_zeros())
        }
        .max(1);

        Ok(Function {
            name,
            symbol: primary,
            aliases,
            section: self.section,
            offset: self.start,
            size: self.end - self.start,
            align,
            layout: (0..blocks.len()).map(BlockId).collect(),
            blocks,
            entry: BlockId(0),
            guards: Vec::new(),
            has_indirect_branch,
            synthesized: false,
        })
    }
}

/// Near `jmp` carrying the exit of a conditional branch that leaves the function.
fn tail_jump(branch: &Instruction) -> Result<Instruction, ParseError> {
    let insn = branch.insn();
    if !is_near_branch(insn)
        || matches!(
            insn.mnemonic(),
            Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne | Mnemonic::Jrcxz | Mnemonic::Jecxz
        )
    {
        return Err(ParseError::Unsupported {
            context: format!("instruction at {:#x}", insn.ip()),
            reason: "counted loop leaves its function".into(),
        });
    }
    let jmp = iced_x86::Instruction::with_branch(Code::Jmp_rel32_64, insn.near_branch_target())
        .map_err(|e| ParseError::Malformed(e.to_string()))?;
    let mut out = Instruction::new(jmp);
    if let Some(reloc) = branch.reloc.clone() {
        out = out.with_reloc(reloc);
    } else {
        out = out.with_target(Target::Code(insn.near_branch_target()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::write::{Object as WriteObject, Relocation as WriteRelocation, StandardSection};
    use object::write::{Symbol as WriteSymbol, SymbolSection as WriteSymbolSection};
    use object::{BinaryFormat, SymbolFlags as Flags, SymbolKind, SymbolScope};

    fn object_with_text(code: &[u8], functions: &[(&str, u64, u64)]) -> WriteObject<'static> {
        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        obj.append_section_data(text, code, 16);
        for (name, value, size) in functions {
            obj.add_symbol(WriteSymbol {
                name: name.as_bytes().to_vec(),
                value: *value,
                size: *size,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: WriteSymbolSection::Section(text),
                flags: Flags::None,
            });
        }
        obj
    }

    #[test]
    fn lifts_straight_line_function() {
        // xor eax, eax; ret
        let obj = object_with_text(&[0x31, 0xc0, 0xc3], &[("main", 0, 3)]);
        let module = decode_object(&obj.write().unwrap()).unwrap();
        assert_eq!(module.functions.len(), 1);
        let function = &module.functions[0];
        assert_eq!(function.name, "main");
        assert_eq!(function.blocks.len(), 1);
        assert!(matches!(function.blocks[0].terminator, Terminator::Return(_)));
        assert_eq!(function.blocks[0].instructions.len(), 1);
    }

    #[test]
    fn splits_loop_into_blocks() {
        // mov eax, edi; dec eax; jnz -4 (to dec); ret
        let code = [0x89, 0xf8, 0xff, 0xc8, 0x75, 0xfc, 0xc3];
        let obj = object_with_text(&code, &[("count", 0, code.len() as u64)]);
        let module = decode_object(&obj.write().unwrap()).unwrap();
        let function = &module.functions[0];
        assert_eq!(function.blocks.len(), 3);
        assert!(matches!(function.blocks[0].terminator, Terminator::Jump(BlockId(1))));
        match function.blocks[1].terminator {
            Terminator::Branch {
                taken, fallthrough, ..
            } => {
                assert_eq!(taken, BlockId(1));
                assert_eq!(fallthrough, BlockId(2));
            }
            ref other => panic!("unexpected terminator {other:?}"),
        }
    }

    #[test]
    fn attaches_call_relocation() {
        // call puts; ret
        let mut obj = object_with_text(&[0xe8, 0, 0, 0, 0, 0xc3], &[("f", 0, 6)]);
        let puts = obj.add_symbol(WriteSymbol {
            name: b"puts".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: WriteSymbolSection::Undefined,
            flags: Flags::None,
        });
        let text = obj.section_id(StandardSection::Text);
        obj.add_relocation(
            text,
            WriteRelocation {
                offset: 1,
                symbol: puts,
                addend: -4,
                flags: RelocationFlags::Elf {
                    r_type: elf::R_X86_64_PLT32,
                },
            },
        )
        .unwrap();
        let module = decode_object(&obj.write().unwrap()).unwrap();
        let call = &module.functions[0].blocks[0].instructions[0];
        let reloc = call.reloc.as_ref().unwrap();
        assert_eq!(reloc.field, RelocField::Branch);
        assert_eq!(reloc.addend, 0);
        assert_eq!(module.symbol(reloc.symbol).name, "puts");
    }

    #[test]
    fn rejects_non_elf_input() {
        assert!(matches!(
            decode_object(b"not an object file"),
            Err(ParseError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn rejects_other_architectures() {
        let obj = WriteObject::new(BinaryFormat::Elf, Architecture::Aarch64, Endianness::Little);
        assert!(matches!(
            decode_object(&obj.write().unwrap()),
            Err(ParseError::UnsupportedArchitecture(_))
        ));
    }

    #[test]
    fn rejects_uncovered_code() {
        // `ret` outside any function symbol
        let obj = object_with_text(&[0xc3, 0x31, 0xc0, 0xc3], &[("f", 1, 3)]);
        assert!(matches!(
            decode_object(&obj.write().unwrap()),
            Err(ParseError::Unsupported { .. })
        ));
    }

    #[test]
    fn accepts_padding_between_functions() {
        let obj = object_with_text(&[0xc3, 0xcc, 0xcc, 0xcc, 0x31, 0xc0, 0xc3], &[("a", 0, 1), ("b", 4, 3)]);
        let module = decode_object(&obj.write().unwrap()).unwrap();
        assert_eq!(module.functions.len(), 2);
        assert_eq!(module.functions[1].align, 4);
    }

    #[test]
    fn decode_info_hashes_input() {
        let info = DecodeInfo::of(b"", SourceType::Memory);
        assert_eq!(info.byte_length, 0);
        assert_eq!(
            hex_prefix(&info.keccak_hash),
            "c5d2460186f7233c"
        );
    }

    fn hex_prefix(hash: &[u8; 32]) -> String {
        hash[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}
