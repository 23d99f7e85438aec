//! Emitter: lays out every code section, relaxes intra-function branches and
//! writes the module back out as an ELF64 relocatable object.
//!
//! Layout runs in two phases. The first assigns addresses, starting every
//! intra-function branch in its short form and growing the ones that cannot
//! reach until nothing changes. The second encodes each instruction at its
//! final address and checks that the length matches the plan.

use crate::cfg_ir::{BlockId, Function, InstrReloc, Instruction, RelocField, Target, Terminator};
use crate::insn;
use crate::module::{
    FunctionId, Module, SectionId, SectionRole, SymbolBinding, SymbolId, SymbolPlacement,
    SymbolType,
};
use iced_x86::{Code, ConditionCode, Encoder, OpKind};
use object::write::{self, Mangling};
use serde::{Deserialize, Serialize};
use object::{
    Architecture, BinaryFormat, Endianness, FileFlags, RelocationFlags, SectionFlags, SymbolFlags,
    SymbolKind, SymbolScope, elf,
};
use shroud_utils::errors::EmitError;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Filler between functions.
const PADDING: u8 = 0xcc;

/// Address used when sizing instructions whose target is not known yet.
const SIZING_IP: u64 = 0x1000_0000;

/// Knobs for [`emit`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitOptions {
    /// Keep DWARF sections, remapping their code references on a best-effort basis.
    pub keep_debug: bool,
}

/// Where a function ended up inside its section.
#[derive(Debug, Clone)]
pub struct FunctionPlacement {
    /// Function placed.
    pub function: FunctionId,
    /// Offset of the function start in the section.
    pub start: u64,
    /// Emitted size in bytes.
    pub size: u64,
    /// Address of each block, indexed by `BlockId.0`; `None` when not laid out.
    pub blocks: Vec<Option<u64>>,
}

/// A relocation against the rebuilt bytes of a code section.
#[derive(Debug, Clone)]
pub struct CodeRelocation {
    /// Offset of the patched field in the section.
    pub offset: u64,
    /// Symbol the relocation resolves against.
    pub symbol: SymbolId,
    /// ELF relocation type.
    pub r_type: u32,
    /// Symbol-relative offset of the referenced address, as on [`InstrReloc`].
    pub addend: i64,
    /// Bytes between the field and the end of its instruction for PC-relative
    /// types, zero otherwise.
    pub trailing: i64,
}

/// A rebuilt code section.
#[derive(Debug, Clone)]
pub struct SectionLayout {
    /// Code section the layout replaces.
    pub section: SectionId,
    /// Encoded bytes.
    pub bytes: Vec<u8>,
    /// Placement of every function, in emission order.
    pub functions: Vec<FunctionPlacement>,
    /// Relocations against `bytes`.
    pub relocations: Vec<CodeRelocation>,
    /// Input offset to output offset for every instruction, block and
    /// function boundary that survived.
    origins: BTreeMap<u64, u64>,
}

impl SectionLayout {
    /// New offset of the input offset `old`, when it still starts something.
    pub fn remap(&self, old: u64) -> Option<u64> {
        self.origins.get(&old).copied()
    }

    /// New offset of `old`, falling back to the nearest mapped offset below it.
    pub fn remap_nearest(&self, old: u64) -> u64 {
        match self.origins.range(..=old).next_back() {
            Some((from, to)) => to + (old - from),
            None => old,
        }
    }
}

/// Result of laying out every code section of a module.
#[derive(Debug, Clone, Default)]
pub struct ModuleLayout {
    /// One entry per code section.
    pub sections: Vec<SectionLayout>,
}

impl ModuleLayout {
    /// Layout of the code section `id`.
    pub fn section(&self, id: SectionId) -> Option<&SectionLayout> {
        self.sections.iter().find(|s| s.section == id)
    }

    /// Where `function` was placed.
    pub fn placement(&self, function: FunctionId) -> Option<&FunctionPlacement> {
        self.sections
            .iter()
            .flat_map(|s| s.functions.iter())
            .find(|p| p.function == function)
    }

    /// Total bytes of code across sections, padding included.
    pub fn code_size(&self) -> u64 {
        self.sections.iter().map(|s| s.bytes.len() as u64).sum()
    }
}

/// Lays out the module and writes it as an ELF relocatable object.
pub fn emit(module: &Module, options: &EmitOptions) -> Result<Vec<u8>, EmitError> {
    let layout = layout_module(module)?;
    let bytes = write_object(module, &layout, options)?;
    object::File::parse(bytes.as_slice()).map_err(|e| EmitError::SelfCheck(e.to_string()))?;
    debug!(
        bytes = bytes.len(),
        code = layout.code_size(),
        "emitted object"
    );
    Ok(bytes)
}

/// Bytes of code the module would emit.
pub fn measure(module: &Module) -> Result<u64, EmitError> {
    Ok(layout_module(module)?.code_size())
}

/// Lays out every code section.
pub fn layout_module(module: &Module) -> Result<ModuleLayout, EmitError> {
    let mut layout = ModuleLayout::default();
    for section in module.code_sections() {
        layout.sections.push(layout_section(module, section)?);
    }
    Ok(layout)
}

enum Item<'a> {
    Block(BlockId),
    Fixed {
        instr: &'a Instruction,
        len: usize,
    },
    Branch {
        short: Code,
        near: Code,
        short_len: usize,
        near_len: usize,
        target: BlockId,
        is_near: bool,
        from: BlockId,
    },
}

impl Item<'_> {
    const fn len(&self) -> usize {
        match self {
            Self::Block(_) => 0,
            Self::Fixed { len, .. } => *len,
            Self::Branch {
                short_len,
                near_len,
                is_near,
                ..
            } => {
                if *is_near {
                    *near_len
                } else {
                    *short_len
                }
            }
        }
    }
}

struct Draft<'a> {
    id: FunctionId,
    function: &'a Function,
    items: Vec<Item<'a>>,
    addrs: Vec<u64>,
    start: u64,
    end: u64,
    blocks: Vec<Option<u64>>,
}

fn relative_branch(
    condition: Code,
    target: BlockId,
    from: BlockId,
) -> Result<Item<'static>, EmitError> {
    let short = condition.as_short_branch();
    let near = condition.as_near_branch();
    Ok(Item::Branch {
        short,
        near,
        short_len: insn::branch_len(short)?,
        near_len: insn::branch_len(near)?,
        target,
        is_near: false,
        from,
    })
}

fn plan_function(function: &Function) -> Result<Vec<Item<'_>>, EmitError> {
    function
        .validate()
        .map_err(EmitError::SelfCheck)?;
    let mut items = Vec::new();
    for (position, id) in function.layout.iter().enumerate() {
        let block = function.block(*id);
        let next = function.layout.get(position + 1).copied();
        items.push(Item::Block(*id));
        for instr in &block.instructions {
            items.push(Item::Fixed {
                instr,
                len: fixed_len(instr)?,
            });
        }
        match &block.terminator {
            Terminator::Jump(target) => {
                if next != Some(*target) {
                    items.push(relative_branch(Code::Jmp_rel32_64, *target, *id)?);
                }
            }
            Terminator::Branch {
                condition,
                taken,
                fallthrough,
            } => {
                let invertible = condition.condition_code() != ConditionCode::None;
                if next == Some(*taken) && next != Some(*fallthrough) && invertible {
                    items.push(relative_branch(
                        condition.negate_condition_code(),
                        *fallthrough,
                        *id,
                    )?);
                } else {
                    items.push(relative_branch(*condition, *taken, *id)?);
                    if next != Some(*fallthrough) {
                        items.push(relative_branch(Code::Jmp_rel32_64, *fallthrough, *id)?);
                    }
                }
            }
            Terminator::Unreachable => {}
            Terminator::Return(instr)
            | Terminator::TailJump(instr)
            | Terminator::Indirect(instr)
            | Terminator::Trap(instr) => items.push(Item::Fixed {
                instr,
                len: fixed_len(instr)?,
            }),
        }
    }
    Ok(items)
}

const fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

/// Assigns addresses to every item in the section. Returns the section size.
fn assign(drafts: &mut [Draft<'_>]) -> u64 {
    let mut cursor = 0u64;
    for draft in drafts.iter_mut() {
        cursor = align_up(cursor, draft.function.align);
        draft.start = cursor;
        draft.addrs.clear();
        draft.blocks = vec![None; draft.function.blocks.len()];
        for item in &draft.items {
            draft.addrs.push(cursor);
            if let Item::Block(id) = item {
                draft.blocks[id.0] = Some(cursor);
            }
            cursor += item.len() as u64;
        }
        draft.end = cursor;
    }
    cursor
}

/// Grows short branches that cannot reach. Returns whether anything grew.
fn relax(drafts: &mut [Draft<'_>]) -> Result<bool, EmitError> {
    let mut grew = false;
    for draft in drafts.iter_mut() {
        for (index, item) in draft.items.iter_mut().enumerate() {
            let Item::Branch {
                short,
                near,
                short_len,
                target,
                is_near,
                from,
                ..
            } = item
            else {
                continue;
            };
            if *is_near {
                continue;
            }
            let to = draft.blocks[target.0].ok_or_else(|| EmitError::UnresolvedBlock {
                function: draft.function.name.clone(),
                block: target.0,
            })?;
            let disp = to as i64 - (draft.addrs[index] + *short_len as u64) as i64;
            if i8::try_from(disp).is_ok() {
                continue;
            }
            if short == near {
                return Err(EmitError::BranchOutOfRange {
                    function: draft.function.name.clone(),
                    block: from.0,
                });
            }
            *is_near = true;
            grew = true;
        }
    }
    Ok(grew)
}

fn layout_section(module: &Module, section: SectionId) -> Result<SectionLayout, EmitError> {
    let mut drafts = Vec::new();
    for id in module.functions_in(section) {
        let function = module.function(id);
        drafts.push(Draft {
            id,
            function,
            items: plan_function(function)?,
            addrs: Vec::new(),
            start: 0,
            end: 0,
            blocks: Vec::new(),
        });
    }

    let mut size = assign(&mut drafts);
    let mut rounds = 0;
    while relax(&mut drafts)? {
        size = assign(&mut drafts);
        rounds += 1;
    }
    trace!(section = section.0, rounds, size, "relaxed branches");

    let origins = origin_map(&drafts);
    let starts: BTreeMap<FunctionId, u64> = drafts.iter().map(|d| (d.id, d.start)).collect();

    let mut bytes = vec![PADDING; size as usize];
    let mut relocations = Vec::new();
    let mut functions = Vec::with_capacity(drafts.len());
    for draft in &drafts {
        let name = &draft.function.name;
        for (item, addr) in draft.items.iter().zip(&draft.addrs) {
            let addr = *addr;
            let (encoded, field) = match item {
                Item::Block(_) => continue,
                Item::Branch {
                    short,
                    near,
                    target,
                    is_near,
                    ..
                } => {
                    let code = if *is_near { *near } else { *short };
                    let to = draft.blocks[target.0].ok_or_else(|| EmitError::UnresolvedBlock {
                        function: name.clone(),
                        block: target.0,
                    })?;
                    let branch = iced_x86::Instruction::with_branch(code, to)?;
                    (encode(&branch, addr)?.0, None)
                }
                Item::Fixed { instr, .. } => {
                    let target = match instr.target {
                        None => None,
                        Some(Target::Block(block)) => Some(draft.blocks.get(block.0).copied().flatten().ok_or_else(
                            || EmitError::UnresolvedBlock {
                                function: name.clone(),
                                block: block.0,
                            },
                        )?),
                        Some(Target::Code(offset)) => Some(origins.get(&offset).copied().ok_or_else(|| {
                            EmitError::UnresolvedTarget {
                                function: name.clone(),
                                offset,
                            }
                        })?),
                        Some(Target::Function(callee)) => Some(starts.get(&callee).copied().ok_or_else(|| {
                            EmitError::UnresolvedTarget {
                                function: name.clone(),
                                offset: callee.0 as u64,
                            }
                        })?),
                    };
                    encode_instruction(instr, addr, target)?
                }
            };
            if encoded.len() != item.len() {
                return Err(EmitError::LayoutMismatch {
                    function: name.clone(),
                    expected: item.len(),
                    actual: encoded.len(),
                });
            }
            if let Item::Fixed { instr, .. } = item {
                if let Some(reloc) = &instr.reloc {
                    let field = field.ok_or_else(|| EmitError::RelocationField {
                        function: name.clone(),
                        offset: addr,
                    })?;
                    relocations.push(CodeRelocation {
                        offset: addr + field as u64,
                        symbol: reloc.symbol,
                        r_type: reloc.r_type,
                        addend: reloc.addend,
                        trailing: if reloc.pc_relative {
                            (encoded.len() - field) as i64
                        } else {
                            0
                        },
                    });
                }
            }
            let at = addr as usize;
            bytes[at..at + encoded.len()].copy_from_slice(&encoded);
        }
        functions.push(FunctionPlacement {
            function: draft.id,
            start: draft.start,
            size: draft.end - draft.start,
            blocks: draft.blocks.clone(),
        });
    }

    Ok(SectionLayout {
        section,
        bytes,
        functions,
        relocations,
        origins,
    })
}

/// Input offsets to output offsets. Function starts win over block starts,
/// which win over instruction offsets.
fn origin_map(drafts: &[Draft<'_>]) -> BTreeMap<u64, u64> {
    let mut origins = BTreeMap::new();
    for draft in drafts.iter().filter(|d| !d.function.synthesized) {
        origins.insert(draft.function.offset + draft.function.size, draft.end);
    }
    for draft in drafts {
        for (item, addr) in draft.items.iter().zip(&draft.addrs) {
            if let Item::Fixed { instr, .. } = item {
                if let Some(origin) = instr.origin {
                    origins.insert(origin, *addr);
                }
            }
        }
    }
    for draft in drafts {
        for block in &draft.function.blocks {
            if let (Some(origin), Some(addr)) = (block.origin, draft.blocks[block.id.0]) {
                origins.insert(origin, addr);
            }
        }
    }
    for draft in drafts.iter().filter(|d| !d.function.synthesized) {
        origins.insert(draft.function.offset, draft.start);
    }
    origins
}

fn encode(insn: &iced_x86::Instruction, ip: u64) -> Result<(Vec<u8>, iced_x86::ConstantOffsets), EmitError> {
    let mut encoder = Encoder::new(64);
    encoder.encode(insn, ip)?;
    let offsets = encoder.get_constant_offsets();
    Ok((encoder.take_buffer(), offsets))
}

fn is_near_branch(insn: &iced_x86::Instruction) -> bool {
    insn.op0_kind() == OpKind::NearBranch64
}

fn point_at(insn: &mut iced_x86::Instruction, target: u64) {
    if is_near_branch(insn) {
        insn.set_near_branch64(target);
    } else if insn.is_ip_rel_memory_operand() {
        insn.set_memory_displacement64(target);
    }
}

/// Encodes `instr` at `ip`. Returns the bytes and, for relocated
/// instructions, the offset of the relocated field.
fn encode_instruction(
    instr: &Instruction,
    ip: u64,
    target: Option<u64>,
) -> Result<(Vec<u8>, Option<usize>), EmitError> {
    if let Some(bytes) = instr.reusable_bytes() {
        let field = instr.raw_field_offset().map(usize::from);
        return Ok((bytes.to_vec(), field));
    }
    let mut insn = *instr.insn();
    if is_near_branch(&insn) && (target.is_some() || instr.reloc.is_some()) {
        insn.set_code(insn.code().as_near_branch());
    }
    if let Some(target) = target {
        point_at(&mut insn, target);
    }
    if let Some(InstrReloc {
        pc_relative: true, ..
    }) = instr.reloc
    {
        // Aim the field at the end of the instruction so it encodes as zero.
        point_at(&mut insn, ip);
        let len = encode(&insn, ip)?.0.len();
        point_at(&mut insn, ip + len as u64);
    }
    let (bytes, offsets) = encode(&insn, ip)?;
    let field = instr.reloc.as_ref().and_then(|reloc| match reloc.field {
        RelocField::Branch => bytes.len().checked_sub(4),
        RelocField::Displacement => offsets
            .has_displacement()
            .then(|| offsets.displacement_offset()),
        RelocField::Immediate => offsets.has_immediate().then(|| offsets.immediate_offset()),
    });
    Ok((bytes, field))
}

fn fixed_len(instr: &Instruction) -> Result<usize, EmitError> {
    if let Some(bytes) = instr.reusable_bytes() {
        return Ok(bytes.len());
    }
    let target = instr.target.map(|_| SIZING_IP);
    Ok(encode_instruction(instr, SIZING_IP, target)?.0.len())
}

/// New `(value, size)` of every symbol defined in a code section.
fn code_symbol_values(
    module: &Module,
    layout: &ModuleLayout,
) -> Result<Vec<Option<(u64, u64)>>, EmitError> {
    let mut values = vec![None; module.symbols.len()];
    for section in &layout.sections {
        for placement in &section.functions {
            let function = module.function(placement.function);
            for symbol in std::iter::once(&function.symbol).chain(&function.aliases) {
                values[symbol.0] = Some((placement.start, placement.size));
            }
        }
    }
    for (index, symbol) in module.symbols.iter().enumerate() {
        if values[index].is_some() {
            continue;
        }
        let Some(section) = symbol.section() else {
            continue;
        };
        let Some(code) = layout.section(section) else {
            continue;
        };
        if symbol.is_section() {
            values[index] = Some((0, 0));
            continue;
        }
        let value = code
            .remap(symbol.value)
            .ok_or(EmitError::UnresolvedSymbol(index))?;
        values[index] = Some((value, symbol.size));
    }
    Ok(values)
}

/// Moves symbol-relative addends from input offsets to laid-out offsets.
pub(crate) struct Rebaser<'a> {
    module: &'a Module,
    layout: &'a ModuleLayout,
    values: Vec<Option<(u64, u64)>>,
}

impl<'a> Rebaser<'a> {
    pub(crate) fn new(module: &'a Module, layout: &'a ModuleLayout) -> Result<Self, EmitError> {
        Ok(Self {
            module,
            layout,
            values: code_symbol_values(module, layout)?,
        })
    }

    /// Laid-out `(value, size)` of a symbol defined in a code section.
    pub(crate) fn value(&self, symbol: SymbolId) -> Option<(u64, u64)> {
        self.values.get(symbol.0).copied().flatten()
    }

    /// Symbol-relative addend for a reference to `symbol + addend` after re-layout.
    pub(crate) fn rebase(&self, symbol: SymbolId, addend: i64, nearest: bool) -> Result<i64, EmitError> {
        let sym = self.module.symbol(symbol);
        let Some(code) = sym.section().and_then(|s| self.layout.section(s)) else {
            return Ok(addend);
        };
        if !sym.is_section() && addend == 0 {
            return Ok(0);
        }
        let old = sym.value.wrapping_add_signed(addend);
        let new = match code.remap(old) {
            Some(new) => new,
            None if nearest => code.remap_nearest(old),
            None => {
                return Err(EmitError::UnresolvedTarget {
                    function: sym.name.clone(),
                    offset: old,
                });
            }
        };
        let base = self
            .values
            .get(symbol.0)
            .copied()
            .flatten()
            .map_or(0, |(value, _)| value);
        Ok(new as i64 - base as i64)
    }
}

const fn symbol_kind(kind: SymbolType) -> SymbolKind {
    match kind {
        SymbolType::Func => SymbolKind::Text,
        SymbolType::Object | SymbolType::Common => SymbolKind::Data,
        SymbolType::Section => SymbolKind::Section,
        SymbolType::File => SymbolKind::File,
        SymbolType::Tls => SymbolKind::Tls,
        SymbolType::NoType | SymbolType::Other(_) => SymbolKind::Unknown,
    }
}

/// Section flags for the output. `SHF_MERGE` survives only where the writer
/// reproduces the entry size.
fn output_flags(section: &crate::module::Section) -> u64 {
    let merge = u64::from(elf::SHF_MERGE);
    let strings = u64::from(elf::SHF_STRINGS);
    if section.sh_flags & merge != 0 && !(section.sh_flags & strings != 0 && section.entsize == 1) {
        section.sh_flags & !merge
    } else {
        section.sh_flags
    }
}

fn write_object(
    module: &Module,
    layout: &ModuleLayout,
    options: &EmitOptions,
) -> Result<Vec<u8>, EmitError> {
    let mut obj = write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    obj.set_mangling(Mangling::None);
    obj.flags = FileFlags::Elf {
        os_abi: module.os_abi,
        abi_version: module.abi_version,
        e_flags: module.e_flags,
    };

    let mut sections: Vec<Option<write::SectionId>> = vec![None; module.sections.len()];
    for (index, section) in module.sections.iter().enumerate() {
        if section.role == SectionRole::Debug && !options.keep_debug {
            continue;
        }
        let id = obj.add_section(Vec::new(), section.name.as_bytes().to_vec(), section.kind);
        match section.role {
            SectionRole::Code => {
                let code = layout
                    .section(SectionId(index))
                    .map_or(&[][..], |s| s.bytes.as_slice());
                obj.set_section_data(id, code, section.align);
            }
            SectionRole::Bss => {
                obj.append_section_bss(id, section.size, section.align);
            }
            _ => obj.set_section_data(id, section.data.as_slice(), section.align),
        }
        obj.section_mut(id).flags = SectionFlags::Elf {
            sh_flags: output_flags(section),
        };
        sections[index] = Some(id);
    }

    let rebaser = Rebaser::new(module, layout)?;

    let mut symbols: Vec<Option<write::SymbolId>> = vec![None; module.symbols.len()];
    for (index, symbol) in module.symbols.iter().enumerate() {
        let section = match symbol.placement {
            SymbolPlacement::Section(id) => match sections[id.0] {
                Some(section) => write::SymbolSection::Section(section),
                None => continue,
            },
            SymbolPlacement::Undefined if symbol.name.is_empty() => continue,
            SymbolPlacement::Undefined => write::SymbolSection::Undefined,
            SymbolPlacement::Absolute => write::SymbolSection::Absolute,
            SymbolPlacement::Common => write::SymbolSection::Common,
            SymbolPlacement::None => write::SymbolSection::None,
        };
        if symbol.is_section() {
            if let write::SymbolSection::Section(section) = section {
                symbols[index] = Some(obj.section_symbol(section));
            }
            continue;
        }
        let (value, size) = rebaser
            .value(SymbolId(index))
            .unwrap_or((symbol.value, symbol.size));
        let id = obj.add_symbol(write::Symbol {
            name: symbol.name.as_bytes().to_vec(),
            value,
            size,
            kind: symbol_kind(symbol.kind),
            scope: if symbol.is_local() {
                SymbolScope::Compilation
            } else {
                SymbolScope::Linkage
            },
            weak: symbol.binding == SymbolBinding::Weak,
            section,
            flags: SymbolFlags::Elf {
                st_info: symbol.st_info(),
                st_other: symbol.st_other,
            },
        });
        symbols[index] = Some(id);
    }
    let resolve = |symbol: SymbolId| {
        symbols
            .get(symbol.0)
            .copied()
            .flatten()
            .ok_or(EmitError::UnresolvedSymbol(symbol.0))
    };

    for (index, section) in module.sections.iter().enumerate() {
        let Some(out) = sections[index] else {
            continue;
        };
        if let Some(code) = layout.section(SectionId(index)) {
            for rel in &code.relocations {
                let addend = rebaser.rebase(rel.symbol, rel.addend, false)? - rel.trailing;
                obj.add_relocation(
                    out,
                    write::Relocation {
                        offset: rel.offset,
                        symbol: resolve(rel.symbol)?,
                        addend,
                        flags: RelocationFlags::Elf { r_type: rel.r_type },
                    },
                )?;
            }
            continue;
        }
        let nearest = section.role == SectionRole::Debug;
        for rel in &section.relocations {
            obj.add_relocation(
                out,
                write::Relocation {
                    offset: rel.offset,
                    symbol: resolve(rel.symbol)?,
                    addend: rebaser.rebase(rel.symbol, rel.addend, nearest)?,
                    flags: RelocationFlags::Elf { r_type: rel.r_type },
                },
            )?;
        }
    }

    for comdat in &module.comdats {
        let members: Vec<write::SectionId> = comdat
            .sections
            .iter()
            .filter_map(|s| sections[s.0])
            .collect();
        if members.is_empty() {
            continue;
        }
        obj.add_comdat(write::Comdat {
            kind: comdat.kind,
            symbol: resolve(comdat.symbol)?,
            sections: members,
        });
    }

    Ok(obj.write()?)
}
