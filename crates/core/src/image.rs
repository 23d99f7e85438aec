//! In-memory static link of a module.
//!
//! Every allocated section gets its own page-aligned base at a fixed slot
//! derived from its index, so sections keep their addresses when other
//! sections grow or new ones are appended. Undefined symbols
//! resolve to stub slots in an external region, and all relocations are
//! applied. The result is what the emulator executes; it is never written out.

use crate::encoder::{self, Rebaser};
use crate::module::{FunctionId, Module, SectionId, SectionRole, SymbolId, SymbolPlacement};
use object::elf;
use shroud_utils::errors::EmitError;
use std::collections::BTreeMap;
use tracing::trace;

/// Address of the first segment.
pub const IMAGE_BASE: u64 = 0x40_0000;

/// Bytes reserved for each external symbol.
pub const EXTERN_SLOT: u64 = 16;

/// Distance between the preferred bases of consecutive sections.
pub const SECTION_STRIDE: u64 = 0x10_0000;

const PAGE: u64 = 0x1000;

/// A mapped range of the image.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Section the bytes come from; `None` for the common, GOT and external areas.
    pub section: Option<SectionId>,
    /// Section name, or a synthetic area name.
    pub name: String,
    /// Load address.
    pub base: u64,
    /// Mapped contents.
    pub bytes: Vec<u8>,
    /// Whether the bytes are executable.
    pub code: bool,
    /// Created by a transform rather than present in the input.
    pub synthesized: bool,
}

impl Segment {
    /// One past the last mapped address.
    pub const fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    /// Whether `addr` falls inside the segment.
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// A linked image of one module.
#[derive(Debug, Clone, Default)]
pub struct Image {
    /// Non-overlapping mapped ranges.
    pub segments: Vec<Segment>,
    /// Resolved address of every symbol, indexed by `SymbolId.0`.
    pub symbols: Vec<Option<u64>>,
    /// Stub address of every undefined symbol.
    pub externals: BTreeMap<u64, String>,
    /// `(entry, size)` of every function, indexed by `FunctionId.0`.
    pub functions: Vec<Option<(u64, u64)>>,
}

impl Image {
    /// The segment mapping `addr`.
    pub fn segment_at(&self, addr: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.contains(addr))
    }

    /// Name of the external symbol whose stub starts at `addr`.
    pub fn external_at(&self, addr: u64) -> Option<&str> {
        self.externals.get(&addr).map(String::as_str)
    }

    /// Entry address of `function`, if it was placed.
    pub fn entry(&self, function: FunctionId) -> Option<u64> {
        self.functions
            .get(function.0)
            .copied()
            .flatten()
            .map(|(entry, _)| entry)
    }

    /// Function whose entry is exactly `addr`.
    pub fn function_at(&self, addr: u64) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| matches!(f, Some((entry, _)) if *entry == addr))
            .map(FunctionId)
    }

    /// Function whose code covers `addr`.
    pub fn function_containing(&self, addr: u64) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| matches!(f, Some((entry, size)) if addr >= *entry && addr < entry + size))
            .map(FunctionId)
    }

    /// Highest mapped address plus one.
    pub fn end(&self) -> u64 {
        self.segments.iter().map(Segment::end).max().unwrap_or(IMAGE_BASE)
    }
}

const fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

const fn uses_got(r_type: u32) -> bool {
    matches!(
        r_type,
        elf::R_X86_64_GOTPCREL | elf::R_X86_64_GOTPCRELX | elf::R_X86_64_REX_GOTPCRELX
    )
}

/// One relocation to apply: where, what, and against which symbol.
struct Fixup {
    segment: usize,
    offset: u64,
    symbol: SymbolId,
    r_type: u32,
    addend: i64,
}

/// Lays out the module and links it into an [`Image`].
pub fn link_image(module: &Module) -> Result<Image, EmitError> {
    let layout = encoder::layout_module(module)?;
    let rebaser = Rebaser::new(module, &layout)?;
    let mut image = Image::default();

    let mut segment_of: Vec<Option<usize>> = vec![None; module.sections.len()];
    let mut cursor = IMAGE_BASE;
    for (index, section) in module.sections.iter().enumerate() {
        let bytes = match section.role {
            SectionRole::Code => layout
                .section(SectionId(index))
                .map(|s| s.bytes.clone())
                .unwrap_or_default(),
            SectionRole::Bss => vec![0; section.size as usize],
            SectionRole::Strings | SectionRole::Data => section.data.clone(),
            SectionRole::Debug | SectionRole::Other => continue,
        };
        let slot = IMAGE_BASE + index as u64 * SECTION_STRIDE;
        let base = align_up(cursor.max(slot), PAGE.max(section.align));
        cursor = base + (bytes.len() as u64).max(1);
        segment_of[index] = Some(image.segments.len());
        image.segments.push(Segment {
            section: Some(SectionId(index)),
            name: section.name.clone(),
            base,
            bytes,
            code: section.is_code(),
            synthesized: section.synthesized,
        });
    }

    let mut symbols: Vec<Option<u64>> = vec![None; module.symbols.len()];
    for (index, symbol) in module.symbols.iter().enumerate() {
        symbols[index] = match symbol.placement {
            SymbolPlacement::Section(section) => {
                let Some(segment) = segment_of[section.0] else {
                    continue;
                };
                let value = if module.section(section).is_code() {
                    rebaser.value(SymbolId(index)).map_or(0, |(value, _)| value)
                } else {
                    symbol.value
                };
                Some(image.segments[segment].base + value)
            }
            SymbolPlacement::Absolute => Some(symbol.value),
            _ => None,
        };
    }

    // Commons get zeroed storage of their own.
    let mut common = Vec::new();
    let common_base = align_up(cursor, PAGE);
    for (index, symbol) in module.symbols.iter().enumerate() {
        if symbol.placement != SymbolPlacement::Common {
            continue;
        }
        let at = align_up(common.len() as u64, symbol.value.max(1));
        common.resize((at + symbol.size.max(1)) as usize, 0);
        symbols[index] = Some(common_base + at);
    }
    if !common.is_empty() {
        cursor = common_base + common.len() as u64;
        image.segments.push(Segment {
            section: None,
            name: "*COM*".into(),
            base: common_base,
            bytes: common,
            code: false,
            synthesized: false,
        });
    }

    // One stub per distinct undefined name.
    let extern_base = align_up(cursor, PAGE);
    let mut by_name: BTreeMap<&str, u64> = BTreeMap::new();
    for (index, symbol) in module.symbols.iter().enumerate() {
        if symbol.placement != SymbolPlacement::Undefined || symbol.name.is_empty() {
            continue;
        }
        let next = extern_base + by_name.len() as u64 * EXTERN_SLOT;
        let addr = *by_name.entry(symbol.name.as_str()).or_insert(next);
        image.externals.insert(addr, symbol.name.clone());
        symbols[index] = Some(addr);
    }
    if !by_name.is_empty() {
        let size = by_name.len() as u64 * EXTERN_SLOT;
        cursor = extern_base + size;
        image.segments.push(Segment {
            section: None,
            name: "*UND*".into(),
            base: extern_base,
            bytes: vec![0xcc; size as usize],
            code: false,
            synthesized: false,
        });
    }

    let mut fixups = Vec::new();
    for (index, section) in module.sections.iter().enumerate() {
        let Some(segment) = segment_of[index] else {
            continue;
        };
        if let Some(code) = layout.section(SectionId(index)) {
            for rel in &code.relocations {
                fixups.push(Fixup {
                    segment,
                    offset: rel.offset,
                    symbol: rel.symbol,
                    r_type: rel.r_type,
                    addend: rebaser.rebase(rel.symbol, rel.addend, false)? - rel.trailing,
                });
            }
            continue;
        }
        for rel in &section.relocations {
            fixups.push(Fixup {
                segment,
                offset: rel.offset,
                symbol: rel.symbol,
                r_type: rel.r_type,
                addend: rebaser.rebase(rel.symbol, rel.addend, false)?,
            });
        }
    }

    // GOT slots hold the resolved address of the symbol.
    let got_base = align_up(cursor, PAGE);
    let mut got: BTreeMap<SymbolId, u64> = BTreeMap::new();
    let mut got_bytes = Vec::new();
    for fixup in fixups.iter().filter(|f| uses_got(f.r_type)) {
        if got.contains_key(&fixup.symbol) {
            continue;
        }
        got.insert(fixup.symbol, got_base + got_bytes.len() as u64);
        let value = symbols.get(fixup.symbol.0).copied().flatten().unwrap_or(0);
        got_bytes.extend_from_slice(&value.to_le_bytes());
    }
    if !got_bytes.is_empty() {
        image.segments.push(Segment {
            section: None,
            name: "*GOT*".into(),
            base: got_base,
            bytes: got_bytes,
            code: false,
            synthesized: false,
        });
    }

    for fixup in &fixups {
        let s = symbols
            .get(fixup.symbol.0)
            .copied()
            .flatten()
            .ok_or(EmitError::UnresolvedSymbol(fixup.symbol.0))?;
        let size = module.symbol(fixup.symbol).size;
        let segment = &mut image.segments[fixup.segment];
        let p = segment.base + fixup.offset;
        let got_slot = got.get(&fixup.symbol).copied().unwrap_or(0);
        patch(segment, fixup, s, size, p, got_slot)?;
    }

    for section in &layout.sections {
        let Some(segment) = segment_of[section.section.0] else {
            continue;
        };
        let base = image.segments[segment].base;
        for placement in &section.functions {
            let index = placement.function.0;
            if image.functions.len() <= index {
                image.functions.resize(index + 1, None);
            }
            image.functions[index] = Some((base + placement.start, placement.size));
        }
    }
    image.symbols = symbols;
    trace!(
        segments = image.segments.len(),
        externals = image.externals.len(),
        fixups = fixups.len(),
        "linked image"
    );
    Ok(image)
}

fn patch(segment: &mut Segment, fixup: &Fixup, s: u64, size: u64, p: u64, got: u64) -> Result<(), EmitError> {
    let a = fixup.addend;
    let link_error = |reason: &str| EmitError::Link {
        r_type: fixup.r_type,
        offset: p,
        reason: reason.to_string(),
    };
    let (value, width): (i128, usize) = match fixup.r_type {
        elf::R_X86_64_64 => (i128::from(s) + i128::from(a), 8),
        elf::R_X86_64_PC64 => (i128::from(s) + i128::from(a) - i128::from(p), 8),
        elf::R_X86_64_PC32 | elf::R_X86_64_PLT32 => {
            (i128::from(s) + i128::from(a) - i128::from(p), 4)
        }
        elf::R_X86_64_32 | elf::R_X86_64_32S => (i128::from(s) + i128::from(a), 4),
        elf::R_X86_64_16 => (i128::from(s) + i128::from(a), 2),
        elf::R_X86_64_PC16 => (i128::from(s) + i128::from(a) - i128::from(p), 2),
        elf::R_X86_64_8 => (i128::from(s) + i128::from(a), 1),
        elf::R_X86_64_PC8 => (i128::from(s) + i128::from(a) - i128::from(p), 1),
        elf::R_X86_64_SIZE32 => (i128::from(size) + i128::from(a), 4),
        elf::R_X86_64_SIZE64 => (i128::from(size) + i128::from(a), 8),
        r if uses_got(r) => (i128::from(got) + i128::from(a) - i128::from(p), 4),
        _ => return Err(link_error("not supported in an in-memory image")),
    };
    let fits = match (fixup.r_type, width) {
        (_, 8) => true,
        (elf::R_X86_64_32, 4) => u32::try_from(value).is_ok(),
        (_, 4) => i32::try_from(value).is_ok(),
        (_, 2) => i16::try_from(value).is_ok() || u16::try_from(value).is_ok(),
        _ => i8::try_from(value).is_ok() || u8::try_from(value).is_ok(),
    };
    if !fits {
        return Err(link_error("value does not fit the field"));
    }
    let at = fixup.offset as usize;
    let field = segment
        .bytes
        .get_mut(at..at + width)
        .ok_or_else(|| link_error("field outside its section"))?;
    field.copy_from_slice(&(value as u64).to_le_bytes()[..width]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_ir::{BlockKind, Function, InstrReloc, Instruction, RelocField, Terminator};
    use crate::module::{Section, Symbol, SymbolBinding, SymbolType};
    use iced_x86::Code;

    /// `f: call puts; ret` in `.text`, `puts` undefined.
    fn calling_module() -> Module {
        let mut module = Module::default();
        let text = module.add_section(Section::synthesized(
            ".text",
            object::SectionKind::Text,
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            16,
            SectionRole::Code,
        ));
        let mut f_sym = Symbol::local("f", SymbolType::Func, text, 0, 0);
        f_sym.binding = SymbolBinding::Global;
        let f_id = module.add_symbol(f_sym);
        let mut puts = Symbol::local("puts", SymbolType::NoType, text, 0, 0);
        puts.binding = SymbolBinding::Global;
        puts.placement = SymbolPlacement::Undefined;
        let puts_id = module.add_symbol(puts);

        let mut f = Function::synthesized("f", f_id, text, 16);
        let call = Instruction::new(iced_x86::Instruction::with_branch(Code::Call_rel32_64, 0).unwrap())
            .with_reloc(InstrReloc {
                symbol: puts_id,
                r_type: elf::R_X86_64_PLT32,
                addend: 0,
                field: RelocField::Branch,
                pc_relative: true,
            });
        let ret = Instruction::new(iced_x86::Instruction::with(Code::Retnq));
        let entry = f.add_block(vec![call], Terminator::Return(ret), BlockKind::Original);
        f.entry = entry;
        f.layout = vec![entry];
        module.add_function(f);
        module
    }

    #[test]
    fn calls_resolve_to_external_stub() {
        let image = link_image(&calling_module()).unwrap();
        let text = &image.segments[0];
        assert_eq!(text.base, IMAGE_BASE);
        assert_eq!(text.bytes[0], 0xe8);
        let rel = i32::from_le_bytes(text.bytes[1..5].try_into().unwrap());
        let target = (text.base + 5).wrapping_add_signed(i64::from(rel));
        assert_eq!(image.external_at(target), Some("puts"));
        assert_eq!(image.entry(FunctionId(0)), Some(IMAGE_BASE));
        assert_eq!(image.function_at(IMAGE_BASE), Some(FunctionId(0)));
        assert_eq!(image.function_containing(IMAGE_BASE + 5), Some(FunctionId(0)));
    }

    #[test]
    fn data_relocations_point_into_code() {
        let mut module = calling_module();
        let data = module.add_section(Section::synthesized(
            ".data.rel",
            object::SectionKind::Data,
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC | elf::SHF_WRITE),
            8,
            SectionRole::Data,
        ));
        module.section_mut(data).data = vec![0; 8];
        module.section_mut(data).size = 8;
        module.section_mut(data).relocations.push(crate::module::Relocation {
            offset: 0,
            symbol: SymbolId(0),
            r_type: elf::R_X86_64_64,
            addend: 0,
        });
        let image = link_image(&module).unwrap();
        let segment = image
            .segments
            .iter()
            .find(|s| s.name == ".data.rel")
            .unwrap();
        assert_eq!(segment.base, IMAGE_BASE + SECTION_STRIDE);
        let pointer = u64::from_le_bytes(segment.bytes[..8].try_into().unwrap());
        assert_eq!(pointer, IMAGE_BASE);
    }
}
