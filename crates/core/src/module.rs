//! Object-level model: sections, symbols, data relocations, COMDAT groups and
//! the functions lifted from executable sections.
//!
//! Ids are plain indices into the owning vectors. Passes only ever append, so
//! an id taken from the original module still names the same entity after any
//! number of transforms.

use crate::cfg_ir::Function;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a [`Section`] inside [`Module::sections`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionId(pub usize);

/// Index of a [`Symbol`] inside [`Module::symbols`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub usize);

/// Index of a [`Function`] inside [`Module::functions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FunctionId(pub usize);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

/// What a section holds, as far as the engine is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionRole {
    /// Executable `PROGBITS`; contents are rebuilt from [`Module::functions`].
    Code,
    /// Mergeable NUL-terminated strings with entsize 1.
    Strings,
    /// Any other allocated, initialized section.
    Data,
    /// `NOBITS` storage.
    Bss,
    /// DWARF and other `.debug*` sections.
    Debug,
    /// Non-allocated sections such as `.comment` or `.note.GNU-stack`.
    Other,
}

/// A section copied from the input or created by a pass.
#[derive(Debug, Clone)]
pub struct Section {
    /// Section name, e.g. `.text.main`.
    pub name: String,
    /// `object` classification of the section.
    pub kind: object::SectionKind,
    /// Raw `sh_type`.
    pub sh_type: u32,
    /// Raw `sh_flags`.
    pub sh_flags: u64,
    /// Entry size for merge and table sections.
    pub entsize: u64,
    /// Required alignment.
    pub align: u64,
    /// How the obfuscator treats the section.
    pub role: SectionRole,
    /// Original bytes. Ignored by the emitter for [`SectionRole::Code`].
    pub data: Vec<u8>,
    /// Size in bytes; differs from `data.len()` only for `NOBITS`.
    pub size: u64,
    /// Relocations applied to this section's bytes. Code sections keep theirs
    /// on the instructions instead.
    pub relocations: Vec<Relocation>,
    /// Created by a pass rather than lifted.
    pub synthesized: bool,
}

impl Section {
    /// Creates an empty section not present in the input.
    pub fn synthesized(
        name: impl Into<String>,
        kind: object::SectionKind,
        sh_type: u32,
        sh_flags: u64,
        align: u64,
        role: SectionRole,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            sh_type,
            sh_flags,
            entsize: 0,
            align,
            role,
            data: Vec::new(),
            size: 0,
            relocations: Vec::new(),
            synthesized: true,
        }
    }

    /// Whether the section holds lifted code.
    pub const fn is_code(&self) -> bool {
        matches!(self.role, SectionRole::Code)
    }
}

/// ELF symbol binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolBinding {
    Local,
    Global,
    Weak,
    Other(u8),
}

/// ELF symbol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolType {
    NoType,
    Object,
    Func,
    Section,
    File,
    Common,
    Tls,
    Other(u8),
}

/// ELF symbol visibility (`st_other & 3`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Default,
    Internal,
    Hidden,
    Protected,
}

/// Where a symbol is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolPlacement {
    Undefined,
    Absolute,
    Common,
    /// `STT_FILE` entries carry no section.
    None,
    Section(SectionId),
}

/// One symbol table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Symbol name; empty for section symbols.
    pub name: String,
    /// `STB_*` binding.
    pub binding: SymbolBinding,
    /// `STT_*` type.
    pub kind: SymbolType,
    /// `STV_*` visibility.
    pub visibility: Visibility,
    /// Where the symbol is defined.
    pub placement: SymbolPlacement,
    /// Offset inside the defining section in the input (alignment for commons).
    pub value: u64,
    /// Size in bytes as declared in the symbol table.
    pub size: u64,
    /// Raw `st_other`; visibility lives in the low bits.
    pub st_other: u8,
}

impl Symbol {
    /// Decodes binding and type from a raw `st_info` byte.
    pub fn from_elf(
        name: String,
        st_info: u8,
        st_other: u8,
        placement: SymbolPlacement,
        value: u64,
        size: u64,
    ) -> Self {
        use object::elf;

        let binding = match st_info >> 4 {
            elf::STB_LOCAL => SymbolBinding::Local,
            elf::STB_GLOBAL => SymbolBinding::Global,
            elf::STB_WEAK => SymbolBinding::Weak,
            other => SymbolBinding::Other(other),
        };
        let kind = match st_info & 0xf {
            elf::STT_NOTYPE => SymbolType::NoType,
            elf::STT_OBJECT => SymbolType::Object,
            elf::STT_FUNC => SymbolType::Func,
            elf::STT_SECTION => SymbolType::Section,
            elf::STT_FILE => SymbolType::File,
            elf::STT_COMMON => SymbolType::Common,
            elf::STT_TLS => SymbolType::Tls,
            other => SymbolType::Other(other),
        };
        let visibility = match st_other & 0x3 {
            elf::STV_INTERNAL => Visibility::Internal,
            elf::STV_HIDDEN => Visibility::Hidden,
            elf::STV_PROTECTED => Visibility::Protected,
            _ => Visibility::Default,
        };
        Self {
            name,
            binding,
            kind,
            visibility,
            placement,
            value,
            size,
            st_other,
        }
    }

    /// Re-encodes binding and type as an ELF `st_info` byte.
    pub const fn st_info(&self) -> u8 {
        use object::elf;

        let bind = match self.binding {
            SymbolBinding::Local => elf::STB_LOCAL,
            SymbolBinding::Global => elf::STB_GLOBAL,
            SymbolBinding::Weak => elf::STB_WEAK,
            SymbolBinding::Other(b) => b,
        };
        let kind = match self.kind {
            SymbolType::NoType => elf::STT_NOTYPE,
            SymbolType::Object => elf::STT_OBJECT,
            SymbolType::Func => elf::STT_FUNC,
            SymbolType::Section => elf::STT_SECTION,
            SymbolType::File => elf::STT_FILE,
            SymbolType::Common => elf::STT_COMMON,
            SymbolType::Tls => elf::STT_TLS,
            SymbolType::Other(t) => t,
        };
        (bind << 4) | (kind & 0xf)
    }

    /// Local symbol with a given type, defined in `section` at `value`.
    pub fn local(name: impl Into<String>, kind: SymbolType, section: SectionId, value: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            binding: SymbolBinding::Local,
            kind,
            visibility: Visibility::Default,
            placement: SymbolPlacement::Section(section),
            value,
            size,
            st_other: 0,
        }
    }

    /// Whether the symbol has local binding.
    pub fn is_local(&self) -> bool {
        self.binding == SymbolBinding::Local
    }

    /// Whether this is an `STT_SECTION` symbol.
    pub fn is_section(&self) -> bool {
        self.kind == SymbolType::Section
    }

    /// The defining section, if any.
    pub const fn section(&self) -> Option<SectionId> {
        match self.placement {
            SymbolPlacement::Section(id) => Some(id),
            _ => None,
        }
    }
}

/// A relocation against the bytes of a non-code section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    /// Offset of the patched field in the section.
    pub offset: u64,
    /// Symbol the relocation resolves against.
    pub symbol: SymbolId,
    /// ELF relocation type.
    pub r_type: u32,
    /// Explicit addend (RELA).
    pub addend: i64,
}

/// A COMDAT group.
#[derive(Debug, Clone)]
pub struct Comdat {
    /// Selection kind.
    pub kind: object::ComdatKind,
    /// Group signature symbol.
    pub symbol: SymbolId,
    /// Member sections.
    pub sections: Vec<SectionId>,
}

/// The unit of work: everything lifted from one relocatable object.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// ELF header `e_ident[EI_OSABI]`.
    pub os_abi: u8,
    /// ELF header `e_ident[EI_ABIVERSION]`.
    pub abi_version: u8,
    /// ELF header `e_flags`.
    pub e_flags: u32,
    /// Section arena, indexed by `SectionId.0`.
    pub sections: Vec<Section>,
    /// Symbol arena, indexed by `SymbolId.0`.
    pub symbols: Vec<Symbol>,
    /// Functions lifted from code sections, plus synthesized ones.
    pub functions: Vec<Function>,
    /// COMDAT groups, rewritten to the emitted section ids.
    pub comdats: Vec<Comdat>,
    /// Names of input sections that could not survive re-layout (unwind tables).
    pub dropped_sections: Vec<String>,
    /// Size of the input file in bytes.
    pub source_size: u64,
}

impl Module {
    /// The section with id `id`.
    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id.0]
    }

    /// Mutable access to section `id`.
    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0]
    }

    /// The symbol with id `id`.
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    /// Mutable access to symbol `id`.
    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    /// The function with id `id`.
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0]
    }

    /// Mutable access to function `id`.
    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0]
    }

    /// Appends a section and returns its id.
    pub fn add_section(&mut self, section: Section) -> SectionId {
        self.sections.push(section);
        SectionId(self.sections.len() - 1)
    }

    /// Appends a symbol and returns its id.
    pub fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        self.symbols.push(symbol);
        SymbolId(self.symbols.len() - 1)
    }

    /// Appends a function and returns its id.
    pub fn add_function(&mut self, function: Function) -> FunctionId {
        self.functions.push(function);
        FunctionId(self.functions.len() - 1)
    }

    /// The `STT_SECTION` symbol of `section`, if the module has one.
    pub fn section_symbol(&self, section: SectionId) -> Option<SymbolId> {
        self.symbols
            .iter()
            .position(|s| s.is_section() && s.placement == SymbolPlacement::Section(section))
            .map(SymbolId)
    }

    /// First symbol named `name`.
    pub fn symbol_by_name(&self, name: &str) -> Option<SymbolId> {
        self.symbols.iter().position(|s| s.name == name).map(SymbolId)
    }

    /// Function whose primary symbol or one of its aliases is named `name`.
    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|f| {
                f.name == name
                    || f.aliases
                        .iter()
                        .any(|alias| self.symbols[alias.0].name == name)
            })
            .map(FunctionId)
    }

    /// Function ids placed in `section`, in module order.
    pub fn functions_in(&self, section: SectionId) -> Vec<FunctionId> {
        self.functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.section == section)
            .map(|(i, _)| FunctionId(i))
            .collect()
    }

    /// Ids of executable sections.
    pub fn code_sections(&self) -> Vec<SectionId> {
        self.sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_code())
            .map(|(i, _)| SectionId(i))
            .collect()
    }

    /// Total number of instructions across all functions, terminators included.
    pub fn instruction_count(&self) -> usize {
        self.functions.iter().map(Function::instruction_count).sum()
    }

    /// Returns `base` if no symbol uses it yet, otherwise `base.N` for the first free N.
    pub fn unique_symbol_name(&self, base: &str) -> String {
        if !self.symbols.iter().any(|s| s.name == base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}.{n}"))
            .find(|candidate| !self.symbols.iter().any(|s| &s.name == candidate))
            .unwrap_or_else(|| base.to_string())
    }
}
