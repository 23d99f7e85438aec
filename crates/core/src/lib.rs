//! Object model, loader and emitter for x86-64 ELF relocatable objects.

pub mod cfg_ir;
pub mod decoder;
pub mod encoder;
pub mod image;
pub mod insn;
pub mod module;
pub mod reloc;

pub use cfg_ir::{Block, BlockId, BlockKind, Function, Instruction, Target, Terminator};
pub use decoder::{DecodeInfo, decode_object, read_object};
pub use encoder::{EmitOptions, emit, measure};
pub use image::{Image, link_image};
pub use module::{FunctionId, Module, SectionId, SymbolId};
