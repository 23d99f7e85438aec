//! `shroud decode`: lists lifted functions and their blocks.

/// Module for the `decode` subcommand, which lists the lifted form of an object.
///
/// Every function is printed block by block in layout order, instructions in
/// Intel syntax, with the relocations each instruction carries.
use super::CliError;
use async_trait::async_trait;
use clap::Args;
use iced_x86::{Formatter, IntelFormatter};
use shroud_core::cfg_ir::{Function, Terminator};
use shroud_core::decoder::read_object;
use shroud_core::Module;
use std::fmt::Write;
use std::path::PathBuf;

/// Arguments for the `decode` subcommand.
#[derive(Args)]
pub struct DecodeArgs {
    /// ELF relocatable object to decode
    pub input: PathBuf,
}

#[async_trait]
impl super::Command for DecodeArgs {
    async fn execute(self) -> Result<(), CliError> {
        let (module, info) = read_object(&self.input)?;
        println!(
            "; {} bytes, keccak256 {}",
            info.byte_length,
            hex::encode(info.keccak_hash)
        );
        print!("{}", render(&module));
        Ok(())
    }
}

/// Renders every function of `module` as an annotated listing.
pub fn render(module: &Module) -> String {
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    for name in &module.dropped_sections {
        let _ = writeln!(out, "; dropped section {name}");
    }
    for function in &module.functions {
        render_function(module, function, &mut formatter, &mut out);
    }
    out
}

fn render_function(module: &Module, function: &Function, formatter: &mut IntelFormatter, out: &mut String) {
    let section = &module.section(function.section).name;
    let _ = writeln!(
        out,
        "\n{}: ; {section}+{:#x}, {} bytes, {} blocks",
        function.name,
        function.offset,
        function.size,
        function.blocks.len()
    );
    let mut text = String::new();
    for id in &function.layout {
        let block = function.block(*id);
        let origin = block.origin.map(|o| format!(" @{o:#x}")).unwrap_or_default();
        let _ = writeln!(out, "  {id}: ; {:?}{origin}", block.kind);
        let terminator = block.terminator.instruction();
        for insn in block.instructions.iter().chain(terminator) {
            text.clear();
            formatter.format(insn.insn(), &mut text);
            let _ = write!(out, "    {text}");
            if let Some(reloc) = &insn.reloc {
                let _ = write!(
                    out,
                    "  ; R_X86_64 type {} {}{:+}",
                    reloc.r_type,
                    module.symbol(reloc.symbol).name,
                    reloc.addend
                );
            }
            out.push('\n');
        }
        match &block.terminator {
            Terminator::Jump(target) => {
                let _ = writeln!(out, "    ; -> {target}");
            }
            Terminator::Branch {
                condition,
                taken,
                fallthrough,
            } => {
                let mnemonic = format!("{:?}", condition.mnemonic()).to_lowercase();
                let _ = writeln!(out, "    {mnemonic} {taken} ; else {fallthrough}");
            }
            Terminator::Unreachable => out.push_str("    ; unreachable\n"),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::add_object;

    #[test]
    fn lists_functions_in_intel_syntax() {
        let module = shroud_core::decode_object(&add_object()).unwrap();
        let listing = render(&module);
        assert!(listing.contains("add: ; .text+0x0, 5 bytes"));
        assert!(listing.contains("mov eax,edi"));
        assert!(listing.contains("add eax,esi"));
        assert!(listing.contains("ret"));
    }
}
