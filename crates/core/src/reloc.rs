//! x86-64 ELF relocation types the engine can carry through a re-layout.

use object::elf;

/// Width in bytes of the field patched by `r_type`, or `None` when the type
/// is not supported.
///
/// `R_X86_64_TLSGD` and `R_X86_64_TLSLD` are deliberately absent: the linker
/// relaxes them by matching exact byte sequences around the call to
/// `__tls_get_addr`, which re-encoding cannot guarantee.
pub const fn field_size(r_type: u32) -> Option<u8> {
    match r_type {
        elf::R_X86_64_64
        | elf::R_X86_64_PC64
        | elf::R_X86_64_GOTOFF64
        | elf::R_X86_64_SIZE64
        | elf::R_X86_64_DTPOFF64
        | elf::R_X86_64_TPOFF64 => Some(8),
        elf::R_X86_64_PC32
        | elf::R_X86_64_GOT32
        | elf::R_X86_64_PLT32
        | elf::R_X86_64_GOTPCREL
        | elf::R_X86_64_32
        | elf::R_X86_64_32S
        | elf::R_X86_64_GOTPC32
        | elf::R_X86_64_SIZE32
        | elf::R_X86_64_DTPOFF32
        | elf::R_X86_64_GOTTPOFF
        | elf::R_X86_64_TPOFF32
        | elf::R_X86_64_GOTPCRELX
        | elf::R_X86_64_REX_GOTPCRELX => Some(4),
        elf::R_X86_64_16 | elf::R_X86_64_PC16 => Some(2),
        elf::R_X86_64_8 | elf::R_X86_64_PC8 => Some(1),
        _ => None,
    }
}

/// Whether the linker computes the field relative to its own address (`- P`).
pub const fn is_pc_relative(r_type: u32) -> bool {
    matches!(
        r_type,
        elf::R_X86_64_PC32
            | elf::R_X86_64_PLT32
            | elf::R_X86_64_GOTPCREL
            | elf::R_X86_64_GOTPCRELX
            | elf::R_X86_64_REX_GOTPCRELX
            | elf::R_X86_64_PC64
            | elf::R_X86_64_GOTPC32
            | elf::R_X86_64_GOTTPOFF
            | elf::R_X86_64_PC16
            | elf::R_X86_64_PC8
    )
}

/// Whether the relocated value is an address of the symbol plus addend, so a
/// reference into moved code can be remapped by adjusting the addend.
pub const fn addresses_symbol(r_type: u32) -> bool {
    matches!(
        r_type,
        elf::R_X86_64_64
            | elf::R_X86_64_32
            | elf::R_X86_64_32S
            | elf::R_X86_64_PC32
            | elf::R_X86_64_PLT32
            | elf::R_X86_64_PC64
            | elf::R_X86_64_16
            | elf::R_X86_64_PC16
            | elf::R_X86_64_8
            | elf::R_X86_64_PC8
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_dynamic_models_are_rejected() {
        assert_eq!(field_size(elf::R_X86_64_TLSGD), None);
        assert_eq!(field_size(elf::R_X86_64_TLSLD), None);
        assert_eq!(field_size(elf::R_X86_64_PLT32), Some(4));
        assert_eq!(field_size(elf::R_X86_64_64), Some(8));
    }

    #[test]
    fn pc_relative_classification() {
        assert!(is_pc_relative(elf::R_X86_64_PLT32));
        assert!(is_pc_relative(elf::R_X86_64_REX_GOTPCRELX));
        assert!(!is_pc_relative(elf::R_X86_64_32S));
        assert!(!is_pc_relative(elf::R_X86_64_64));
    }
}
