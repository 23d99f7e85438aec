//! Concrete semantics of the integer x86-64 subset.
//!
//! Covers what the passes synthesize plus the bread and butter of compiled C:
//! moves and extensions, ALU operations with exact status flags, shifts,
//! multiplication and division, stack operations, conditional moves and sets,
//! and near control flow. Anything else is reported as [`Unsupported`] so the
//! caller can skip the function instead of guessing.

use iced_x86::{ConditionCode, Instruction, Mnemonic, OpKind, Register};
use shroud_core::insn::gpr_index;

/// Base address `fs:` resolves to.
pub const FS_BASE: u64 = 0x7f00_0000_0000;

/// An instruction outside the modelled subset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported: {0}")]
pub struct Unsupported(pub String);

/// Byte-addressed memory seen by [`execute`].
pub trait Memory {
    /// Little-endian read of `size` bytes (at most 8).
    fn read(&mut self, addr: u64, size: usize) -> u64;
    /// Little-endian write of the low `size` bytes of `value`.
    fn write(&mut self, addr: u64, size: usize, value: u64);
}

/// Arithmetic status flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// Carry.
    pub cf: bool,
    /// Parity of the low byte.
    pub pf: bool,
    /// Auxiliary carry out of bit 3.
    pub af: bool,
    /// Zero.
    pub zf: bool,
    /// Sign.
    pub sf: bool,
    /// Overflow.
    pub of: bool,
}

impl Flags {
    /// RFLAGS image as pushed by `pushfq`. Bit 1 always reads as set.
    pub const fn to_bits(self) -> u64 {
        (self.cf as u64)
            | 1 << 1
            | (self.pf as u64) << 2
            | (self.af as u64) << 4
            | (self.zf as u64) << 6
            | (self.sf as u64) << 7
            | (self.of as u64) << 11
    }

    /// Inverse of [`Flags::to_bits`]; other bits are ignored.
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            cf: bits & 1 != 0,
            pf: bits & (1 << 2) != 0,
            af: bits & (1 << 4) != 0,
            zf: bits & (1 << 6) != 0,
            sf: bits & (1 << 7) != 0,
            of: bits & (1 << 11) != 0,
        }
    }

    /// Whether `condition` holds.
    pub const fn holds(self, condition: ConditionCode) -> bool {
        match condition {
            ConditionCode::o => self.of,
            ConditionCode::no => !self.of,
            ConditionCode::b => self.cf,
            ConditionCode::ae => !self.cf,
            ConditionCode::e => self.zf,
            ConditionCode::ne => !self.zf,
            ConditionCode::be => self.cf || self.zf,
            ConditionCode::a => !self.cf && !self.zf,
            ConditionCode::s => self.sf,
            ConditionCode::ns => !self.sf,
            ConditionCode::p => self.pf,
            ConditionCode::np => !self.pf,
            ConditionCode::l => self.sf != self.of,
            ConditionCode::ge => self.sf == self.of,
            ConditionCode::le => self.zf || self.sf != self.of,
            ConditionCode::g => !self.zf && self.sf == self.of,
            ConditionCode::None => true,
        }
    }

    fn result(&mut self, value: u64, size: usize) {
        self.zf = value & mask(size) == 0;
        self.sf = sign(value, size);
        self.pf = (value as u8).count_ones() % 2 == 0;
    }
}

/// Register file, flags and instruction pointer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cpu {
    /// General purpose registers in encoding order.
    pub regs: [u64; 16],
    /// Arithmetic status flags.
    pub flags: Flags,
    /// Address of the next instruction.
    pub rip: u64,
}

/// Control transfer requested by an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Next,
    Jump(u64),
    /// The return address has not been pushed yet.
    Call { target: u64, ret: u64 },
    /// Popped return address.
    Return(u64),
    Trap,
    Fault(String),
}

/// Register file slot of `rsp`.
pub const RSP: usize = 4;
/// Register file slot of `rbp`.
pub const RBP: usize = 5;

/// Mask of the low `size` bytes.
pub const fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Mask of the low `bits` bits.
pub const fn mask_bits(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Sign bit of a `size`-byte value.
pub const fn sign(value: u64, size: usize) -> bool {
    (value >> (size * 8 - 1)) & 1 == 1
}

/// Sign-extends a `size`-byte value to 64 bits.
pub const fn sign_extend(value: u64, size: usize) -> i64 {
    let shift = 64 - size as u32 * 8;
    ((value << shift) as i64) >> shift
}

fn unsupported(insn: &Instruction, what: &str) -> Unsupported {
    Unsupported(format!("{what} in `{:?}`", insn.code()))
}

/// Slot, bit shift and size in bytes of a general purpose register.
fn slot(reg: Register) -> Option<(usize, u32, usize)> {
    match reg {
        Register::AH => Some((0, 8, 1)),
        Register::CH => Some((1, 8, 1)),
        Register::DH => Some((2, 8, 1)),
        Register::BH => Some((3, 8, 1)),
        _ => {
            let index = gpr_index(reg)?;
            let size = match reg.size() {
                size @ (1 | 2 | 4 | 8) => size,
                _ => return None,
            };
            Some((index, 0, size))
        }
    }
}

impl Cpu {
    /// Reads `reg`, or `None` for registers outside the file.
    pub fn read_reg(&self, reg: Register) -> Option<u64> {
        let (index, shift, size) = slot(reg)?;
        Some((self.regs[index] >> shift) & mask(size))
    }

    /// Writes `reg` with x86-64 partial-register rules: 32-bit writes zero the upper half.
    pub fn write_reg(&mut self, reg: Register, value: u64) -> Option<()> {
        let (index, shift, size) = slot(reg)?;
        let slot = &mut self.regs[index];
        *slot = match size {
            8 => value,
            4 => value & mask(4),
            _ => {
                let field = mask(size) << shift;
                (*slot & !field) | ((value << shift) & field)
            }
        };
        Some(())
    }

    /// `push` of a quadword.
    pub fn push(&mut self, mem: &mut impl Memory, value: u64) {
        self.regs[RSP] = self.regs[RSP].wrapping_sub(8);
        mem.write(self.regs[RSP], 8, value);
    }

    /// `pop` of a quadword.
    pub fn pop(&mut self, mem: &mut impl Memory) -> u64 {
        let value = mem.read(self.regs[RSP], 8);
        self.regs[RSP] = self.regs[RSP].wrapping_add(8);
        value
    }

    /// Effective address of the memory operand.
    pub fn address(&self, insn: &Instruction) -> Result<u64, Unsupported> {
        let mut addr = insn.memory_displacement64();
        match insn.memory_base() {
            Register::None | Register::RIP => {}
            base => {
                let value = self
                    .read_reg(base)
                    .ok_or_else(|| unsupported(insn, "address base"))?;
                addr = addr.wrapping_add(value);
            }
        }
        if insn.memory_index() != Register::None {
            let index = self
                .read_reg(insn.memory_index())
                .ok_or_else(|| unsupported(insn, "address index"))?;
            addr = addr.wrapping_add(index.wrapping_mul(u64::from(insn.memory_index_scale())));
        }
        match insn.memory_segment() {
            Register::FS => Ok(addr.wrapping_add(FS_BASE)),
            Register::GS => Err(unsupported(insn, "gs segment")),
            _ => Ok(addr),
        }
    }

    fn size_of(&self, insn: &Instruction, op: u32) -> Result<usize, Unsupported> {
        match insn.op_kind(op) {
            OpKind::Register => slot(insn.op_register(op))
                .map(|(_, _, size)| size)
                .ok_or_else(|| unsupported(insn, "register")),
            OpKind::Memory => match insn.memory_size().size() {
                size @ (1 | 2 | 4 | 8) => Ok(size),
                _ => Err(unsupported(insn, "memory size")),
            },
            _ => Err(unsupported(insn, "operand")),
        }
    }

    fn read(&self, mem: &mut impl Memory, insn: &Instruction, op: u32) -> Result<u64, Unsupported> {
        match insn.op_kind(op) {
            OpKind::Register => self
                .read_reg(insn.op_register(op))
                .ok_or_else(|| unsupported(insn, "register")),
            OpKind::Memory => {
                let size = self.size_of(insn, op)?;
                Ok(mem.read(self.address(insn)?, size))
            }
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(insn.immediate(op)),
            _ => Err(unsupported(insn, "operand")),
        }
    }

    fn write(&mut self, mem: &mut impl Memory, insn: &Instruction, op: u32, value: u64) -> Result<(), Unsupported> {
        match insn.op_kind(op) {
            OpKind::Register => self
                .write_reg(insn.op_register(op), value)
                .ok_or_else(|| unsupported(insn, "register")),
            OpKind::Memory => {
                let size = self.size_of(insn, op)?;
                mem.write(self.address(insn)?, size, value & mask(size));
                Ok(())
            }
            _ => Err(unsupported(insn, "destination")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alu {
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
}

fn alu(op: Alu, a: u64, b: u64, size: usize, flags: &mut Flags) -> u64 {
    let m = mask(size);
    let (a, b) = (a & m, b & m);
    let carry = u128::from(flags.cf);
    let result = match op {
        Alu::Add | Alu::Adc => {
            let c = if op == Alu::Adc { carry } else { 0 };
            let wide = u128::from(a) + u128::from(b) + c;
            let r = wide as u64 & m;
            flags.cf = wide > u128::from(m);
            flags.of = sign((a ^ r) & (b ^ r), size);
            flags.af = (a ^ b ^ r) & 0x10 != 0;
            r
        }
        Alu::Sub | Alu::Sbb => {
            let c = if op == Alu::Sbb { carry } else { 0 };
            let r = a.wrapping_sub(b).wrapping_sub(c as u64) & m;
            flags.cf = u128::from(a) < u128::from(b) + c;
            flags.of = sign((a ^ b) & (a ^ r), size);
            flags.af = (a ^ b ^ r) & 0x10 != 0;
            r
        }
        Alu::And | Alu::Or | Alu::Xor => {
            flags.cf = false;
            flags.of = false;
            flags.af = false;
            match op {
                Alu::And => a & b,
                Alu::Or => a | b,
                _ => a ^ b,
            }
        }
    };
    flags.result(result, size);
    result
}

fn shift(mnemonic: Mnemonic, a: u64, count: u64, size: usize, flags: &mut Flags) -> Option<u64> {
    let bits = size as u64 * 8;
    let count = count & if size == 8 { 63 } else { 31 };
    let a = a & mask(size);
    if count == 0 {
        return Some(a);
    }
    let result = match mnemonic {
        Mnemonic::Shl | Mnemonic::Sal => {
            let r = if count >= bits { 0 } else { (a << count) & mask(size) };
            flags.cf = count <= bits && (a >> (bits - count)) & 1 == 1;
            flags.of = sign(r, size) != flags.cf;
            r
        }
        Mnemonic::Shr => {
            let r = if count >= bits { 0 } else { a >> count };
            flags.cf = count <= bits && (a >> (count - 1)) & 1 == 1;
            flags.of = sign(a, size);
            r
        }
        Mnemonic::Sar => {
            let signed = sign_extend(a, size);
            let r = (signed >> count.min(63)) as u64 & mask(size);
            flags.cf = (signed >> (count - 1).min(63)) & 1 == 1;
            flags.of = false;
            r
        }
        _ => return None,
    };
    flags.af = false;
    flags.result(result, size);
    Some(result)
}

/// Register pair used by one-operand multiply and divide.
fn accumulator(size: usize) -> Option<(Register, Register)> {
    match size {
        4 => Some((Register::EAX, Register::EDX)),
        8 => Some((Register::RAX, Register::RDX)),
        _ => None,
    }
}

fn wide_multiply(cpu: &mut Cpu, insn: &Instruction, src: u64, size: usize, signed: bool) -> Result<(), Unsupported> {
    let (lo, hi) = accumulator(size).ok_or_else(|| unsupported(insn, "operand size"))?;
    let a = cpu.read_reg(lo).unwrap_or_default();
    let bits = size as u32 * 8;
    let (low, high, overflow) = if signed {
        let product = i128::from(sign_extend(a, size)) * i128::from(sign_extend(src, size));
        let low = product as u64 & mask(size);
        let high = (product >> bits) as u64 & mask(size);
        (low, high, i128::from(sign_extend(low, size)) != product)
    } else {
        let product = u128::from(a & mask(size)) * u128::from(src & mask(size));
        let low = product as u64 & mask(size);
        let high = (product >> bits) as u64 & mask(size);
        (low, high, high != 0)
    };
    cpu.write_reg(lo, low);
    cpu.write_reg(hi, high);
    cpu.flags.cf = overflow;
    cpu.flags.of = overflow;
    cpu.flags.result(low, size);
    Ok(())
}

fn divide(cpu: &mut Cpu, insn: &Instruction, divisor: u64, size: usize, signed: bool) -> Result<Effect, Unsupported> {
    let (lo, hi) = accumulator(size).ok_or_else(|| unsupported(insn, "operand size"))?;
    let bits = size as u32 * 8;
    let low = cpu.read_reg(lo).unwrap_or_default();
    let high = cpu.read_reg(hi).unwrap_or_default();
    if divisor & mask(size) == 0 {
        return Ok(Effect::Fault("division by zero".into()));
    }
    let (quotient, remainder) = if signed {
        let dividend = ((u128::from(high) << bits | u128::from(low)) as i128) << (128 - 2 * bits) >> (128 - 2 * bits);
        let divisor = i128::from(sign_extend(divisor, size));
        let q = dividend / divisor;
        if q < i128::from(sign_extend(1 << (bits - 1), size)) || q > i128::from(mask(size) >> 1) {
            return Ok(Effect::Fault("quotient overflow".into()));
        }
        (q as u64 & mask(size), (dividend % divisor) as u64 & mask(size))
    } else {
        let dividend = u128::from(high) << bits | u128::from(low);
        let divisor = u128::from(divisor & mask(size));
        let q = dividend / divisor;
        if q > u128::from(mask(size)) {
            return Ok(Effect::Fault("quotient overflow".into()));
        }
        (q as u64, (dividend % divisor) as u64)
    };
    cpu.write_reg(lo, quotient);
    cpu.write_reg(hi, remainder);
    Ok(Effect::Next)
}

const fn is_cmov(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Cmova
            | Mnemonic::Cmovae
            | Mnemonic::Cmovb
            | Mnemonic::Cmovbe
            | Mnemonic::Cmove
            | Mnemonic::Cmovg
            | Mnemonic::Cmovge
            | Mnemonic::Cmovl
            | Mnemonic::Cmovle
            | Mnemonic::Cmovne
            | Mnemonic::Cmovno
            | Mnemonic::Cmovnp
            | Mnemonic::Cmovns
            | Mnemonic::Cmovo
            | Mnemonic::Cmovp
            | Mnemonic::Cmovs
    )
}

const fn is_set(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Seta
            | Mnemonic::Setae
            | Mnemonic::Setb
            | Mnemonic::Setbe
            | Mnemonic::Sete
            | Mnemonic::Setg
            | Mnemonic::Setge
            | Mnemonic::Setl
            | Mnemonic::Setle
            | Mnemonic::Setne
            | Mnemonic::Setno
            | Mnemonic::Setnp
            | Mnemonic::Setns
            | Mnemonic::Seto
            | Mnemonic::Setp
            | Mnemonic::Sets
    )
}

fn binary(mnemonic: Mnemonic) -> Option<Alu> {
    Some(match mnemonic {
        Mnemonic::Add => Alu::Add,
        Mnemonic::Adc => Alu::Adc,
        Mnemonic::Sub | Mnemonic::Cmp => Alu::Sub,
        Mnemonic::Sbb => Alu::Sbb,
        Mnemonic::And | Mnemonic::Test => Alu::And,
        Mnemonic::Or => Alu::Or,
        Mnemonic::Xor => Alu::Xor,
        _ => return None,
    })
}

/// Executes one instruction. `rip` must already point past it.
pub fn execute(cpu: &mut Cpu, mem: &mut impl Memory, insn: &Instruction) -> Result<Effect, Unsupported> {
    let mnemonic = insn.mnemonic();
    if insn.has_rep_prefix() || insn.has_repne_prefix() {
        return Err(unsupported(insn, "string prefix"));
    }

    if insn.is_jcc_short_or_near() {
        return Ok(if cpu.flags.holds(insn.condition_code()) {
            Effect::Jump(insn.near_branch_target())
        } else {
            Effect::Next
        });
    }
    if insn.is_jmp_short_or_near() {
        return Ok(Effect::Jump(insn.near_branch_target()));
    }
    if insn.is_call_near() {
        return Ok(Effect::Call {
            target: insn.near_branch_target(),
            ret: insn.next_ip(),
        });
    }
    if insn.is_call_near_indirect() {
        return Ok(Effect::Call {
            target: cpu.read(mem, insn, 0)?,
            ret: insn.next_ip(),
        });
    }
    if insn.is_jmp_near_indirect() {
        return Ok(Effect::Jump(cpu.read(mem, insn, 0)?));
    }
    if is_cmov(mnemonic) && insn.condition_code() != ConditionCode::None {
        if cpu.flags.holds(insn.condition_code()) {
            let value = cpu.read(mem, insn, 1)?;
            cpu.write(mem, insn, 0, value)?;
        } else if cpu.size_of(insn, 0)? == 4 {
            // A 32-bit cmov zero-extends even when the move does not happen.
            let value = cpu.read(mem, insn, 0)?;
            cpu.write(mem, insn, 0, value)?;
        }
        return Ok(Effect::Next);
    }
    if is_set(mnemonic) && insn.condition_code() != ConditionCode::None {
        let value = u64::from(cpu.flags.holds(insn.condition_code()));
        cpu.write(mem, insn, 0, value)?;
        return Ok(Effect::Next);
    }

    if let Some(op) = binary(mnemonic) {
        let size = cpu.size_of(insn, 0)?;
        let a = cpu.read(mem, insn, 0)?;
        let b = cpu.read(mem, insn, 1)?;
        let result = alu(op, a, b, size, &mut cpu.flags);
        if !matches!(mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
            cpu.write(mem, insn, 0, result)?;
        }
        return Ok(Effect::Next);
    }

    match mnemonic {
        Mnemonic::Nop | Mnemonic::Pause | Mnemonic::Endbr64 => {}
        Mnemonic::Mov => {
            let value = cpu.read(mem, insn, 1)?;
            cpu.write(mem, insn, 0, value)?;
        }
        Mnemonic::Movzx => {
            let value = cpu.read(mem, insn, 1)?;
            cpu.write(mem, insn, 0, value)?;
        }
        Mnemonic::Movsx | Mnemonic::Movsxd => {
            let size = cpu.size_of(insn, 1)?;
            let value = sign_extend(cpu.read(mem, insn, 1)?, size) as u64;
            cpu.write(mem, insn, 0, value)?;
        }
        Mnemonic::Lea => {
            let addr = cpu.address(insn)?;
            cpu.write(mem, insn, 0, addr)?;
        }
        Mnemonic::Xchg => {
            let a = cpu.read(mem, insn, 0)?;
            let b = cpu.read(mem, insn, 1)?;
            cpu.write(mem, insn, 0, b)?;
            cpu.write(mem, insn, 1, a)?;
        }
        Mnemonic::Inc | Mnemonic::Dec => {
            let size = cpu.size_of(insn, 0)?;
            let a = cpu.read(mem, insn, 0)?;
            let cf = cpu.flags.cf;
            let op = if mnemonic == Mnemonic::Inc { Alu::Add } else { Alu::Sub };
            let result = alu(op, a, 1, size, &mut cpu.flags);
            cpu.flags.cf = cf;
            cpu.write(mem, insn, 0, result)?;
        }
        Mnemonic::Neg => {
            let size = cpu.size_of(insn, 0)?;
            let a = cpu.read(mem, insn, 0)?;
            let result = alu(Alu::Sub, 0, a, size, &mut cpu.flags);
            cpu.write(mem, insn, 0, result)?;
        }
        Mnemonic::Not => {
            let a = cpu.read(mem, insn, 0)?;
            cpu.write(mem, insn, 0, !a)?;
        }
        Mnemonic::Shl | Mnemonic::Sal | Mnemonic::Shr | Mnemonic::Sar => {
            let size = cpu.size_of(insn, 0)?;
            let a = cpu.read(mem, insn, 0)?;
            let count = cpu.read(mem, insn, 1)?;
            let result = shift(mnemonic, a, count, size, &mut cpu.flags).ok_or_else(|| unsupported(insn, "shift"))?;
            cpu.write(mem, insn, 0, result)?;
        }
        Mnemonic::Imul if insn.op_count() >= 2 => {
            let size = cpu.size_of(insn, 0)?;
            let (a, b) = if insn.op_count() == 3 {
                (cpu.read(mem, insn, 1)?, cpu.read(mem, insn, 2)?)
            } else {
                (cpu.read(mem, insn, 0)?, cpu.read(mem, insn, 1)?)
            };
            let product = i128::from(sign_extend(a, size)) * i128::from(sign_extend(b, size));
            let result = product as u64 & mask(size);
            let overflow = i128::from(sign_extend(result, size)) != product;
            cpu.flags.cf = overflow;
            cpu.flags.of = overflow;
            cpu.flags.result(result, size);
            cpu.write(mem, insn, 0, result)?;
        }
        Mnemonic::Imul | Mnemonic::Mul => {
            let size = cpu.size_of(insn, 0)?;
            let src = cpu.read(mem, insn, 0)?;
            wide_multiply(cpu, insn, src, size, mnemonic == Mnemonic::Imul)?;
        }
        Mnemonic::Div | Mnemonic::Idiv => {
            let size = cpu.size_of(insn, 0)?;
            let divisor = cpu.read(mem, insn, 0)?;
            return divide(cpu, insn, divisor, size, mnemonic == Mnemonic::Idiv);
        }
        Mnemonic::Cdq => {
            let high = if sign(cpu.regs[0], 4) { mask(4) } else { 0 };
            cpu.write_reg(Register::EDX, high);
        }
        Mnemonic::Cqo => {
            let high = if sign(cpu.regs[0], 8) { u64::MAX } else { 0 };
            cpu.regs[2] = high;
        }
        Mnemonic::Cdqe => cpu.regs[0] = sign_extend(cpu.regs[0], 4) as u64,
        Mnemonic::Cwde => {
            let value = sign_extend(cpu.regs[0], 2) as u64;
            cpu.write_reg(Register::EAX, value);
        }
        Mnemonic::Cmpxchg => {
            let size = cpu.size_of(insn, 0)?;
            let acc = match size {
                1 => Register::AL,
                2 => Register::AX,
                4 => Register::EAX,
                _ => Register::RAX,
            };
            let expected = cpu.read_reg(acc).unwrap_or_default();
            let current = cpu.read(mem, insn, 0)?;
            alu(Alu::Sub, expected, current, size, &mut cpu.flags);
            if cpu.flags.zf {
                let value = cpu.read(mem, insn, 1)?;
                cpu.write(mem, insn, 0, value)?;
            } else {
                cpu.write_reg(acc, current);
            }
        }
        Mnemonic::Push => {
            let value = cpu.read(mem, insn, 0)?;
            cpu.push(mem, value);
        }
        Mnemonic::Pop => {
            let value = cpu.pop(mem);
            cpu.write(mem, insn, 0, value)?;
        }
        Mnemonic::Pushfq => {
            let bits = cpu.flags.to_bits();
            cpu.push(mem, bits);
        }
        Mnemonic::Popfq => {
            let bits = cpu.pop(mem);
            cpu.flags = Flags::from_bits(bits);
        }
        Mnemonic::Leave => {
            cpu.regs[RSP] = cpu.regs[RBP];
            cpu.regs[RBP] = cpu.pop(mem);
        }
        Mnemonic::Ret => {
            let target = cpu.pop(mem);
            if insn.op_count() == 1 {
                cpu.regs[RSP] = cpu.regs[RSP].wrapping_add(insn.immediate(0));
            }
            return Ok(Effect::Return(target));
        }
        Mnemonic::Ud2 | Mnemonic::Int3 => return Ok(Effect::Trap),
        _ => return Err(unsupported(insn, "mnemonic")),
    }
    Ok(Effect::Next)
}

/// Flat memory for straight-line evaluation.
#[derive(Debug, Clone, Default)]
pub struct ScratchMemory {
    bytes: std::collections::HashMap<u64, u8>,
}

impl Memory for ScratchMemory {
    fn read(&mut self, addr: u64, size: usize) -> u64 {
        (0..size).fold(0, |acc, i| {
            let byte = self.bytes.get(&addr.wrapping_add(i as u64)).copied().unwrap_or(0);
            acc | u64::from(byte) << (8 * i)
        })
    }

    fn write(&mut self, addr: u64, size: usize, value: u64) {
        for i in 0..size {
            self.bytes.insert(addr.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, MemoryOperand};
    use shroud_core::insn;

    fn run(cpu: &mut Cpu, code: &[Instruction]) {
        let mut mem = ScratchMemory::default();
        for insn in code {
            assert_eq!(execute(cpu, &mut mem, insn).unwrap(), Effect::Next, "{insn:?}");
        }
    }

    fn rr(code: Code, a: Register, b: Register) -> Instruction {
        Instruction::with2(code, a, b).unwrap()
    }

    fn ri(code: Code, a: Register, imm: i32) -> Instruction {
        Instruction::with2(code, a, imm).unwrap()
    }

    #[test]
    fn sub_sets_borrow_and_overflow() {
        let mut cpu = Cpu::default();
        cpu.write_reg(Register::EAX, 0x8000_0000);
        run(&mut cpu, &[ri(Code::Sub_rm32_imm8, Register::EAX, 1)]);
        assert_eq!(cpu.regs[0], 0x7fff_ffff);
        assert!(cpu.flags.of);
        assert!(!cpu.flags.cf);
        assert!(cpu.flags.holds(ConditionCode::l));

        run(&mut cpu, &[ri(Code::Cmp_rm32_imm8, Register::EAX, -1)]);
        assert!(cpu.flags.cf);
        assert!(!cpu.flags.zf);
    }

    #[test]
    fn thirty_two_bit_writes_zero_extend() {
        let mut cpu = Cpu::default();
        cpu.regs[0] = u64::MAX;
        run(&mut cpu, &[ri(Code::Add_rm32_imm8, Register::EAX, 1)]);
        assert_eq!(cpu.regs[0], 0);
        assert!(cpu.flags.zf && cpu.flags.cf);

        cpu.regs[1] = u64::MAX;
        run(&mut cpu, &[rr(Code::Mov_r8_rm8, Register::CL, Register::AL)]);
        assert_eq!(cpu.regs[1], 0xffff_ffff_ffff_ff00);
    }

    #[test]
    fn flags_survive_pushfq_round_trip() {
        let mut cpu = Cpu::default();
        cpu.regs[RSP] = 0x1000;
        let mut mem = ScratchMemory::default();
        cpu.flags = Flags {
            cf: true,
            zf: true,
            of: true,
            ..Flags::default()
        };
        let saved = cpu.flags;
        for insn in [insn::pushfq(), rr(Code::Xor_r32_rm32, Register::EAX, Register::EAX), insn::popfq()] {
            execute(&mut cpu, &mut mem, &insn).unwrap();
        }
        assert_eq!(cpu.flags, saved);
        assert_eq!(cpu.regs[RSP], 0x1000);
    }

    #[test]
    fn conditional_moves_and_sets_follow_flags() {
        let mut cpu = Cpu::default();
        cpu.regs[0] = 1;
        cpu.regs[3] = 2;
        cpu.regs[1] = 0xffff_ffff_0000_0007;
        cpu.regs[2] = 9;
        run(
            &mut cpu,
            &[
                rr(Code::Cmp_r32_rm32, Register::EAX, Register::EBX),
                rr(Code::Cmovl_r32_rm32, Register::ECX, Register::EDX),
                Instruction::with1(Code::Setl_rm8, Register::AL).unwrap(),
            ],
        );
        assert_eq!(cpu.regs[1], 9);
        assert_eq!(cpu.regs[0], 1);

        cpu.regs[1] = 0xffff_ffff_0000_0007;
        run(
            &mut cpu,
            &[
                rr(Code::Cmovg_r32_rm32, Register::ECX, Register::EDX),
                Instruction::with1(Code::Setg_rm8, Register::AL).unwrap(),
            ],
        );
        assert_eq!(cpu.regs[1], 7);
        assert_eq!(cpu.regs[0], 0);
    }

    #[test]
    fn red_zone_lea_moves_the_stack() {
        let mut cpu = Cpu::default();
        cpu.regs[RSP] = 0x1000;
        run(&mut cpu, &[insn::red_zone_enter().unwrap(), insn::push(Register::RBX).unwrap()]);
        assert_eq!(cpu.regs[RSP], 0x1000 - 128 - 8);
    }

    #[test]
    fn cmpxchg_takes_a_free_byte() {
        let mut cpu = Cpu::default();
        let mut mem = ScratchMemory::default();
        cpu.regs[3] = 0x2000;
        cpu.write_reg(Register::CL, 1);
        let mut take = Instruction::with2(Code::Cmpxchg_rm8_r8, MemoryOperand::with_base(Register::RBX), Register::CL).unwrap();
        take.set_has_lock_prefix(true);
        execute(&mut cpu, &mut mem, &take).unwrap();
        assert!(cpu.flags.zf);
        assert_eq!(mem.read(0x2000, 1), 1);
        execute(&mut cpu, &mut mem, &take).unwrap();
        assert!(!cpu.flags.zf);
        assert_eq!(cpu.read_reg(Register::AL), Some(1));
    }

    #[test]
    fn division_by_zero_faults() {
        let mut cpu = Cpu::default();
        let mut mem = ScratchMemory::default();
        let div = Instruction::with1(Code::Div_rm32, Register::ECX).unwrap();
        assert!(matches!(execute(&mut cpu, &mut mem, &div).unwrap(), Effect::Fault(_)));
        cpu.regs[0] = 7;
        cpu.regs[1] = 2;
        execute(&mut cpu, &mut mem, &div).unwrap();
        assert_eq!((cpu.regs[0], cpu.regs[2]), (3, 1));
    }

    #[test]
    fn vector_code_is_unsupported() {
        let mut cpu = Cpu::default();
        let mut mem = ScratchMemory::default();
        let pxor = Instruction::with2(Code::Pxor_xmm_xmmm128, Register::XMM0, Register::XMM0).unwrap();
        assert!(execute(&mut cpu, &mut mem, &pxor).is_err());
    }
}
