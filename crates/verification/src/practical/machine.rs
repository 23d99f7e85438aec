//! Emulator over a linked [`Image`].
//!
//! A function runs on a private stack with a sentinel return address. Calls
//! into the image are followed; calls to undefined symbols are recorded with
//! their arguments and return zero. What a caller could observe afterwards is
//! captured in an [`Observation`] whose values are independent of layout:
//! stack addresses become frame offsets, code addresses become functions and
//! data addresses become the bytes they point at.

use crate::semantics::{self, Cpu, Effect, Memory, RSP};
use iced_x86::{Decoder, DecoderOptions, Instruction};
use serde::Serialize;
use shroud_core::image::Image;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Address just above the caller's frame.
pub const STACK_TOP: u64 = 0x7fff_ffff_0000;
const STACK_SIZE: u64 = 0x10_0000;
const RETURN_SENTINEL: u64 = 0xdead_beef_0000;

/// `rdi, rsi, rdx, rcx, r8, r9`.
pub const ARGUMENT_REGS: [usize; 6] = [7, 6, 2, 1, 8, 9];
const CALLEE_SAVED: [usize; 6] = [3, 5, 12, 13, 14, 15];
const CALLER_SAVED: [usize; 9] = [0, 1, 2, 6, 7, 8, 9, 10, 11];

/// Longest string compared through a data pointer.
const TEXT_LIMIT: u64 = 64;

/// Externals that never return to their caller.
const NO_RETURN: [&str; 8] = [
    "exit",
    "_exit",
    "_Exit",
    "abort",
    "__stack_chk_fail",
    "__assert_fail",
    "longjmp",
    "pthread_exit",
];

/// A register or memory value, normalized so both images agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Number(u64),
    /// Offset from [`STACK_TOP`].
    Stack(i64),
    /// NUL-terminated bytes behind a data pointer.
    Text(String),
    /// Index of the function a code pointer falls into.
    Function(usize),
    External(String),
}

/// Where an observed write landed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Location {
    Stack(i64),
    Segment { name: String, offset: u64 },
    Absolute(u64),
}

/// A call to an undefined symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalCall {
    /// Symbol name of the callee.
    pub name: String,
    /// Integer argument registers at the call.
    pub args: Vec<Value>,
}

/// What the caller can see once the function is done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    /// Return value.
    pub rax: Value,
    /// Second return register.
    pub rdx: Value,
    /// `rbx`, `rbp`, `r12`..`r15` in that order.
    pub callee_saved: Vec<Value>,
    /// Stack pointer after return.
    pub rsp: Value,
    /// Bytes stored outside the function's own stack frame.
    pub writes: BTreeMap<Location, u8>,
    /// External calls in order.
    pub calls: Vec<ExternalCall>,
}

/// How an emulated run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Returned(Box<Observation>),
    /// Stopped in an external that does not return.
    Exited(Box<Observation>),
    Trap,
    Fault(String),
    Unsupported(String),
    StepLimit,
}

/// One emulated run.
#[derive(Debug, Clone)]
pub struct Execution {
    /// How it ended.
    pub outcome: Outcome,
    /// Instructions executed.
    pub steps: u64,
}

/// Sparse writable memory over the image bytes.
struct ImageMemory<'a> {
    image: &'a Image,
    overlay: HashMap<u64, u8>,
    written: BTreeSet<u64>,
}

impl<'a> ImageMemory<'a> {
    fn new(image: &'a Image) -> Self {
        Self {
            image,
            overlay: HashMap::new(),
            written: BTreeSet::new(),
        }
    }

    fn byte(&self, addr: u64) -> u8 {
        if let Some(byte) = self.overlay.get(&addr) {
            return *byte;
        }
        self.image
            .segment_at(addr)
            .and_then(|s| s.bytes.get((addr - s.base) as usize))
            .copied()
            .unwrap_or(0)
    }
}

impl Memory for ImageMemory<'_> {
    fn read(&mut self, addr: u64, size: usize) -> u64 {
        (0..size).fold(0, |acc, i| {
            acc | u64::from(self.byte(addr.wrapping_add(i as u64))) << (8 * i)
        })
    }

    fn write(&mut self, addr: u64, size: usize, value: u64) {
        for i in 0..size {
            let at = addr.wrapping_add(i as u64);
            self.overlay.insert(at, (value >> (8 * i)) as u8);
            self.written.insert(at);
        }
    }
}

const fn stack_offset(addr: u64) -> Option<i64> {
    if addr >= STACK_TOP - STACK_SIZE && addr < STACK_TOP + STACK_SIZE {
        Some(addr as i64 - STACK_TOP as i64)
    } else {
        None
    }
}

/// Runs functions of one image.
pub struct Machine<'a> {
    image: &'a Image,
    decoded: HashMap<u64, Instruction>,
}

impl<'a> Machine<'a> {
    /// A machine over `image` with empty state.
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            decoded: HashMap::new(),
        }
    }

    fn fetch(&mut self, rip: u64) -> Result<Instruction, String> {
        if let Some(insn) = self.decoded.get(&rip) {
            return Ok(*insn);
        }
        let segment = self
            .image
            .segment_at(rip)
            .filter(|s| s.code)
            .ok_or_else(|| format!("execution left code at {rip:#x}"))?;
        let bytes = &segment.bytes[(rip - segment.base) as usize..];
        let mut decoder = Decoder::with_ip(64, bytes, rip, DecoderOptions::NONE);
        let insn = decoder.decode();
        if insn.is_invalid() {
            return Err(format!("invalid instruction at {rip:#x}"));
        }
        self.decoded.insert(rip, insn);
        Ok(insn)
    }

    /// Runs the function at `entry` with `args` in the argument registers.
    pub fn run(&mut self, entry: u64, args: &[u64], step_limit: u64) -> Execution {
        let mut cpu = Cpu::default();
        let mut memory = ImageMemory::new(self.image);
        for (slot, value) in ARGUMENT_REGS.iter().zip(args) {
            cpu.regs[*slot] = *value;
        }
        cpu.regs[RSP] = STACK_TOP - 8;
        memory.write(STACK_TOP - 8, 8, RETURN_SENTINEL);
        memory.written.clear();
        cpu.rip = entry;

        let mut calls = Vec::new();
        let mut steps = 0;
        let outcome = loop {
            if cpu.rip == RETURN_SENTINEL {
                break Outcome::Returned(Box::new(self.observe(&cpu, &memory, calls)));
            }
            if steps >= step_limit {
                break Outcome::StepLimit;
            }
            steps += 1;
            let insn = match self.fetch(cpu.rip) {
                Ok(insn) => insn,
                Err(reason) => break Outcome::Fault(reason),
            };
            cpu.rip = insn.next_ip();
            let effect = match semantics::execute(&mut cpu, &mut memory, &insn) {
                Ok(effect) => effect,
                Err(e) => break Outcome::Unsupported(e.0),
            };
            match effect {
                Effect::Next => {}
                Effect::Return(target) => cpu.rip = target,
                Effect::Trap => break Outcome::Trap,
                Effect::Fault(reason) => break Outcome::Fault(reason),
                Effect::Call { target, ret } => match self.image.external_at(target) {
                    Some(name) => {
                        calls.push(self.external(name, &mut cpu, &memory));
                        if NO_RETURN.contains(&name) {
                            break Outcome::Exited(Box::new(self.observe(&cpu, &memory, calls)));
                        }
                        cpu.rip = ret;
                    }
                    None => {
                        cpu.push(&mut memory, ret);
                        cpu.rip = target;
                    }
                },
                // A jump to an external is a tail call: it returns to our caller.
                Effect::Jump(target) => match self.image.external_at(target) {
                    Some(name) => {
                        calls.push(self.external(name, &mut cpu, &memory));
                        if NO_RETURN.contains(&name) {
                            break Outcome::Exited(Box::new(self.observe(&cpu, &memory, calls)));
                        }
                        cpu.rip = cpu.pop(&mut memory);
                    }
                    None => cpu.rip = target,
                },
            }
        };
        Execution { outcome, steps }
    }

    fn external(&self, name: &str, cpu: &mut Cpu, memory: &ImageMemory<'_>) -> ExternalCall {
        let args = ARGUMENT_REGS
            .iter()
            .map(|slot| self.value(cpu.regs[*slot], memory))
            .collect();
        for slot in CALLER_SAVED {
            cpu.regs[slot] = 0;
        }
        ExternalCall {
            name: name.to_string(),
            args,
        }
    }

    fn value(&self, raw: u64, memory: &ImageMemory<'_>) -> Value {
        if let Some(offset) = stack_offset(raw) {
            return Value::Stack(offset);
        }
        if let Some(name) = self.image.external_at(raw) {
            return Value::External(name.to_string());
        }
        match self.image.segment_at(raw) {
            Some(segment) if segment.code => self
                .image
                .function_containing(raw)
                .map_or(Value::Number(raw), |f| Value::Function(f.0)),
            Some(segment) if segment.section.is_some() => {
                let bytes: Vec<u8> = (raw..raw.saturating_add(TEXT_LIMIT))
                    .map(|addr| memory.byte(addr))
                    .take_while(|byte| *byte != 0)
                    .collect();
                Value::Text(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Value::Number(raw),
        }
    }

    fn location(&self, addr: u64) -> Option<Location> {
        if let Some(offset) = stack_offset(addr) {
            // Below the return address is the callee's own scratch stack.
            return (offset >= 0).then_some(Location::Stack(offset));
        }
        match self.image.segment_at(addr) {
            Some(segment) if segment.synthesized => None,
            Some(segment) => Some(Location::Segment {
                name: segment.name.clone(),
                offset: addr - segment.base,
            }),
            None => Some(Location::Absolute(addr)),
        }
    }

    fn observe(&self, cpu: &Cpu, memory: &ImageMemory<'_>, calls: Vec<ExternalCall>) -> Observation {
        let writes = memory
            .written
            .iter()
            .filter_map(|addr| Some((self.location(*addr)?, memory.byte(*addr))))
            .collect();
        Observation {
            rax: self.value(cpu.regs[0], memory),
            rdx: self.value(cpu.regs[2], memory),
            callee_saved: CALLEE_SAVED
                .iter()
                .map(|slot| self.value(cpu.regs[*slot], memory))
                .collect(),
            rsp: self.value(cpu.regs[RSP], memory),
            writes,
            calls,
        }
    }
}
