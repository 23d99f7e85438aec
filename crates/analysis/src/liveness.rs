//! Backward liveness of the arithmetic status flags.
//!
//! A pass may only clobber flags where this analysis says nothing reads them
//! before the next write. Calls and function exits end all flag lifetimes
//! (the System V ABI does not preserve them); indirect jumps are treated as
//! reading everything.

use iced_x86::{FlowControl, RflagsBits};
use shroud_core::cfg_ir::{Function, Instruction, Terminator};

/// `OF | SF | ZF | AF | CF | PF`.
pub const STATUS_FLAGS: u32 =
    RflagsBits::OF | RflagsBits::SF | RflagsBits::ZF | RflagsBits::AF | RflagsBits::CF | RflagsBits::PF;

/// Per-block flag liveness of one function, indexed by `BlockId.0`.
#[derive(Debug, Clone)]
pub struct FlagsLiveness {
    live_in: Vec<u32>,
    live_out: Vec<u32>,
}

impl FlagsLiveness {
    /// Solves liveness for every block of `function`.
    pub fn compute(function: &Function) -> Self {
        let count = function.blocks.len();
        let mut live_in = vec![0u32; count];
        let mut live_out = vec![0u32; count];
        let mut order = function.reverse_postorder();
        order.reverse();
        let mut changed = true;
        while changed {
            changed = false;
            for id in &order {
                let block = function.block(*id);
                let out = match &block.terminator {
                    Terminator::Indirect(_) => STATUS_FLAGS,
                    terminator => terminator
                        .successors()
                        .iter()
                        .fold(0, |acc, succ| acc | live_in[succ.0]),
                };
                let mut live = terminator_transfer(&block.terminator, out);
                for instr in block.instructions.iter().rev() {
                    live = transfer(instr, live);
                }
                if out != live_out[id.0] || live != live_in[id.0] {
                    live_out[id.0] = out;
                    live_in[id.0] = live;
                    changed = true;
                }
            }
        }
        Self { live_in, live_out }
    }

    /// Status flags live at the start of `block`.
    pub fn live_in(&self, block: usize) -> u32 {
        self.live_in.get(block).copied().unwrap_or(STATUS_FLAGS)
    }

    /// Status flags live at the end of `block`'s instructions, before its terminator.
    pub fn live_out(&self, block: usize) -> u32 {
        self.live_out.get(block).copied().unwrap_or(STATUS_FLAGS)
    }

    /// Flags live right after each instruction of `block`.
    pub fn live_after(&self, function: &Function, block: usize) -> Vec<u32> {
        let b = &function.blocks[block];
        let mut live = terminator_transfer(&b.terminator, self.live_out(block));
        let mut after = vec![0; b.instructions.len()];
        for (index, instr) in b.instructions.iter().enumerate().rev() {
            after[index] = live;
            live = transfer(instr, live);
        }
        after
    }
}

/// Live flags before `instr`, given those live after it.
pub fn transfer(instr: &Instruction, live_after: u32) -> u32 {
    let insn = instr.insn();
    if matches!(
        insn.flow_control(),
        FlowControl::Call | FlowControl::IndirectCall
    ) {
        return 0;
    }
    let killed = insn.rflags_modified() & STATUS_FLAGS;
    (live_after & !killed) | (insn.rflags_read() & STATUS_FLAGS)
}

fn terminator_transfer(terminator: &Terminator, out: u32) -> u32 {
    match terminator {
        Terminator::Branch { condition, .. } => {
            let reads = iced_x86::Instruction::with_branch(*condition, 0)
                .map_or(STATUS_FLAGS, |i| i.rflags_read());
            out | (reads & STATUS_FLAGS)
        }
        Terminator::Jump(_) => out,
        Terminator::Indirect(instr) => transfer(instr, STATUS_FLAGS),
        Terminator::Return(_) | Terminator::TailJump(_) | Terminator::Trap(_) | Terminator::Unreachable => 0,
    }
}
