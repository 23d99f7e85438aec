//! Per-function control-flow IR.
//!
//! A [`Function`] owns an arena of [`Block`]s indexed by [`BlockId`] plus a
//! separate emission `layout`. Blocks never move inside the arena, so ids stay
//! valid across passes; a pass that abandons a block simply stops referencing
//! it. Every block ends in exactly one [`Terminator`], which only names blocks
//! of the same function. Control leaving the function goes through a
//! relocation or an original code offset carried by an [`Instruction`].

use crate::module::{FunctionId, SectionId, SymbolId};
use bitvec::prelude::*;
use iced_x86::{Code, Encoder, IcedError};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a [`Block`] inside [`Function::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// PC-relative reference that carries no relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Start of a block in the same function.
    Block(BlockId),
    /// An instruction of the same section, by its offset in the input.
    Code(u64),
    /// Entry of another function in the same section.
    Function(FunctionId),
}

/// Which operand field of an instruction a relocation patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelocField {
    Displacement,
    Immediate,
    /// The rel32 of a near `call`/`jmp`/`jcc`; always the last four bytes.
    Branch,
}

/// Relocation attached to one instruction field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrReloc {
    /// Symbol the field refers to.
    pub symbol: SymbolId,
    /// ELF relocation type, e.g. `R_X86_64_PLT32`.
    pub r_type: u32,
    /// For PC-relative types this is the offset from the symbol to the
    /// referenced address, independent of the instruction's length. The
    /// emitter subtracts the bytes trailing the field when writing the ELF
    /// addend.
    pub addend: i64,
    /// Which operand field the relocation patches.
    pub field: RelocField,
    /// Whether the addend has been normalized against the field end.
    pub pc_relative: bool,
}

/// One machine instruction with its provenance.
#[derive(Debug, Clone)]
pub struct Instruction {
    insn: iced_x86::Instruction,
    raw: Option<Vec<u8>>,
    raw_field: Option<u8>,
    /// Non-relocated PC-relative reference (branch target or RIP memory operand).
    pub target: Option<Target>,
    /// Relocation attached to one of the operand fields.
    pub reloc: Option<InstrReloc>,
    /// Offset of this instruction in its input section, if it came from the input.
    pub origin: Option<u64>,
}

impl Instruction {
    /// Wraps a freshly built instruction.
    pub const fn new(insn: iced_x86::Instruction) -> Self {
        Self {
            insn,
            raw: None,
            raw_field: None,
            target: None,
            reloc: None,
            origin: None,
        }
    }

    /// Wraps a decoded instruction together with its input encoding.
    pub fn decoded(insn: iced_x86::Instruction, bytes: &[u8], origin: u64) -> Self {
        Self {
            insn,
            raw: Some(bytes.to_vec()),
            raw_field: None,
            target: None,
            reloc: None,
            origin: Some(origin),
        }
    }

    /// Replaces the branch target.
    pub const fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    /// Attaches a relocation to the instruction.
    pub fn with_reloc(mut self, reloc: InstrReloc) -> Self {
        self.reloc = Some(reloc);
        self
    }

    /// Records where a relocated field sits inside the input encoding.
    pub fn with_raw_field(mut self, offset: u8) -> Self {
        self.raw_field = Some(offset);
        self
    }

    /// Records the input offset this instruction was decoded from.
    pub const fn with_origin(mut self, origin: Option<u64>) -> Self {
        self.origin = origin;
        self
    }

    /// The underlying iced instruction.
    pub const fn insn(&self) -> &iced_x86::Instruction {
        &self.insn
    }

    /// Replaces the instruction. The input encoding is discarded.
    pub fn set_insn(&mut self, insn: iced_x86::Instruction) {
        self.insn = insn;
        self.raw = None;
        self.raw_field = None;
    }

    /// Input encoding, usable verbatim when no code target must be re-resolved.
    pub fn reusable_bytes(&self) -> Option<&[u8]> {
        match self.target {
            None => self.raw.as_deref(),
            Some(_) => None,
        }
    }

    /// Byte offset of the relocated field within the encoding, when known.
    pub const fn raw_field_offset(&self) -> Option<u8> {
        self.raw_field
    }

    /// iced opcode code.
    pub fn code(&self) -> Code {
        self.insn.code()
    }

    /// iced mnemonic.
    pub fn mnemonic(&self) -> iced_x86::Mnemonic {
        self.insn.mnemonic()
    }

    /// First byte of the instruction's encoding, as a breakpoint check reads it.
    pub fn first_byte(&self) -> Result<u8, IcedError> {
        if let Some(byte) = self.raw.as_ref().and_then(|raw| raw.first()) {
            return Ok(*byte);
        }
        let mut encoder = Encoder::new(64);
        let mut insn = self.insn;
        if insn.is_ip_rel_memory_operand() {
            insn.set_memory_displacement64(0);
        }
        encoder.encode(&insn, 0)?;
        Ok(encoder.take_buffer().first().copied().unwrap_or(0))
    }
}

/// How control leaves a block.
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Unconditional edge; emitted as nothing when the target follows in layout.
    Jump(BlockId),
    /// Two-way branch. `condition` is any short or near `jcc`, `loop*` or `j*cxz` code.
    Branch {
        condition: Code,
        taken: BlockId,
        fallthrough: BlockId,
    },
    Return(Instruction),
    /// Direct jump leaving the function.
    TailJump(Instruction),
    /// `jmp reg`/`jmp [mem]`.
    Indirect(Instruction),
    /// `ud2`, `hlt` and friends.
    Trap(Instruction),
    /// Control never reaches the end of the block (e.g. after a no-return call).
    Unreachable,
}

impl Terminator {
    /// In-function successors; the taken edge comes first for branches.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Jump(target) => vec![*target],
            Self::Branch {
                taken, fallthrough, ..
            } => vec![*taken, *fallthrough],
            _ => Vec::new(),
        }
    }

    /// Redirects every edge to `from` onto `to`. Returns whether anything changed.
    pub fn retarget(&mut self, from: BlockId, to: BlockId) -> bool {
        let mut changed = false;
        match self {
            Self::Jump(target) if *target == from => {
                *target = to;
                changed = true;
            }
            Self::Branch {
                taken, fallthrough, ..
            } => {
                if *taken == from {
                    *taken = to;
                    changed = true;
                }
                if *fallthrough == from {
                    *fallthrough = to;
                    changed = true;
                }
            }
            _ => {}
        }
        changed
    }

    /// The instruction carried by the terminator, if any.
    pub const fn instruction(&self) -> Option<&Instruction> {
        match self {
            Self::Return(i) | Self::TailJump(i) | Self::Indirect(i) | Self::Trap(i) => Some(i),
            _ => None,
        }
    }

    /// Mutable access to the instruction carried by the terminator.
    pub fn instruction_mut(&mut self) -> Option<&mut Instruction> {
        match self {
            Self::Return(i) | Self::TailJump(i) | Self::Indirect(i) | Self::Trap(i) => Some(i),
            _ => None,
        }
    }

    /// Whether control may leave the function here.
    pub const fn exits(&self) -> bool {
        matches!(
            self,
            Self::Return(_) | Self::TailJump(_) | Self::Indirect(_) | Self::Trap(_)
        )
    }
}

/// Provenance of a block, used by passes and the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Lifted from the input.
    Original,
    /// Synthesized jump for a conditional branch leaving the function.
    Tail,
    /// Evaluates an opaque predicate.
    Guard,
    /// Never executed; only reachable through a proven guard edge.
    Dead,
    /// Flattening state setters, dispatcher and trampolines.
    Dispatch,
    /// Anti-debug checks and their trap.
    Check,
    /// Body of a synthesized helper function.
    Stub,
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Index into [`Function::blocks`].
    pub id: BlockId,
    /// Straight-line body, without the terminator.
    pub instructions: Vec<Instruction>,
    /// How control leaves the block.
    pub terminator: Terminator,
    /// Provenance.
    pub kind: BlockKind,
    /// Offset of the first instruction in the input.
    pub origin: Option<u64>,
    /// Referenced by address from data or code; an extra CFG root.
    pub address_taken: bool,
}

/// Identity a context-dependent opaque predicate relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Invariant {
    /// `x * (x + 1)` is even.
    ProductParity,
    /// `x * x mod 4` is never 2.
    SquareResidue,
}

/// Tagged predicate kinds inserted by bogus control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateKind {
    /// Constant comparison that always holds; the dead edge is taken on inequality.
    AlwaysTrue,
    /// Constant comparison that never holds; the dead edge is taken on equality.
    AlwaysFalse,
    /// Depends on a live register but is fixed by an arithmetic identity.
    Invariant(Invariant),
}

/// A guard block whose `taken` edge leads to `dead` and is claimed never taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueGuard {
    /// Block evaluating the predicate.
    pub guard: BlockId,
    /// Successor taken at runtime.
    pub real: BlockId,
    /// Block on the edge claimed never taken.
    pub dead: BlockId,
    /// Identity the predicate relies on.
    pub kind: PredicateKind,
}

/// Kind of a CFG edge in [`CfgGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Unconditional jump.
    Jump,
    /// Conditional branch taken.
    Taken,
    /// Conditional branch not taken.
    Fallthrough,
}

/// A petgraph view of one function's blocks.
#[derive(Debug, Clone)]
pub struct CfgGraph {
    /// Nodes carry block ids.
    pub graph: DiGraph<BlockId, EdgeKind>,
    /// Node of each block, indexed by `BlockId.0`.
    pub nodes: Vec<NodeIndex>,
}

/// A function lifted from (or added to) an executable section.
#[derive(Debug, Clone)]
pub struct Function {
    /// Symbol name of the function.
    pub name: String,
    /// Defining symbol.
    pub symbol: SymbolId,
    /// Further symbols naming the same range.
    pub aliases: Vec<SymbolId>,
    /// Code section the function lives in.
    pub section: SectionId,
    /// Offset and size in the input section; zero for synthesized functions.
    pub offset: u64,
    /// Byte length in the input section.
    pub size: u64,
    /// Required alignment of the function start.
    pub align: u64,
    /// Block arena, indexed by `BlockId.0`.
    pub blocks: Vec<Block>,
    /// Emission order. Starts with `entry`.
    pub layout: Vec<BlockId>,
    /// First block executed.
    pub entry: BlockId,
    /// Opaque guards inserted by bogus control flow.
    pub guards: Vec<OpaqueGuard>,
    /// Contains a `jmp reg` or `jmp [mem]`.
    pub has_indirect_branch: bool,
    /// Created by a pass rather than lifted.
    pub synthesized: bool,
}

impl Function {
    /// An empty synthesized function; the caller adds blocks and sets `entry`.
    pub fn synthesized(name: impl Into<String>, symbol: SymbolId, section: SectionId, align: u64) -> Self {
        Self {
            name: name.into(),
            symbol,
            aliases: Vec::new(),
            section,
            offset: 0,
            size: 0,
            align,
            blocks: Vec::new(),
            layout: Vec::new(),
            entry: BlockId(0),
            guards: Vec::new(),
            has_indirect_branch: false,
            synthesized: true,
        }
    }

    /// The block with id `id`.
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    /// Mutable access to block `id`.
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    /// Appends a block to the arena. It is not placed in the layout.
    pub fn add_block(
        &mut self,
        instructions: Vec<Instruction>,
        terminator: Terminator,
        kind: BlockKind,
    ) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block {
            id,
            instructions,
            terminator,
            kind,
            origin: None,
            address_taken: false,
        });
        id
    }

    /// Places `block` right before `before` in the layout, or at the end when
    /// `before` is not laid out.
    pub fn place_before(&mut self, block: BlockId, before: BlockId) {
        match self.layout.iter().position(|b| *b == before) {
            Some(pos) => self.layout.insert(pos, block),
            None => self.layout.push(block),
        }
    }

    /// Successors of `id` per its terminator.
    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks[id.0].terminator.successors()
    }

    /// Predecessor lists indexed by `BlockId.0`, over every block in the arena.
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in &self.blocks {
            for succ in block.terminator.successors() {
                if !preds[succ.0].contains(&block.id) {
                    preds[succ.0].push(block.id);
                }
            }
        }
        preds
    }

    /// Redirects all edges into `from` onto `to`, skipping blocks in `except`.
    /// The entry moves too when `from` was the entry.
    pub fn redirect(&mut self, from: BlockId, to: BlockId, except: &[BlockId]) {
        for block in &mut self.blocks {
            if except.contains(&block.id) {
                continue;
            }
            block.terminator.retarget(from, to);
        }
        if self.entry == from {
            self.entry = to;
        }
    }

    /// Blocks reachable from the entry and from address-taken blocks.
    pub fn reachable(&self) -> BitVec {
        self.reachable_without(&[])
    }

    /// Reachability with some edges removed.
    pub fn reachable_without(&self, removed: &[(BlockId, BlockId)]) -> BitVec {
        let mut seen = bitvec![0; self.blocks.len()];
        let mut stack: Vec<BlockId> = vec![self.entry];
        stack.extend(
            self.blocks
                .iter()
                .filter(|b| b.address_taken)
                .map(|b| b.id),
        );
        while let Some(id) = stack.pop() {
            if id.0 >= self.blocks.len() || seen[id.0] {
                continue;
            }
            seen.set(id.0, true);
            for succ in self.successors(id) {
                if !removed.contains(&(id, succ)) {
                    stack.push(succ);
                }
            }
        }
        seen
    }

    /// Blocks in depth-first reverse postorder from the entry.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = bitvec![0; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut roots = vec![self.entry];
        roots.extend(self.blocks.iter().filter(|b| b.address_taken).map(|b| b.id));
        for root in roots {
            if visited[root.0] {
                continue;
            }
            let mut stack = vec![(root, 0usize)];
            visited.set(root.0, true);
            while let Some((id, next)) = stack.pop() {
                let succs = self.successors(id);
                if next < succs.len() {
                    stack.push((id, next + 1));
                    let succ = succs[next];
                    if !visited[succ.0] {
                        visited.set(succ.0, true);
                        stack.push((succ, 0));
                    }
                } else {
                    order.push(id);
                }
            }
        }
        order.reverse();
        order
    }

    /// Instructions in laid-out blocks, counting terminators as one each.
    pub fn instruction_count(&self) -> usize {
        self.layout
            .iter()
            .map(|id| {
                let block = &self.blocks[id.0];
                let term = match block.terminator {
                    Terminator::Unreachable => 0,
                    _ => 1,
                };
                block.instructions.len() + term
            })
            .sum()
    }

    /// Builds a petgraph over the reachable blocks.
    pub fn to_graph(&self) -> CfgGraph {
        let reachable = self.reachable();
        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = self.blocks.iter().map(|b| graph.add_node(b.id)).collect();
        for block in &self.blocks {
            if !reachable[block.id.0] {
                continue;
            }
            match &block.terminator {
                Terminator::Jump(target) => {
                    graph.add_edge(nodes[block.id.0], nodes[target.0], EdgeKind::Jump);
                }
                Terminator::Branch {
                    taken, fallthrough, ..
                } => {
                    graph.add_edge(nodes[block.id.0], nodes[taken.0], EdgeKind::Taken);
                    graph.add_edge(
                        nodes[block.id.0],
                        nodes[fallthrough.0],
                        EdgeKind::Fallthrough,
                    );
                }
                _ => {}
            }
        }
        CfgGraph { graph, nodes }
    }

    /// Guard whose dead edge is `(from, to)`, if any.
    pub fn guard_edge(&self, from: BlockId, to: BlockId) -> Option<&OpaqueGuard> {
        self.guards.iter().find(|g| g.guard == from && g.dead == to)
    }

    /// Checks the structural invariants every pass must leave intact.
    pub fn validate(&self) -> Result<(), String> {
        if self.blocks.is_empty() {
            return Err(format!("`{}` has no blocks", self.name));
        }
        if self.layout.first() != Some(&self.entry) {
            return Err(format!("`{}`: entry {} is not laid out first", self.name, self.entry));
        }
        let mut placed = bitvec![0; self.blocks.len()];
        for id in &self.layout {
            if id.0 >= self.blocks.len() {
                return Err(format!("`{}`: layout names unknown block {id}", self.name));
            }
            if placed[id.0] {
                return Err(format!("`{}`: block {id} laid out twice", self.name));
            }
            placed.set(id.0, true);
        }
        for (index, block) in self.blocks.iter().enumerate() {
            if block.id.0 != index {
                return Err(format!("`{}`: block {} stored at {index}", self.name, block.id));
            }
            for succ in block.terminator.successors() {
                if succ.0 >= self.blocks.len() {
                    return Err(format!("`{}`: {} targets unknown {succ}", self.name, block.id));
                }
            }
        }
        let reachable = self.reachable();
        for index in reachable.iter_ones() {
            if !placed[index] {
                return Err(format!(
                    "`{}`: reachable block bb{index} is not laid out",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::Register;

    fn ret() -> Instruction {
        Instruction::new(iced_x86::Instruction::with(Code::Retnq))
    }

    fn diamond() -> Function {
        let mut f = Function::synthesized("f", SymbolId(0), SectionId(0), 16);
        let a = f.add_block(Vec::new(), Terminator::Unreachable, BlockKind::Original);
        let b = f.add_block(Vec::new(), Terminator::Jump(BlockId(3)), BlockKind::Original);
        let c = f.add_block(Vec::new(), Terminator::Jump(BlockId(3)), BlockKind::Original);
        let d = f.add_block(Vec::new(), Terminator::Return(ret()), BlockKind::Original);
        f.block_mut(a).terminator = Terminator::Branch {
            condition: Code::Je_rel8_64,
            taken: b,
            fallthrough: c,
        };
        f.entry = a;
        f.layout = vec![a, b, c, d];
        f
    }

    #[test]
    fn predecessors_and_reachability() {
        let mut f = diamond();
        let preds = f.predecessors();
        assert_eq!(preds[3], vec![BlockId(1), BlockId(2)]);
        assert!(f.reachable().all());

        let orphan = f.add_block(Vec::new(), Terminator::Return(ret()), BlockKind::Dead);
        assert!(!f.reachable()[orphan.0]);
        assert!(f.validate().is_ok());
    }

    #[test]
    fn removed_edges_prune_reachability() {
        let f = diamond();
        let seen = f.reachable_without(&[(BlockId(0), BlockId(1))]);
        assert!(!seen[1]);
        assert!(seen[3]);
    }

    #[test]
    fn redirect_moves_entry_and_edges() {
        let mut f = diamond();
        let guard = f.add_block(Vec::new(), Terminator::Jump(BlockId(3)), BlockKind::Guard);
        f.redirect(BlockId(3), guard, &[guard]);
        assert_eq!(f.successors(BlockId(1)), vec![guard]);
        assert_eq!(f.successors(guard), vec![BlockId(3)]);

        let entry_guard = f.add_block(Vec::new(), Terminator::Jump(BlockId(0)), BlockKind::Guard);
        f.redirect(BlockId(0), entry_guard, &[entry_guard]);
        assert_eq!(f.entry, entry_guard);
    }

    #[test]
    fn validate_rejects_unplaced_reachable_block() {
        let mut f = diamond();
        f.layout.retain(|b| *b != BlockId(2));
        assert!(f.validate().is_err());
    }

    #[test]
    fn reverse_postorder_starts_at_entry() {
        let f = diamond();
        let rpo = f.reverse_postorder();
        assert_eq!(rpo.first(), Some(&BlockId(0)));
        assert_eq!(rpo.last(), Some(&BlockId(3)));
    }

    #[test]
    fn synthesized_instruction_first_byte() {
        let push = iced_x86::Instruction::with1(Code::Push_r64, Register::RBX).unwrap();
        assert_eq!(Instruction::new(push).first_byte().unwrap(), 0x53);
    }
}
