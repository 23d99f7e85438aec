//! Control-flow flattening through a state-variable dispatcher.

use crate::util::{for_each_function, wrap, PassStats, Transform};
use iced_x86::{ConditionCode, Register};
use rand::prelude::SliceRandom;
use rand::{rngs::StdRng, Rng};
use shroud_core::cfg_ir::{BlockId, BlockKind, Function, Terminator};
use shroud_core::insn::{self, SCRATCH};
use shroud_core::module::Module;
use shroud_utils::errors::TransformError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Control-flow flattening.
///
/// Every direct edge is routed through a state-setting block into a single
/// dispatcher, which compares the state register against each case and hands
/// control to a trampoline that restores the machine state and jumps to the
/// real target:
///
/// ```text
/// setter:     lea rsp,[rsp-128]; push SR; mov SR32, state  -> dispatcher
/// dispatcher: pushfq; cmp SR32, s0; je t0; cmp SR32, s1; je t1; ... -> tN
/// trampoline: popfq; pop SR; lea rsp,[rsp+128]             -> target
/// ```
///
/// Each cycle flattens the result of the previous one with a fresh state
/// register. Edges leaving opaque guards and their dead blocks stay direct so
/// the guard structure remains provable.
#[derive(Debug, Clone)]
pub struct Flatten {
    cycles: u8,
}

impl Flatten {
    /// Flattening with `cycles` rounds.
    pub const fn new(cycles: u8) -> Self {
        Self { cycles }
    }

    fn flatten_function(&self, function: &mut Function, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        let mut stats = PassStats::default();
        if function.has_indirect_branch {
            info!(function = %function.name, "skipping flattening: indirect branch");
            stats.note("skipped_functions", 1);
            return Ok(stats);
        }

        let mut previous: Option<Register> = None;
        for cycle in 0..self.cycles {
            let state = loop {
                let candidate = SCRATCH[rng.random_range(0..SCRATCH.len())];
                if Some(candidate) != previous {
                    break candidate;
                }
            };
            let Some(cases) = flatten_once(function, state, rng)? else {
                break;
            };
            debug!(function = %function.name, cycle, cases, register = ?state, "flattened");
            previous = Some(state);
            stats.bump("cycles_completed", 1);
            stats.bump("dispatch_cases", cases as u64);
        }
        if stats.get("cycles_completed") > 0 {
            stats.bump("flattened_functions", 1);
        }
        Ok(stats)
    }
}

impl Transform for Flatten {
    fn name(&self) -> &'static str {
        "flatten"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        for_each_function(module, rng, |function, rng| self.flatten_function(function, rng))
    }
}

/// One flattening round. Returns the number of dispatch cases, or `None` when
/// the function has no direct edges.
fn flatten_once(
    function: &mut Function,
    state: Register,
    rng: &mut StdRng,
) -> Result<Option<usize>, TransformError> {
    let reachable = function.reachable();
    let sources: Vec<BlockId> = function
        .blocks
        .iter()
        .filter(|b| reachable[b.id.0] && !matches!(b.kind, BlockKind::Guard | BlockKind::Dead))
        .filter(|b| matches!(b.terminator, Terminator::Jump(_) | Terminator::Branch { .. }))
        .map(|b| b.id)
        .collect();
    let mut targets: Vec<BlockId> = sources
        .iter()
        .flat_map(|id| function.successors(*id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if targets.is_empty() {
        return Ok(None);
    }
    targets.shuffle(rng);

    let mut used = BTreeSet::new();
    let mut values = BTreeMap::new();
    for target in &targets {
        let value = loop {
            let candidate: u32 = rng.random();
            if used.insert(candidate) {
                break candidate;
            }
        };
        values.insert(*target, value);
    }

    let mut trampolines = BTreeMap::new();
    for target in &targets {
        let code = wrap([Ok(insn::popfq()), insn::pop(state), insn::red_zone_leave()])?;
        let id = function.add_block(code, Terminator::Jump(*target), BlockKind::Dispatch);
        trampolines.insert(*target, id);
    }
    let trampoline = |target: &BlockId| trampolines.get(target).copied().unwrap_or(*target);

    // The last case needs no comparison.
    let (compared, fallback) = targets.split_at(targets.len() - 1);
    let mut next = trampoline(&fallback[0]);
    let mut dispatch = Vec::with_capacity(targets.len() + 1);
    for target in compared.iter().rev() {
        let value = values.get(target).copied().unwrap_or_default();
        let id = function.add_block(
            wrap([insn::cmp_imm32(state, value)])?,
            Terminator::Branch {
                condition: insn::jcc(ConditionCode::e),
                taken: trampoline(target),
                fallthrough: next,
            },
            BlockKind::Dispatch,
        );
        dispatch.push(id);
        next = id;
    }
    let dispatcher = function.add_block(
        wrap([Ok(insn::pushfq())])?,
        Terminator::Jump(next),
        BlockKind::Dispatch,
    );
    dispatch.push(dispatcher);

    let mut setters = BTreeMap::new();
    for target in &targets {
        let value = values.get(target).copied().unwrap_or_default();
        let code = wrap([
            insn::red_zone_enter(),
            insn::push(state),
            insn::mov_imm32(state, value),
        ])?;
        let id = function.add_block(code, Terminator::Jump(dispatcher), BlockKind::Dispatch);
        setters.insert(*target, id);
    }
    let setter = |target: BlockId| setters.get(&target).copied().unwrap_or(target);

    for source in &sources {
        match &mut function.block_mut(*source).terminator {
            Terminator::Jump(target) => *target = setter(*target),
            Terminator::Branch {
                taken, fallthrough, ..
            } => {
                *taken = setter(*taken);
                *fallthrough = setter(*fallthrough);
            }
            _ => {}
        }
    }

    let entry = function.entry;
    let mut rest: Vec<BlockId> = function
        .layout
        .iter()
        .copied()
        .filter(|id| *id != entry)
        .chain(trampolines.values().copied())
        .chain(dispatch)
        .chain(setters.values().copied())
        .collect();
    rest.shuffle(rng);
    function.layout = std::iter::once(entry).chain(rest).collect();
    Ok(Some(targets.len()))
}
