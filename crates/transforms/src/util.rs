//! Shared pass plumbing.

use indexmap::IndexMap;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use iced_x86::Code;
use shroud_core::cfg_ir::{Function, Instruction, Terminator};
use shroud_core::module::Module;
use shroud_utils::errors::TransformError;
use tracing::info;

/// Trait for object-code obfuscation transforms.
pub trait Transform: Send + Sync {
    /// Returns the transform's name for logging and identification.
    fn name(&self) -> &'static str;
    /// Applies the transform to the module, returning what it did.
    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<PassStats, TransformError>;
}

/// Counters reported by one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    /// Whether the pass modified the module.
    pub changed: bool,
    /// Named counters in insertion order.
    pub counters: IndexMap<String, u64>,
}

impl PassStats {
    /// Adds `n` to counter `key`; any non-zero count marks the pass as changed.
    pub fn bump(&mut self, key: &str, n: u64) {
        self.note(key, n);
        if n > 0 {
            self.changed = true;
        }
    }

    /// Adds `n` to an informational counter without marking a change.
    pub fn note(&mut self, key: &str, n: u64) {
        *self.counters.entry(key.to_string()).or_default() += n;
    }

    /// Value of counter `key`, zero when absent.
    pub fn get(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: Self) {
        self.changed |= other.changed;
        for (key, n) in other.counters {
            *self.counters.entry(key).or_default() += n;
        }
    }
}

/// Derives a 64-bit seed from `(seed, index, label)` with Keccak-256.
pub fn derive_seed(seed: u64, index: usize, label: &str) -> u64 {
    let mut hasher = Keccak256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update((index as u64).to_le_bytes());
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// RNG of the pass at position `index` in the pipeline.
pub fn pass_rng(seed: u64, index: usize, name: &str) -> StdRng {
    StdRng::seed_from_u64(derive_seed(seed, index, name))
}

/// RNG private to one function of a pass.
pub fn function_rng(pass_seed: u64, function: usize) -> StdRng {
    StdRng::seed_from_u64(derive_seed(pass_seed, function, "function"))
}

/// Whether a branch code has no rel32 form (`loop*`, `jrcxz`).
pub fn short_only(condition: Code) -> bool {
    condition.as_short_branch() == condition.as_near_branch()
}

/// Whether any block of `function` ends in a branch without a rel32 form.
pub fn has_short_only_branch(function: &Function) -> bool {
    function.blocks.iter().any(|block| {
        matches!(block.terminator, Terminator::Branch { condition, .. } if short_only(condition))
    })
}

/// Runs `work` on every lifted function in parallel.
///
/// Each function gets its own RNG derived from a draw of `rng` and its index,
/// so the outcome does not depend on scheduling. Statistics are merged in
/// function order; the first failure in function order is returned.
///
/// Synthesized functions are skipped, and so are functions with counted
/// loops: any code growth between a `loop` and its target may push the
/// target out of rel8 reach. The latter are counted as `skipped_functions`.
pub fn for_each_function<F>(
    module: &mut Module,
    rng: &mut StdRng,
    work: F,
) -> Result<PassStats, TransformError>
where
    F: Fn(&mut Function, &mut StdRng) -> Result<PassStats, TransformError> + Sync,
{
    let pass_seed: u64 = rng.random();
    let mut stats = PassStats::default();
    for function in module
        .functions
        .iter()
        .filter(|f| !f.synthesized && has_short_only_branch(f))
    {
        info!(function = %function.name, "skipping function with a counted loop");
        stats.note("skipped_functions", 1);
    }
    let results: Vec<Result<PassStats, TransformError>> = module
        .functions
        .par_iter_mut()
        .enumerate()
        .filter(|(_, function)| !function.synthesized && !has_short_only_branch(function))
        .map(|(index, function)| {
            let mut rng = function_rng(pass_seed, index);
            work(function, &mut rng)
        })
        .collect();

    for result in results {
        stats.merge(result?);
    }
    Ok(stats)
}

/// Wraps freshly built machine instructions.
pub fn wrap(
    insns: impl IntoIterator<Item = Result<iced_x86::Instruction, iced_x86::IcedError>>,
) -> Result<Vec<Instruction>, TransformError> {
    insns
        .into_iter()
        .map(|insn| Ok(Instruction::new(insn?)))
        .collect()
}
