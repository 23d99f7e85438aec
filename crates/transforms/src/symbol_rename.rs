//! Renaming of local symbols.

use crate::util::{PassStats, Transform};
use rand::{rngs::StdRng, Rng};
use shroud_core::module::{Module, SymbolType};
use shroud_utils::errors::TransformError;
use std::collections::HashSet;
use tracing::debug;

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Renames local function, object and untyped symbols to random identifiers.
///
/// Relocations and functions refer to symbols by id, so a rename is a single
/// write per symbol. Global, weak, section and file symbols keep their names.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolRename;

fn renamable(kind: SymbolType) -> bool {
    matches!(kind, SymbolType::Func | SymbolType::Object | SymbolType::NoType)
}

fn random_name(rng: &mut StdRng) -> String {
    let mut name = String::with_capacity(13);
    name.push('_');
    for _ in 0..12 {
        name.push(char::from(NAME_ALPHABET[rng.random_range(0..NAME_ALPHABET.len())]));
    }
    name
}

impl Transform for SymbolRename {
    fn name(&self) -> &'static str {
        "sym"
    }

    fn apply(&self, module: &mut Module, rng: &mut StdRng) -> Result<PassStats, TransformError> {
        let mut stats = PassStats::default();
        let mut taken: HashSet<String> = module.symbols.iter().map(|s| s.name.clone()).collect();
        for index in 0..module.symbols.len() {
            let symbol = &module.symbols[index];
            if !symbol.is_local() || !renamable(symbol.kind) || symbol.name.is_empty() {
                continue;
            }
            let fresh = loop {
                let candidate = random_name(rng);
                if taken.insert(candidate.clone()) {
                    break candidate;
                }
            };
            debug!(from = %symbol.name, to = %fresh, "renamed symbol");
            for function in module.functions.iter_mut().filter(|f| f.symbol.0 == index) {
                function.name.clone_from(&fresh);
            }
            module.symbols[index].name = fresh;
            stats.bump("renamed_symbols", 1);
        }
        Ok(stats)
    }
}
