//! Single-pass entry points.

use crate::config::PassSpec;
use crate::util::{pass_rng, PassStats, Transform};
use shroud_analysis::{collect_metrics, compare};
use shroud_core::encoder::measure;
use shroud_core::module::Module;
use shroud_utils::errors::{MetricsError, TransformError};
use rand::rngs::StdRng;
use tracing::{debug, info};

/// Applies `transform` to a snapshot of `module` and commits it only when the
/// pass succeeds and every function still satisfies the IR invariants.
pub fn run_pass(
    module: &mut Module,
    transform: &dyn Transform,
    rng: &mut StdRng,
) -> Result<PassStats, TransformError> {
    let mut snapshot = module.clone();
    let stats = transform.apply(&mut snapshot, rng)?;
    for function in &snapshot.functions {
        function
            .validate()
            .map_err(|reason| TransformError::invariant(transform.name(), reason))?;
    }

    if stats.changed {
        let before = summarize(module, transform.name())?;
        let after = summarize(&snapshot, transform.name())?;
        let delta = compare(&before, &after);
        info!(
            "{:>14} Δ{:+.2} cyclomatic {:+} size {:+.1}%",
            transform.name(),
            delta.score,
            delta.cyclomatic,
            delta.size_growth_pct
        );
    } else {
        debug!(pass = transform.name(), "no changes");
    }

    *module = snapshot;
    Ok(stats)
}

fn summarize(module: &Module, pass: &str) -> Result<shroud_analysis::Metrics, TransformError> {
    let size = measure(module).map_err(|e| TransformError::invariant(pass, e.to_string()))?;
    match collect_metrics(module, size) {
        Ok(metrics) => Ok(metrics),
        Err(MetricsError::EmptyModule) => Ok(shroud_analysis::Metrics {
            code_size: size,
            ..Default::default()
        }),
        Err(e) => Err(e.into()),
    }
}

/// Applies one pass spec as pass number `index` of a run seeded with `seed`.
///
/// The module comes back unchanged when the pass fails.
pub fn apply_pass(
    mut module: Module,
    spec: &PassSpec,
    seed: u64,
    index: usize,
) -> (Module, Result<PassStats, TransformError>) {
    let result = spec
        .transform()
        .map_err(|e| TransformError::invariant(spec.name(), e.to_string()))
        .and_then(|transform| {
            let mut rng = pass_rng(seed, index, spec.name());
            run_pass(&mut module, transform.as_ref(), &mut rng)
        });
    (module, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::max_module;

    #[test]
    fn successful_pass_is_committed() {
        let blocks = max_module().functions[0].blocks.len();
        let (module, stats) = apply_pass(max_module(), &PassSpec::Bogus { percent: 100 }, 5, 0);
        assert!(stats.unwrap().changed);
        assert!(module.functions[0].blocks.len() > blocks);
    }

    #[test]
    fn failed_pass_leaves_module_alone() {
        let (module, stats) = apply_pass(max_module(), &PassSpec::Flatten { cycles: 9 }, 5, 0);
        assert!(matches!(stats, Err(TransformError::Invariant { .. })));
        assert_eq!(module.functions[0].blocks.len(), 3);
    }

    #[test]
    fn pass_rng_depends_on_position() {
        let run = |index| apply_pass(max_module(), &PassSpec::Flatten { cycles: 1 }, 5, index).0;
        assert_eq!(run(0).functions[0].layout, run(0).functions[0].layout);
        assert_eq!(run(0).functions[0].blocks.len(), run(1).functions[0].blocks.len());
    }
}
