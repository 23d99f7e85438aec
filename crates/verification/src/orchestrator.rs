//! Runs every verification stage over an original/transformed module pair.

use crate::{
    certificate::{CeilingCheck, VerificationReport},
    config::VerificationConfig,
    formal::FormalVerifier,
    practical::PracticalTester,
    structural,
};
use shroud_analysis::{collect_metrics, compare, Metrics};
use shroud_core::{measure, Module};
use shroud_utils::errors::{MetricsError, VerificationError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Main verification engine combining structural, formal and practical checks.
#[derive(Debug)]
pub struct VerificationEngine {
    config: VerificationConfig,
    formal: FormalVerifier,
    practical: PracticalTester,
}

impl VerificationEngine {
    /// Builds the formal and practical stages from `config`.
    pub fn new(config: VerificationConfig) -> Self {
        let practical = PracticalTester::new(config.clone());
        Self {
            config,
            formal: FormalVerifier::new(),
            practical,
        }
    }

    /// Settings the engine runs with.
    pub const fn config(&self) -> &VerificationConfig {
        &self.config
    }

    /// Verifies `transformed` against `original`. The first failed check
    /// aborts with its error; a report is returned only when all hold.
    pub fn verify(
        &self,
        original: &Module,
        transformed: &Module,
    ) -> Result<VerificationReport, VerificationError> {
        let start = Instant::now();
        self.config.validate()?;

        let structural = structural::check(original, transformed)?;
        debug!(
            functions = structural.functions_checked,
            blocks = structural.blocks_checked,
            "structural checks passed"
        );

        let metrics_before = metrics(original)?;
        let metrics_after = metrics(transformed)?;
        let delta = compare(&metrics_before, &metrics_after);

        let proofs = if self.config.prove_predicates {
            self.formal.prove(transformed)?
        } else {
            debug!("predicate proofs disabled");
            Vec::new()
        };

        let equivalence = if self.config.practical_testing_enabled {
            let results = self.practical.test_equivalence(original, transformed)?;
            if results.cases_inconclusive > 0 {
                warn!(
                    inconclusive = results.cases_inconclusive,
                    "some equivalence cases exhausted the step budget"
                );
            }
            Some(results)
        } else {
            debug!("practical testing disabled");
            None
        };

        let mut ceilings = Vec::new();
        if let Some(ceiling) = self.config.max_size_growth {
            ceilings.push(CeilingCheck::new("size growth", delta.size_growth_pct, ceiling));
        }
        if let Some(ceiling) = self.config.max_runtime_overhead {
            let measured = equivalence
                .as_ref()
                .and_then(|eq| eq.runtime_overhead_pct)
                .unwrap_or(0.0);
            ceilings.push(CeilingCheck::new("runtime overhead", measured, ceiling));
        }
        if let Some(failed) = ceilings.iter().find(|c| !c.passed) {
            return Err(VerificationError::CeilingExceeded {
                metric: failed.metric.clone(),
                measured: failed.measured,
                ceiling: failed.ceiling,
            });
        }

        let report = VerificationReport::new(
            metrics_before,
            metrics_after,
            delta,
            structural,
            proofs,
            equivalence,
            ceilings,
            start.elapsed().as_millis() as u64,
        );
        info!(
            digest = %report.digest,
            size_growth = format!("{:.1}%", report.delta.size_growth_pct),
            "{}",
            report.summary()
        );
        Ok(report)
    }
}

/// Metrics at the emitter's layout size. A module without functions has
/// nothing to measure and gets zeroed metrics.
fn metrics(module: &Module) -> Result<Metrics, VerificationError> {
    let size = measure(module)?;
    match collect_metrics(module, size) {
        Ok(metrics) => Ok(metrics),
        Err(MetricsError::EmptyModule) => Ok(Metrics {
            code_size: size,
            ..Metrics::default()
        }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Code, ConditionCode, Register};
    use object::{elf, SectionKind};
    use shroud_core::cfg_ir::{BlockId, BlockKind, Function, Instruction, Terminator};
    use shroud_core::insn;
    use shroud_core::module::{Section, SectionRole, Symbol, SymbolBinding, SymbolType};

    fn rr(code: Code, a: Register, b: Register) -> Instruction {
        Instruction::new(iced_x86::Instruction::with2(code, a, b).unwrap())
    }

    /// `f(a, b) = a + b`.
    fn module() -> Module {
        let mut module = Module::default();
        let mut text = Section::synthesized(
            ".text",
            SectionKind::Text,
            elf::SHT_PROGBITS,
            u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR),
            16,
            SectionRole::Code,
        );
        text.synthesized = false;
        let text = module.add_section(text);
        let mut symbol = Symbol::local("f", SymbolType::Func, text, 0, 0);
        symbol.binding = SymbolBinding::Global;
        let symbol = module.add_symbol(symbol);
        let mut f = Function::synthesized("f", symbol, text, 16);
        f.synthesized = false;
        f.add_block(
            vec![
                rr(Code::Mov_r32_rm32, Register::EAX, Register::EDI),
                rr(Code::Add_r32_rm32, Register::EAX, Register::ESI),
            ],
            Terminator::Return(Instruction::new(insn::ret())),
            BlockKind::Original,
        );
        f.layout = vec![BlockId(0)];
        module.add_function(f);
        module
    }

    /// Pads the single block with `nop`s the way a pass adds code.
    fn grown(nops: usize) -> Module {
        let mut module = module();
        let block = &mut module.functions[0].blocks[0];
        for _ in 0..nops {
            block.instructions.insert(0, Instruction::new(iced_x86::Instruction::with(Code::Nopd)));
        }
        module
    }

    #[test]
    fn identity_verifies() {
        let module = module();
        let engine = VerificationEngine::new(VerificationConfig::development());
        let report = engine.verify(&module, &module).unwrap();
        assert!(report.passed());
        assert!(report.proofs.is_empty());
        assert_eq!(report.delta.code_size, 0);
        assert_eq!(report.equivalence.as_ref().unwrap().functions_tested, 1);
        assert!(report.validate());
    }

    #[test]
    fn size_ceiling_is_enforced() {
        let original = module();
        let transformed = grown(64);
        let config = VerificationConfig {
            max_size_growth: Some(10.0),
            ..VerificationConfig::development()
        };
        let err = VerificationEngine::new(config)
            .verify(&original, &transformed)
            .unwrap_err();
        assert!(matches!(err, VerificationError::CeilingExceeded { ref metric, .. } if metric == "size growth"));
    }

    #[test]
    fn runtime_ceiling_is_enforced() {
        let original = module();
        let transformed = grown(16);
        let config = VerificationConfig {
            max_runtime_overhead: Some(50.0),
            ..VerificationConfig::development()
        };
        let err = VerificationEngine::new(config)
            .verify(&original, &transformed)
            .unwrap_err();
        assert!(matches!(err, VerificationError::CeilingExceeded { ref metric, .. } if metric == "runtime overhead"));
    }

    #[test]
    fn divergence_is_fatal() {
        let original = module();
        let mut transformed = module();
        transformed.functions[0].blocks[0].instructions[1] =
            rr(Code::Sub_r32_rm32, Register::EAX, Register::ESI);
        let engine = VerificationEngine::new(VerificationConfig::development());
        assert!(matches!(
            engine.verify(&original, &transformed),
            Err(VerificationError::EquivalenceFailed { .. })
        ));
    }

    #[test]
    fn unprovable_guard_is_fatal() {
        let original = module();
        let mut transformed = module();
        let f = &mut transformed.functions[0];
        let dead = f.add_block(Vec::new(), Terminator::Jump(BlockId(0)), BlockKind::Dead);
        // `test edi, edi; jne dead` depends on the argument.
        let guard = f.add_block(
            vec![rr(Code::Test_rm32_r32, Register::EDI, Register::EDI)],
            Terminator::Branch {
                condition: insn::jcc(ConditionCode::ne),
                taken: dead,
                fallthrough: BlockId(0),
            },
            BlockKind::Guard,
        );
        f.entry = guard;
        f.layout = vec![guard, BlockId(0), dead];
        f.guards.push(shroud_core::cfg_ir::OpaqueGuard {
            guard,
            real: BlockId(0),
            dead,
            kind: shroud_core::cfg_ir::PredicateKind::AlwaysFalse,
        });
        let config = VerificationConfig {
            practical_testing_enabled: false,
            ..VerificationConfig::development()
        };
        let err = VerificationEngine::new(config)
            .verify(&original, &transformed)
            .unwrap_err();
        assert!(matches!(err, VerificationError::OpaquePredicate { .. }));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let module = module();
        let config = VerificationConfig {
            step_limit: 0,
            ..VerificationConfig::development()
        };
        assert!(matches!(
            VerificationEngine::new(config).verify(&module, &module),
            Err(VerificationError::Configuration(_))
        ));
    }
}
