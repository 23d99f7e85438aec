//! Practical equivalence testing by emulation.
//!
//! Every original function is linked into an in-memory image twice, once
//! from the original module and once from the transformed one, and both are
//! run on the same seeded inputs. The observations must agree exactly.
//! Functions the emulator cannot run are skipped and reported; cases that
//! exhaust the step budget on either side are counted as inconclusive.

pub mod machine;

use crate::config::{VerificationConfig, TRANSFORMED_STEP_FACTOR};
use machine::{Execution, Machine, Observation, Outcome, ARGUMENT_REGS};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use shroud_core::image::{link_image, Image};
use shroud_core::module::{FunctionId, Module};
use shroud_utils::errors::VerificationError;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Inputs every function sees first, rotated across the argument registers.
const EDGE_VALUES: [u64; 6] = [0, 1, u64::MAX, 7, 0x7fff_ffff, 0x8000_0000];

/// A function left out of equivalence testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFunction {
    /// Function name.
    pub function: String,
    /// Why it was not tested.
    pub reason: String,
}

/// Results of equivalence testing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquivalenceResults {
    /// Functions compared on every case.
    pub functions_tested: usize,
    /// Functions left out, with reasons.
    pub functions_skipped: Vec<SkippedFunction>,
    /// Cases whose observations were compared.
    pub cases_executed: usize,
    /// Cases that exhausted the step budget on either side.
    pub cases_inconclusive: usize,
    /// Instructions executed by the original over the compared cases.
    pub original_steps: u64,
    /// Instructions executed by the transformed module over the same cases.
    pub transformed_steps: u64,
    /// Emulated instruction count growth in percent.
    pub runtime_overhead_pct: Option<f64>,
    /// Wall time spent emulating.
    pub testing_time_ms: u64,
}

enum Verdict {
    Tested {
        cases: usize,
        inconclusive: usize,
        before: u64,
        after: u64,
    },
    Skipped(SkippedFunction),
}

/// Practical testing engine using emulation
#[derive(Debug, Clone)]
pub struct PracticalTester {
    config: VerificationConfig,
}

impl PracticalTester {
    /// A tester running with `config`.
    pub fn new(config: VerificationConfig) -> Self {
        Self { config }
    }

    /// Runs every original function of `original` and its counterpart in
    /// `transformed` on the same inputs.
    pub fn test_equivalence(
        &self,
        original: &Module,
        transformed: &Module,
    ) -> Result<EquivalenceResults, VerificationError> {
        let start = Instant::now();
        let before = link_image(original)?;
        let after = link_image(transformed)?;

        let candidates: Vec<usize> = original
            .functions
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.synthesized)
            .map(|(index, _)| index)
            .collect();
        let verdicts: Vec<Result<Verdict, VerificationError>> = candidates
            .par_iter()
            .map(|index| self.test_function(original, *index, &before, &after))
            .collect();

        let mut results = EquivalenceResults::default();
        for verdict in verdicts {
            match verdict? {
                Verdict::Tested {
                    cases,
                    inconclusive,
                    before,
                    after,
                } => {
                    results.functions_tested += 1;
                    results.cases_executed += cases;
                    results.cases_inconclusive += inconclusive;
                    results.original_steps += before;
                    results.transformed_steps += after;
                }
                Verdict::Skipped(skipped) => {
                    debug!(function = %skipped.function, reason = %skipped.reason, "skipped equivalence testing");
                    results.functions_skipped.push(skipped);
                }
            }
        }
        if results.original_steps > 0 {
            let growth = results.transformed_steps as f64 - results.original_steps as f64;
            results.runtime_overhead_pct = Some(growth * 100.0 / results.original_steps as f64);
        }
        results.testing_time_ms = start.elapsed().as_millis() as u64;
        info!(
            tested = results.functions_tested,
            skipped = results.functions_skipped.len(),
            cases = results.cases_executed,
            inconclusive = results.cases_inconclusive,
            "equivalence testing finished"
        );
        Ok(results)
    }

    fn test_function(
        &self,
        original: &Module,
        index: usize,
        before: &Image,
        after: &Image,
    ) -> Result<Verdict, VerificationError> {
        let name = original.functions[index].name.clone();
        let skip = |reason: String| {
            Ok(Verdict::Skipped(SkippedFunction {
                function: name.clone(),
                reason,
            }))
        };
        let (Some(entry_before), Some(entry_after)) =
            (before.entry(FunctionId(index)), after.entry(FunctionId(index)))
        else {
            return skip("function is not linked".into());
        };

        let mut rng = StdRng::seed_from_u64(self.config.seed ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let mut run_before = Machine::new(before);
        let mut run_after = Machine::new(after);
        let limit = self.config.step_limit;
        let (mut cases, mut inconclusive, mut steps_before, mut steps_after) = (0, 0, 0, 0);
        for case in 0..self.config.test_case_count {
            let args = inputs(case, &mut rng);
            let a = run_before.run(entry_before, &args, limit);
            let b = run_after.run(entry_after, &args, limit.saturating_mul(TRANSFORMED_STEP_FACTOR));
            match (&a.outcome, &b.outcome) {
                (Outcome::Unsupported(reason), _) | (_, Outcome::Unsupported(reason)) => {
                    return skip(reason.clone());
                }
                (Outcome::StepLimit, Outcome::StepLimit) => {
                    inconclusive += 1;
                    continue;
                }
                (Outcome::StepLimit, _) | (_, Outcome::StepLimit) => {
                    if a.outcome != Outcome::StepLimit {
                        warn!(function = %name, case, "transformed code exhausted its step budget");
                    }
                    inconclusive += 1;
                    continue;
                }
                _ => {}
            }
            if let Some(reason) = disagreement(&a, &b) {
                return Err(VerificationError::EquivalenceFailed {
                    function: name.clone(),
                    input: describe_args(&args),
                    reason,
                });
            }
            cases += 1;
            steps_before += a.steps;
            steps_after += b.steps;
        }
        Ok(Verdict::Tested {
            cases,
            inconclusive,
            before: steps_before,
            after: steps_after,
        })
    }
}

/// Arguments of case `case`: rotated edge values first, then random values
/// mixing small numbers, sign-extended 32-bit values and full 64-bit values.
fn inputs(case: usize, rng: &mut StdRng) -> [u64; ARGUMENT_REGS.len()] {
    if case < EDGE_VALUES.len() {
        return std::array::from_fn(|slot| EDGE_VALUES[(case + slot) % EDGE_VALUES.len()]);
    }
    std::array::from_fn(|_| match rng.random_range(0..3) {
        0 => rng.random_range(0..64),
        1 => i64::from(rng.random::<i32>()) as u64,
        _ => rng.random(),
    })
}

fn describe_args(args: &[u64]) -> String {
    let parts: Vec<String> = args.iter().map(|a| format!("{a:#x}")).collect();
    format!("({})", parts.join(", "))
}

fn label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Returned(_) => "return",
        Outcome::Exited(_) => "exit",
        Outcome::Trap => "trap",
        Outcome::Fault(_) => "fault",
        Outcome::Unsupported(_) => "unsupported",
        Outcome::StepLimit => "step limit",
    }
}

/// First difference between two runs, if any.
fn disagreement(a: &Execution, b: &Execution) -> Option<String> {
    match (&a.outcome, &b.outcome) {
        (Outcome::Returned(x), Outcome::Returned(y)) | (Outcome::Exited(x), Outcome::Exited(y)) => {
            compare_observations(x, y)
        }
        (Outcome::Trap, Outcome::Trap) | (Outcome::Fault(_), Outcome::Fault(_)) => None,
        (x, y) => Some(format!("original ended in {} but transformed in {}", label(x), label(y))),
    }
}

fn compare_observations(a: &Observation, b: &Observation) -> Option<String> {
    if a.rax != b.rax {
        return Some(format!("rax {:?} != {:?}", a.rax, b.rax));
    }
    if a.rdx != b.rdx {
        return Some(format!("rdx {:?} != {:?}", a.rdx, b.rdx));
    }
    if let Some(slot) = a.callee_saved.iter().zip(&b.callee_saved).position(|(x, y)| x != y) {
        return Some(format!("callee-saved register {slot} not preserved"));
    }
    if a.rsp != b.rsp {
        return Some(format!("rsp {:?} != {:?}", a.rsp, b.rsp));
    }
    if a.calls != b.calls {
        let at = a
            .calls
            .iter()
            .zip(&b.calls)
            .position(|(x, y)| x != y)
            .unwrap_or(a.calls.len().min(b.calls.len()));
        return Some(format!("external call {at} differs"));
    }
    if a.writes != b.writes {
        let location = a
            .writes
            .iter()
            .find(|(location, byte)| b.writes.get(*location) != Some(*byte))
            .map(|(location, _)| location)
            .or_else(|| b.writes.keys().find(|location| !a.writes.contains_key(*location)));
        return Some(format!("memory differs at {location:?}"));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerificationConfig;
    use iced_x86::{Code, Register};
    use object::{elf, SectionKind};
    use shroud_core::cfg_ir::{BlockId, BlockKind, Function, Instruction, Terminator};
    use shroud_core::insn;
    use shroud_core::module::{Section, SectionRole, Symbol, SymbolBinding, SymbolType};

    fn rr(code: Code, a: Register, b: Register) -> Instruction {
        Instruction::new(iced_x86::Instruction::with2(code, a, b).unwrap())
    }

    /// `f(a, b) = a op b` as a one-block function.
    fn binary(op: Code) -> Module {
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
                rr(op, Register::EAX, Register::ESI),
            ],
            Terminator::Return(Instruction::new(insn::ret())),
            BlockKind::Original,
        );
        f.layout = vec![BlockId(0)];
        module.add_function(f);
        module
    }

    fn tester() -> PracticalTester {
        PracticalTester::new(VerificationConfig::development())
    }

    #[test]
    fn identical_modules_agree() {
        let module = binary(Code::Add_r32_rm32);
        let results = tester().test_equivalence(&module, &module).unwrap();
        assert_eq!(results.functions_tested, 1);
        assert_eq!(results.cases_executed, 8);
        assert_eq!(results.runtime_overhead_pct, Some(0.0));
    }

    #[test]
    fn changed_arithmetic_is_caught() {
        let original = binary(Code::Add_r32_rm32);
        let transformed = binary(Code::Sub_r32_rm32);
        let err = tester().test_equivalence(&original, &transformed).unwrap_err();
        match err {
            VerificationError::EquivalenceFailed { function, reason, .. } => {
                assert_eq!(function, "f");
                assert!(reason.starts_with("rax"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn unsupported_functions_are_skipped() {
        let original = binary(Code::Add_r32_rm32);
        let mut transformed = original.clone();
        transformed.functions[0].blocks[0]
            .instructions
            .push(Instruction::new(
                iced_x86::Instruction::with2(Code::Pxor_xmm_xmmm128, Register::XMM0, Register::XMM1).unwrap(),
            ));
        let results = tester().test_equivalence(&original, &transformed).unwrap();
        assert_eq!(results.functions_tested, 0);
        assert_eq!(results.functions_skipped.len(), 1);
        assert_eq!(results.runtime_overhead_pct, None);
    }

    #[test]
    fn edge_values_rotate_across_arguments() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(inputs(0, &mut rng), EDGE_VALUES);
        assert_eq!(inputs(1, &mut rng)[0], 1);
        assert_eq!(inputs(1, &mut rng)[5], 0);
    }
}
