//! The verification report and its fingerprint.
//!
//! A report is produced only when every check passed, so holding one is
//! evidence that the transformed module was accepted. Its `digest` is a
//! Keccak-256 over the canonical JSON of everything else in the report.

use crate::formal::{PredicateProof, ProofMethod};
use crate::practical::EquivalenceResults;
use crate::structural::StructuralSummary;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use shroud_analysis::{Metrics, MetricsDelta};

/// One overhead ceiling and the value measured against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CeilingCheck {
    /// Name of the bounded quantity.
    pub metric: String,
    /// Percent.
    pub measured: f64,
    /// Percent.
    pub ceiling: f64,
    /// `measured <= ceiling`.
    pub passed: bool,
}

impl CeilingCheck {
    /// Records `measured` against `ceiling`.
    pub fn new(metric: &str, measured: f64, ceiling: f64) -> Self {
        Self {
            metric: metric.to_string(),
            measured,
            ceiling,
            passed: measured <= ceiling,
        }
    }
}

/// Everything verification established about a transformed module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Metrics of the input module.
    pub metrics_before: Metrics,
    /// Metrics of the transformed module.
    pub metrics_after: Metrics,
    /// `metrics_after - metrics_before`.
    pub delta: MetricsDelta,
    /// What the structural checks covered.
    pub structural: StructuralSummary,
    /// One proof per opaque guard.
    pub proofs: Vec<PredicateProof>,
    /// `None` when practical testing is disabled.
    pub equivalence: Option<EquivalenceResults>,
    /// Overhead ceilings and their measurements.
    pub ceilings: Vec<CeilingCheck>,
    /// Wall time spent verifying.
    pub duration_ms: u64,
    /// Hex Keccak-256 of the report without this field and `duration_ms`.
    pub digest: String,
}

#[derive(Serialize)]
struct Fingerprinted<'a> {
    metrics_before: &'a Metrics,
    metrics_after: &'a Metrics,
    delta: &'a MetricsDelta,
    structural: &'a StructuralSummary,
    proofs: &'a [PredicateProof],
    equivalence: Option<FingerprintedEquivalence<'a>>,
    ceilings: &'a [CeilingCheck],
}

/// Equivalence results minus wall-clock time, which varies between runs.
#[derive(Serialize)]
struct FingerprintedEquivalence<'a> {
    functions_tested: usize,
    functions_skipped: &'a [crate::practical::SkippedFunction],
    cases_executed: usize,
    cases_inconclusive: usize,
    original_steps: u64,
    transformed_steps: u64,
}

impl VerificationReport {
    /// Builds a report and stamps its digest.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metrics_before: Metrics,
        metrics_after: Metrics,
        delta: MetricsDelta,
        structural: StructuralSummary,
        proofs: Vec<PredicateProof>,
        equivalence: Option<EquivalenceResults>,
        ceilings: Vec<CeilingCheck>,
        duration_ms: u64,
    ) -> Self {
        let mut report = Self {
            metrics_before,
            metrics_after,
            delta,
            structural,
            proofs,
            equivalence,
            ceilings,
            duration_ms,
            digest: String::new(),
        };
        report.digest = report.compute_digest();
        report
    }

    /// True when every recorded ceiling held.
    pub fn passed(&self) -> bool {
        self.ceilings.iter().all(|c| c.passed)
    }

    /// Recomputes the digest and compares it with the stored one.
    pub fn validate(&self) -> bool {
        self.digest == self.compute_digest()
    }

    /// Predicates evaluated exhaustively rather than folded.
    pub fn exhaustive_proofs(&self) -> usize {
        self.proofs
            .iter()
            .filter(|p| matches!(p.method, ProofMethod::Exhaustive { .. }))
            .count()
    }

    /// One-line summary for logs and the CLI.
    pub fn summary(&self) -> String {
        let status = if self.passed() { "PASSED" } else { "FAILED" };
        let practical = match &self.equivalence {
            Some(eq) => format!(
                "{} functions, {} cases ({} skipped)",
                eq.functions_tested,
                eq.cases_executed,
                eq.functions_skipped.len()
            ),
            None => "N/A".to_string(),
        };
        format!(
            "Verification {status} - Proofs: {}, Practical: {practical}, Size: {:+.1}%, Time: {:.2}s",
            self.proofs.len(),
            self.delta.size_growth_pct,
            self.duration_ms as f64 / 1000.0
        )
    }

    fn compute_digest(&self) -> String {
        let view = Fingerprinted {
            metrics_before: &self.metrics_before,
            metrics_after: &self.metrics_after,
            delta: &self.delta,
            structural: &self.structural,
            proofs: &self.proofs,
            equivalence: self.equivalence.as_ref().map(|eq| FingerprintedEquivalence {
                functions_tested: eq.functions_tested,
                functions_skipped: &eq.functions_skipped,
                cases_executed: eq.cases_executed,
                cases_inconclusive: eq.cases_inconclusive,
                original_steps: eq.original_steps,
                transformed_steps: eq.transformed_steps,
            }),
            ceilings: &self.ceilings,
        };
        // Serializing plain data with string keys cannot fail.
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        let mut hasher = Keccak256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shroud_analysis::compare;

    fn report(duration_ms: u64) -> VerificationReport {
        let before = Metrics {
            code_size: 100,
            ..Metrics::default()
        };
        let after = Metrics {
            code_size: 180,
            ..Metrics::default()
        };
        let delta = compare(&before, &after);
        VerificationReport::new(
            before,
            after,
            delta,
            StructuralSummary::default(),
            Vec::new(),
            Some(EquivalenceResults {
                testing_time_ms: duration_ms,
                ..EquivalenceResults::default()
            }),
            vec![CeilingCheck::new("size growth", 80.0, 100.0)],
            duration_ms,
        )
    }

    #[test]
    fn test_report_creation() {
        let report = report(12);
        assert!(report.passed());
        assert!(report.validate());
        assert_eq!(report.digest.len(), 64);
        assert!(report.summary().starts_with("Verification PASSED"));
    }

    #[test]
    fn digest_ignores_timing() {
        assert_eq!(report(1).digest, report(5000).digest);
    }

    #[test]
    fn tampering_breaks_validation() {
        let mut report = report(3);
        report.metrics_after.code_size = 101;
        assert!(!report.validate());
    }

    #[test]
    fn exceeded_ceiling_fails() {
        let check = CeilingCheck::new("runtime overhead", 250.0, 200.0);
        assert!(!check.passed);
    }
}
