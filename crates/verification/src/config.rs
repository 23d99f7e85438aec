//! Verification configuration and settings

use serde::{Deserialize, Serialize};
use shroud_utils::errors::VerificationError;

/// How thorough verification is and which overheads are acceptable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Seeded inputs each function is run on.
    pub test_case_count: usize,

    /// Seed of the input generator. Equal seeds give equal inputs.
    pub seed: u64,

    /// Instructions the original function may execute per case. The
    /// transformed function gets [`TRANSFORMED_STEP_FACTOR`] times as many.
    pub step_limit: u64,

    /// Ceiling on code size growth, in percent of the original code bytes.
    pub max_size_growth: Option<f64>,

    /// Ceiling on emulated instruction count growth, in percent.
    pub max_runtime_overhead: Option<f64>,

    /// Prove every opaque predicate.
    pub prove_predicates: bool,

    /// Run the emulator-based equivalence check.
    pub practical_testing_enabled: bool,
}

/// Budget multiplier for the transformed side of an equivalence case.
pub const TRANSFORMED_STEP_FACTOR: u64 = 32;

impl Default for VerificationConfig {
    fn default() -> Self {
        Self::standard()
    }
}

impl VerificationConfig {
    /// Quick verification for local iteration.
    pub fn development() -> Self {
        Self {
            test_case_count: 8,
            seed: 42,
            step_limit: 50_000,
            max_size_growth: None,
            max_runtime_overhead: None,
            prove_predicates: true,
            practical_testing_enabled: true,
        }
    }

    /// Balanced verification; the default.
    pub fn standard() -> Self {
        Self {
            test_case_count: 32,
            seed: 12345,
            step_limit: 200_000,
            ..Self::development()
        }
    }

    /// Exhaustive verification before shipping an object.
    pub fn production() -> Self {
        Self {
            test_case_count: 128,
            seed: 98765,
            step_limit: 1_000_000,
            ..Self::development()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), VerificationError> {
        if self.practical_testing_enabled && self.test_case_count == 0 {
            return Err(VerificationError::Configuration(
                "test_case_count must be greater than 0".to_string(),
            ));
        }

        if self.step_limit == 0 {
            return Err(VerificationError::Configuration(
                "step_limit must be greater than 0".to_string(),
            ));
        }

        for (name, ceiling) in [
            ("max_size_growth", self.max_size_growth),
            ("max_runtime_overhead", self.max_runtime_overhead),
        ] {
            if let Some(value) = ceiling {
                if !value.is_finite() || value < 0.0 {
                    return Err(VerificationError::Configuration(format!(
                        "{name} must be a non-negative percentage, got {value}"
                    )));
                }
            }
        }

        if self.max_runtime_overhead.is_some() && !self.practical_testing_enabled {
            return Err(VerificationError::Configuration(
                "max_runtime_overhead needs practical testing".to_string(),
            ));
        }

        Ok(())
    }
}
