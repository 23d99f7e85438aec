//! Shroud verification engine
//!
//! This crate decides whether a transformed module may be emitted. Every
//! stage is fatal on failure:
//!
//! 1. **Structural checks**: symbols, relocations and block reachability
//! 2. **Metrics**: complexity and size deltas from the emitter layout
//! 3. **Predicate proofs**: exhaustive low-bit evaluation of opaque guards
//! 4. **Practical testing**: emulated equivalence on seeded inputs
//! 5. **Ceilings**: optional size and runtime overhead limits

pub mod certificate;
pub mod config;
pub mod formal;
pub mod orchestrator;
pub mod practical;
pub mod semantics;
pub mod structural;

pub use certificate::{CeilingCheck, VerificationReport};
pub use config::VerificationConfig;
pub use formal::{FormalVerifier, PredicateProof, ProofMethod};
pub use orchestrator::VerificationEngine;
pub use practical::{EquivalenceResults, PracticalTester, SkippedFunction};
pub use structural::StructuralSummary;
pub use shroud_utils::errors::VerificationError;
