//! Error types shared by the front end and the pipeline.

use thiserror::Error;

/// Error type for loading a relocatable object into a module.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The underlying object reader rejected the file.
    #[error("malformed object file: {0}")]
    Object(#[from] object::Error),
    /// The ELF header is truncated or inconsistent.
    #[error("truncated or malformed header: {0}")]
    Header(String),
    /// The file is not an ELF64 relocatable object.
    #[error("unsupported object format: {0}")]
    UnsupportedFormat(String),
    /// The object targets an architecture other than x86-64.
    #[error("unsupported target architecture: {0}")]
    UnsupportedArchitecture(String),
    /// A relocation cannot be represented or remapped.
    #[error("unsupported relocation type {r_type} at {section}+{offset:#x}: {reason}")]
    UnsupportedRelocation {
        section: String,
        offset: u64,
        r_type: u32,
        reason: String,
    },
    /// Bytes inside a function do not decode as an instruction.
    #[error("undecodable instruction in `{function}` at {offset:#x}")]
    InvalidInstruction { function: String, offset: u64 },
    /// The input uses a construct the engine cannot rewrite safely.
    #[error("unsupported construct in {context}: {reason}")]
    Unsupported { context: String, reason: String },
    /// Structural inconsistency found after reading.
    #[error("malformed object: {0}")]
    Malformed(String),

    #[error("could not read file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error type for metrics computation.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("module contains no functions")]
    EmptyModule,
    #[error("function `{0}` has no blocks")]
    NoBlocks(String),
}

/// Error type for transform operations.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A pass could not uphold its invariants on this module.
    #[error("pass `{pass}` failed: {reason}")]
    Invariant { pass: String, reason: String },
    /// A pass failed on one specific function.
    #[error("pass `{pass}` failed in `{function}`: {reason}")]
    Function {
        pass: String,
        function: String,
        reason: String,
    },
    #[error("instruction construction failed: {0}")]
    Encoding(#[from] iced_x86::IcedError),
    #[error("metrics computation failed: {0}")]
    Metrics(#[from] MetricsError),
}

impl TransformError {
    /// Builds an [`TransformError::Invariant`] for `pass`.
    pub fn invariant(pass: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invariant {
            pass: pass.into(),
            reason: reason.into(),
        }
    }

    /// Name of the failing pass, when known.
    pub fn pass(&self) -> Option<&str> {
        match self {
            Self::Invariant { pass, .. } | Self::Function { pass, .. } => Some(pass),
            _ => None,
        }
    }
}

/// Errors raised while serializing a module back into an object file.
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("object writer failed: {0}")]
    Object(#[from] object::write::Error),
    #[error("instruction encoding failed: {0}")]
    Encoding(#[from] iced_x86::IcedError),
    /// A code reference points at an offset that no longer starts an instruction.
    #[error("unresolved code target in `{function}` at original offset {offset:#x}")]
    UnresolvedTarget { function: String, offset: u64 },
    #[error("block {block} of `{function}` has no address")]
    UnresolvedBlock { function: String, block: usize },
    #[error("symbol #{0} is not part of the module")]
    UnresolvedSymbol(usize),
    /// A branch without a near form cannot reach its target.
    #[error("branch in `{function}` block {block} is out of range")]
    BranchOutOfRange { function: String, block: usize },
    /// Layout and final encoding disagree on an instruction length.
    #[error("layout mismatch in `{function}`: planned {expected} bytes, encoded {actual}")]
    LayoutMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },
    #[error("relocated field not found in `{function}` at {offset:#x}")]
    RelocationField { function: String, offset: u64 },
    /// The emitted object failed to load again.
    #[error("emitted object failed self-check: {0}")]
    SelfCheck(String),
    /// A relocation cannot be resolved when linking an in-memory image.
    #[error("cannot link relocation type {r_type} at {offset:#x}: {reason}")]
    Link {
        r_type: u32,
        offset: u64,
        reason: String,
    },
}

/// Post-transform correctness violations. Always fatal.
#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("symbol `{symbol}` changed: {reason}")]
    SymbolMismatch { symbol: String, reason: String },
    #[error("relocation integrity violated: {0}")]
    RelocationIntegrity(String),
    #[error("original block {block} of `{function}` is no longer reachable")]
    Unreachable { function: String, block: usize },
    #[error("dead block {block} of `{function}` is reachable")]
    DeadPathReachable { function: String, block: usize },
    #[error("opaque predicate at block {block} of `{function}` not proven: {reason}")]
    OpaquePredicate {
        function: String,
        block: usize,
        reason: String,
    },
    #[error("`{function}` diverges on input {input}: {reason}")]
    EquivalenceFailed {
        function: String,
        input: String,
        reason: String,
    },
    #[error("{metric} of {measured:.2}% exceeds ceiling {ceiling:.2}%")]
    CeilingExceeded {
        metric: String,
        measured: f64,
        ceiling: f64,
    },
    #[error("verification configuration error: {0}")]
    Configuration(String),
    #[error("metrics computation failed: {0}")]
    Metrics(#[from] MetricsError),
    #[error("size measurement failed: {0}")]
    Layout(#[from] EmitError),
}

/// Invalid pass order or parameters.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown pass `{0}`")]
    UnknownPass(String),
    #[error("invalid parameter for `{pass}`: {reason}")]
    InvalidParameter { pass: String, reason: String },
    #[error("pass `{0}` listed more than once")]
    DuplicatePass(String),
    #[error("conflicting options: {0}")]
    Conflict(String),
    #[error("pass `{pass}` requires the `{feature}` feature")]
    FeatureDisabled { pass: String, feature: String },
    #[error("obfuscation level {0} is out of range (0-4)")]
    InvalidLevel(u8),
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not read config '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can end an obfuscation run.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),
    #[error("emit error: {0}")]
    Emit(#[from] EmitError),
    /// Cancellation was observed at a pass boundary.
    #[error("run cancelled{}", cancelled_suffix(.after_pass))]
    Cancelled { after_pass: Option<String> },
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

fn cancelled_suffix(after_pass: &Option<String>) -> String {
    after_pass
        .as_deref()
        .map(|pass| format!(" after pass `{pass}`"))
        .unwrap_or_default()
}

impl ObfuscateError {
    /// Stable process exit code per failure kind.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 3,
            Self::Parse(_) => 4,
            Self::Transform(_) => 5,
            Self::Verification(_) => 6,
            Self::Emit(_) => 7,
            Self::Cancelled { .. } => 8,
            Self::Io(_) => 9,
            Self::Serialize(_) | Self::Internal(_) => 1,
        }
    }

    /// Short machine-readable name of the failure kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Parse(_) => "parse",
            Self::Transform(_) => "transform",
            Self::Verification(_) => "verification",
            Self::Emit(_) => "emit",
            Self::Cancelled { .. } => "cancelled",
            Self::Io(_) => "io",
            Self::Serialize(_) => "serialize",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_kind() {
        let errors = [
            ObfuscateError::from(ConfigError::UnknownPass("x".into())),
            ObfuscateError::from(ParseError::Malformed("x".into())),
            ObfuscateError::from(TransformError::invariant("bogus", "x")),
            ObfuscateError::from(VerificationError::Configuration("x".into())),
            ObfuscateError::from(EmitError::SelfCheck("x".into())),
            ObfuscateError::Cancelled { after_pass: None },
        ];
        let codes: Vec<i32> = errors.iter().map(ObfuscateError::exit_code).collect();
        assert_eq!(codes, vec![3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn cancelled_message_names_pass() {
        let err = ObfuscateError::Cancelled {
            after_pass: Some("bogus".into()),
        };
        assert_eq!(err.to_string(), "run cancelled after pass `bogus`");
        assert_eq!(
            ObfuscateError::Cancelled { after_pass: None }.to_string(),
            "run cancelled"
        );
    }

    #[test]
    fn transform_error_reports_pass() {
        let err = TransformError::Function {
            pass: "flatten".into(),
            function: "main".into(),
            reason: "indirect branch".into(),
        };
        assert_eq!(err.pass(), Some("flatten"));
    }
}
