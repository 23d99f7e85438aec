//! The asynchronous pipeline: load, transform, verify, emit.
//!
//! CPU-bound stages run on tokio's blocking pool; the run itself is a plain
//! sequence of awaits. Cancellation is observed before every pass and before
//! verification.

use crate::config::PipelineConfig;
use crate::pass::apply_pass;
use crate::progress::{
    EventSink, ProgressTracker, Stage, DOWNLOAD_READY_PERCENT, FILE_ATTRS_PERCENT, INPUT_PARAMS_PERCENT,
    VERIFICATION_PERCENT,
};
use crate::util::PassStats;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use shroud_analysis::{collect_metrics, Metrics};
use shroud_core::encoder::{emit, measure};
use shroud_core::{decode_object, Module};
use shroud_utils::errors::{EmitError, ObfuscateError};
use shroud_verification::{VerificationEngine, VerificationReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a run is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Loading,
    /// Running the pass at this index.
    Transforming(usize),
    Verifying,
    Emitting,
    Done,
    Failed { stage: String, reason: String },
    Cancelled,
}

impl RunState {
    /// Whether the run can no longer change state.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. } | Self::Cancelled)
    }

    fn stage_name(&self) -> &'static str {
        match self {
            Self::Idle => "config",
            Self::Loading => "loading",
            Self::Transforming(_) => "transforming",
            Self::Verifying => "verifying",
            Self::Emitting => "emitting",
            Self::Done => "done",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the run stops at the next pass boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The configuration a run was started with, seed resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputParams {
    /// Flattening cycles, when `flatten` is in the pass list.
    pub cycles: Option<u8>,
    /// Bogus block percentage, when `bogus` is in the pass list.
    pub bogus_percent: Option<u8>,
    /// Whether `strenc` is in the pass list.
    pub string_encryption: bool,
    /// The seed actually used; never 0.
    pub seed: u64,
    /// Preset level the pass list came from, if any.
    pub level: Option<u8>,
    /// Pass list in textual form, in execution order.
    pub pass_order: Vec<String>,
}

impl InputParams {
    fn new(config: &PipelineConfig, seed: u64) -> Self {
        Self {
            cycles: config.cycles(),
            bogus_percent: config.bogus_percent(),
            string_encryption: config.string_encryption(),
            seed,
            level: config.level,
            pass_order: config.passes.iter().map(ToString::to_string).collect(),
        }
    }
}

/// A pass that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPass {
    /// Short pass name, e.g. `bogus`
    pub name: String,
    /// Textual form with parameters, e.g. `bogus(30%)`
    pub spec: String,
    /// Counters the pass reported
    pub stats: PassStats,
}

/// Byte counts of the input and output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizes {
    /// Size of the input object file
    pub input_bytes: u64,
    /// Size of the emitted object file
    pub output_bytes: u64,
    /// Laid-out code bytes of the input
    pub code_before: u64,
    /// Laid-out code bytes of the output
    pub code_after: u64,
}

/// Keccak-256 hex digests of the input and output files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprints {
    /// Digest of the input bytes
    pub input: String,
    /// Digest of the emitted bytes
    pub output: String,
}

/// Report of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObfuscationReport {
    /// Configuration the run used
    pub input_params: InputParams,
    /// Passes in the order they ran
    pub passes: Vec<AppliedPass>,
    /// Verifier verdict on the final module
    pub verification: VerificationReport,
    /// Byte counts
    pub sizes: Sizes,
    /// File digests
    pub fingerprints: Fingerprints,
    /// Input sections that did not survive re-layout.
    pub dropped_sections: Vec<String>,
    /// RFC 3339 completion time
    pub timestamp: String,
}

/// Output of a successful run.
#[derive(Debug, Clone)]
pub struct ObfuscationResult {
    /// The obfuscated object file
    pub output: Vec<u8>,
    /// What was done and verified
    pub report: ObfuscationReport,
    /// Every state the run went through, `Idle` first.
    pub states: Vec<RunState>,
}

/// What is known about a failed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    /// Run state the failure happened in, e.g. `transforming`
    pub stage: String,
    /// Error message
    pub reason: String,
    /// Error category, e.g. `verification`
    pub kind: String,
    /// Process exit code for this failure
    pub exit_code: i32,
    /// Configuration, once it was accepted
    pub input_params: Option<InputParams>,
    /// Passes that completed before the failure
    pub passes: Vec<AppliedPass>,
    /// Metrics of the last committed module
    pub partial_metrics: Option<Metrics>,
    /// RFC 3339 failure time
    pub timestamp: String,
}

/// A failed run: the error and its report.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ObfuscationError {
    /// What went wrong
    #[source]
    pub error: ObfuscateError,
    /// What was known when it did
    pub report: FailureReport,
    /// Every state the run went through, ending in `Failed` or `Cancelled`
    pub states: Vec<RunState>,
}

impl ObfuscationError {
    /// Process exit code of the underlying error.
    pub const fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

/// Keccak-256 of `bytes`, hex encoded.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Keccak256::digest(bytes))
}

/// Seed for a run: `seed` itself, or a time-derived one for 0.
pub fn resolve_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    let now = chrono::Utc::now();
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());
    (nanos as u64).max(1)
}

fn partial_metrics(module: &Module) -> Option<Metrics> {
    let size = measure(module).ok()?;
    collect_metrics(module, size).ok()
}

async fn blocking<T, F>(work: F) -> Result<T, ObfuscateError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ObfuscateError::Internal(format!("worker task failed: {e}")))
}

/// Bookkeeping shared by the stages of one run.
struct Run<'a> {
    config: &'a PipelineConfig,
    cancel: &'a CancelToken,
    tracker: ProgressTracker<'a>,
    states: Vec<RunState>,
    stage: Stage,
    params: Option<InputParams>,
    passes: Vec<AppliedPass>,
    /// Latest committed module, for partial metrics.
    latest: Option<Arc<Module>>,
}

impl Run<'_> {
    fn enter(&mut self, state: RunState) {
        debug!(from = ?self.states.last(), to = ?state, "run state");
        self.states.push(state);
    }

    fn state(&self) -> &RunState {
        self.states.last().unwrap_or(&RunState::Idle)
    }

    fn check_cancelled(&mut self) -> Result<(), ObfuscateError> {
        if !self.cancel.is_cancelled() {
            return Ok(());
        }
        let after_pass = self.passes.last().map(|p| p.name.clone());
        info!(after = ?after_pass, "run cancelled");
        Err(ObfuscateError::Cancelled { after_pass })
    }

    fn fail(mut self, error: ObfuscateError) -> ObfuscationError {
        let stage = self.state().stage_name().to_string();
        let reason = error.to_string();
        if matches!(error, ObfuscateError::Cancelled { .. }) {
            self.tracker.failed(self.stage, reason.clone());
            self.enter(RunState::Cancelled);
        } else {
            warn!(stage = %stage, kind = error.kind(), "{reason}");
            self.tracker.failed(self.stage, reason.clone());
            self.enter(RunState::Failed {
                stage: stage.clone(),
                reason: reason.clone(),
            });
        }
        let report = FailureReport {
            stage,
            reason,
            kind: error.kind().to_string(),
            exit_code: error.exit_code(),
            input_params: self.params,
            passes: self.passes,
            partial_metrics: self.latest.as_deref().and_then(partial_metrics),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        ObfuscationError {
            error,
            report,
            states: self.states,
        }
    }

    async fn execute(&mut self, input: Arc<Vec<u8>>) -> Result<(Vec<u8>, ObfuscationReport), ObfuscateError> {
        let config = self.config;
        config.validate()?;
        let seed = resolve_seed(config.seed);
        self.params = Some(InputParams::new(config, seed));
        self.tracker.announce();
        self.tracker.done(Stage::InputParams, INPUT_PARAMS_PERCENT, None, None);
        info!(seed, passes = config.passes.len(), "starting run");

        self.enter(RunState::Loading);
        self.stage = Stage::FileAttrs;
        let bytes = Arc::clone(&input);
        let original = Arc::new(blocking(move || decode_object(&bytes)).await??);
        self.latest = Some(Arc::clone(&original));
        self.tracker
            .done(Stage::FileAttrs, FILE_ATTRS_PERCENT, Some(input.len() as u64), None);
        info!(
            functions = original.functions.len(),
            instructions = original.instruction_count(),
            "loaded object"
        );

        let engine = Arc::new(VerificationEngine::new(config.verification.clone()));
        let mut module = (*original).clone();
        for (index, spec) in config.passes.iter().copied().enumerate() {
            self.check_cancelled()?;
            self.enter(RunState::Transforming(index));
            self.stage = Stage::for_pass(&spec);
            let percent = self.tracker.pass_percent(index);
            self.tracker.running(self.stage, percent, Some(spec.name()));

            let (next, result) = blocking(move || apply_pass(module, &spec, seed, index)).await?;
            let stats = result?;
            let next = Arc::new(next);
            self.latest = Some(Arc::clone(&next));
            self.passes.push(AppliedPass {
                name: spec.name().to_string(),
                spec: spec.to_string(),
                stats,
            });
            if config.verify_each_pass {
                let (engine, before, after) = (Arc::clone(&engine), Arc::clone(&original), Arc::clone(&next));
                blocking(move || engine.verify(&before, &after)).await??;
                debug!(pass = spec.name(), "intermediate verification passed");
            }
            module = Arc::unwrap_or_clone(next);
            let percent = self.tracker.pass_percent(index + 1);
            self.tracker.done(self.stage, percent, None, Some(spec.name()));
        }

        self.check_cancelled()?;
        self.enter(RunState::Verifying);
        self.stage = Stage::Verification;
        self.tracker.running(Stage::Verification, VERIFICATION_PERCENT, None);
        let module = Arc::new(module);
        let (before, after) = (Arc::clone(&original), Arc::clone(&module));
        let verification = blocking(move || engine.verify(&before, &after)).await??;
        self.tracker.done(Stage::Verification, VERIFICATION_PERCENT, None, None);

        self.enter(RunState::Emitting);
        self.stage = Stage::DownloadReady;
        let options = config.emit;
        let emitted = Arc::clone(&module);
        let output = blocking(move || -> Result<Vec<u8>, EmitError> {
            let bytes = emit(&emitted, &options)?;
            decode_object(&bytes).map_err(|e| EmitError::SelfCheck(e.to_string()))?;
            Ok(bytes)
        })
        .await??;
        self.tracker.done(
            Stage::DownloadReady,
            DOWNLOAD_READY_PERCENT,
            Some(output.len() as u64),
            None,
        );

        let report = ObfuscationReport {
            input_params: InputParams::new(config, seed),
            passes: self.passes.clone(),
            sizes: Sizes {
                input_bytes: input.len() as u64,
                output_bytes: output.len() as u64,
                code_before: verification.metrics_before.code_size,
                code_after: verification.metrics_after.code_size,
            },
            verification,
            fingerprints: Fingerprints {
                input: fingerprint(&input),
                output: fingerprint(&output),
            },
            dropped_sections: module.dropped_sections.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.enter(RunState::Done);
        info!(
            input = report.sizes.input_bytes,
            output = report.sizes.output_bytes,
            "run complete"
        );
        Ok((output, report))
    }
}

/// Runs the whole pipeline on an ELF relocatable object.
pub async fn obfuscate(
    input: Vec<u8>,
    config: &PipelineConfig,
    sink: &dyn EventSink,
    cancel: &CancelToken,
) -> Result<ObfuscationResult, ObfuscationError> {
    let mut run = Run {
        config,
        cancel,
        tracker: ProgressTracker::new(sink, &config.passes),
        states: vec![RunState::Idle],
        stage: Stage::InputParams,
        params: None,
        passes: Vec::new(),
        latest: None,
    };
    match run.execute(Arc::new(input)).await {
        Ok((output, report)) => Ok(ObfuscationResult {
            output,
            report,
            states: run.states,
        }),
        Err(error) => Err(run.fail(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_pass_order, PassSpec};
    use crate::progress::{Event, EventState, NullSink};
    use crate::test_support::max_module;
    use shroud_core::encoder::EmitOptions;
    use std::sync::Mutex;

    fn max_object() -> Vec<u8> {
        emit(&max_module(), &EmitOptions::default()).unwrap()
    }

    fn config(order: &str) -> PipelineConfig {
        PipelineConfig {
            passes: parse_pass_order(order).unwrap(),
            seed: 42,
            ..PipelineConfig::default()
        }
    }

    /// Records events and cancels once a given pass reports done.
    struct CancelAfter {
        events: Mutex<Vec<Event>>,
        pass: Option<&'static str>,
        token: CancelToken,
    }

    impl EventSink for CancelAfter {
        fn emit(&self, event: Event) {
            let finished = event.state == EventState::Done
                && event.payload.as_ref().and_then(|p| p.pass.as_deref()) == self.pass;
            if finished && self.pass.is_some() {
                self.token.cancel();
            }
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn identity_run_walks_every_state() {
        let token = CancelToken::new();
        let sink = CancelAfter {
            events: Mutex::default(),
            pass: None,
            token: token.clone(),
        };
        let result = obfuscate(max_object(), &config(""), &sink, &token).await.unwrap();
        assert_eq!(
            result.states,
            vec![
                RunState::Idle,
                RunState::Loading,
                RunState::Verifying,
                RunState::Emitting,
                RunState::Done
            ]
        );
        assert_eq!(result.report.input_params.seed, 42);
        assert_eq!(result.report.fingerprints.input.len(), 64);
        decode_object(&result.output).unwrap();

        let events = sink.events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event, Stage::DownloadReady);
        assert_eq!(last.payload.as_ref().unwrap().percent, 100);
        assert_eq!(last.payload.as_ref().unwrap().size, Some(result.output.len() as u64));
        let percents: Vec<u8> = events.iter().filter_map(|e| e.payload.as_ref()).map(|p| p.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_pass() {
        let token = CancelToken::new();
        let sink = CancelAfter {
            events: Mutex::default(),
            pass: Some("subst"),
            token: token.clone(),
        };
        let err = obfuscate(max_object(), &config("subst,bogus(50%)"), &sink, &token)
            .await
            .unwrap_err();
        assert!(matches!(
            &err.error,
            ObfuscateError::Cancelled { after_pass: Some(pass) } if pass == "subst"
        ));
        assert_eq!(err.exit_code(), 8);
        assert_eq!(err.states.last(), Some(&RunState::Cancelled));
        assert!(!err.states.contains(&RunState::Transforming(1)));
        assert_eq!(err.report.passes.len(), 1);
        assert!(err.report.partial_metrics.is_some());

        let events = sink.events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.state, EventState::Failed);
        assert_eq!(last.message.as_deref(), Some("run cancelled after pass `subst`"));
    }

    #[tokio::test]
    async fn garbage_input_is_a_parse_failure() {
        let err = obfuscate(b"not an object".to_vec(), &config("bogus"), &NullSink, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert_eq!(err.report.stage, "loading");
        assert_eq!(err.report.kind, "parse");
        assert!(err.report.partial_metrics.is_none());
    }

    #[tokio::test]
    async fn invalid_configuration_fails_before_loading() {
        let mut bad = config("bogus");
        bad.passes.push(PassSpec::Bogus { percent: 5 });
        let err = obfuscate(max_object(), &bad, &NullSink, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.report.stage, "config");
        assert!(err.report.input_params.is_none());
    }

    #[test]
    fn zero_seed_is_replaced() {
        assert_ne!(resolve_seed(0), 0);
        assert_eq!(resolve_seed(9), 9);
    }
}
