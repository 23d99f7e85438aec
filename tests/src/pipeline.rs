use crate::fixtures::{init_tracing, main_object, max_program, object, program, verification};
use shroud_core::{decode_object, link_image, FunctionId};
use shroud_transform::{
    obfuscate, parse_pass_order, CancelToken, Event, EventSink, EventState, NullSink, PipelineConfig, RunState,
    Stage,
};
use shroud_utils::errors::ObfuscateError;
use shroud_verification::practical::machine::{Machine, Outcome, Value};
use std::sync::Mutex;

fn config(order: &str, seed: u64) -> PipelineConfig {
    PipelineConfig {
        passes: parse_pass_order(order).unwrap(),
        seed,
        verification: verification(),
        ..PipelineConfig::default()
    }
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl EventSink for Recorder {
    fn emit(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn bogus_and_flatten_scenario() {
    init_tracing();
    let config = config("bogus(10%),flatten(cycles=1)", 1337);
    let result = obfuscate(object(&program()), &config, &NullSink, &CancelToken::new())
        .await
        .unwrap();

    let report = &result.report;
    assert_eq!(report.input_params.seed, 1337);
    assert_eq!(report.input_params.bogus_percent, Some(10));
    assert_eq!(report.input_params.cycles, Some(1));
    let names: Vec<&str> = report.passes.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["bogus", "flatten"]);
    assert_eq!(report.verification.equivalence.as_ref().unwrap().functions_tested, 3);
    assert!(report.verification.validate());
    assert_eq!(report.fingerprints.output.len(), 64);

    let output = decode_object(&result.output).unwrap();
    for name in ["max", "classify", "sum"] {
        assert!(output.function_by_name(name).is_some(), "{name} survives");
    }
    assert_eq!(result.states.last(), Some(&RunState::Done));
}

#[tokio::test]
async fn assembled_main_still_returns_zero() {
    init_tracing();
    let config = config("bogus(10%),flatten(cycles=1)", 7);
    let result = obfuscate(main_object(), &config, &NullSink, &CancelToken::new())
        .await
        .unwrap();
    assert!(result.report.verification.delta.cyclomatic >= 1);

    let module = decode_object(&result.output).unwrap();
    let (index, _) = module
        .functions
        .iter()
        .enumerate()
        .find(|(_, f)| f.name == "main")
        .unwrap();
    let image = link_image(&module).unwrap();
    let entry = image.entry(FunctionId(index)).unwrap();
    let execution = Machine::new(&image).run(entry, &[], 100_000);
    match execution.outcome {
        Outcome::Returned(observation) => assert_eq!(observation.rax, Value::Number(0)),
        other => panic!("main did not return: {other:?}"),
    }
}

#[tokio::test]
async fn equal_seeds_give_identical_objects() {
    let config = config("subst,bogus(50%),flatten(cycles=2),sym", 99);
    let input = object(&program());
    let first = obfuscate(input.clone(), &config, &NullSink, &CancelToken::new())
        .await
        .unwrap();
    let second = obfuscate(input, &config, &NullSink, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(first.output, second.output);
    assert_eq!(first.report.verification.digest, second.report.verification.digest);
}

#[tokio::test]
async fn identity_run_preserves_every_function() {
    let input = object(&program());
    let result = obfuscate(input, &config("", 5), &NullSink, &CancelToken::new())
        .await
        .unwrap();
    let report = &result.report.verification;
    assert!(report.proofs.is_empty());
    assert_eq!(report.delta.code_size, 0);
    let module = decode_object(&result.output).unwrap();
    assert_eq!(module.functions.len(), 3);
}

#[tokio::test]
async fn events_are_monotone_and_complete() {
    let sink = Recorder::default();
    let config = config("bogus(50%),subst", 3);
    let result = obfuscate(object(&max_program()), &config, &sink, &CancelToken::new())
        .await
        .unwrap();

    let events = sink.0.lock().unwrap();
    let pending: Vec<Stage> = events
        .iter()
        .take_while(|e| e.state == EventState::Pending)
        .map(|e| e.event)
        .collect();
    assert_eq!(
        pending,
        vec![
            Stage::InputParams,
            Stage::FileAttrs,
            Stage::BogusAmount,
            Stage::FakeInserted,
            Stage::Verification,
            Stage::DownloadReady
        ]
    );
    let percents: Vec<u8> = events.iter().filter_map(|e| e.payload.as_ref()).map(|p| p.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));

    let file_attrs = events
        .iter()
        .find(|e| e.event == Stage::FileAttrs && e.state == EventState::Done)
        .unwrap();
    assert_eq!(file_attrs.payload.as_ref().unwrap().percent, 20);
    let last = events.last().unwrap();
    assert_eq!(last.event, Stage::DownloadReady);
    assert_eq!(last.payload.as_ref().unwrap().size, Some(result.output.len() as u64));
}

#[tokio::test]
async fn cancelled_before_start_stops_at_the_first_boundary() {
    let token = CancelToken::new();
    token.cancel();
    let err = obfuscate(object(&max_program()), &config("bogus", 1), &NullSink, &token)
        .await
        .unwrap_err();
    assert!(matches!(err.error, ObfuscateError::Cancelled { after_pass: None }));
    assert_eq!(err.exit_code(), 8);
    assert_eq!(err.states.last(), Some(&RunState::Cancelled));
    assert!(err.report.passes.is_empty());
}

#[tokio::test]
async fn size_ceiling_fails_the_run() {
    let mut config = config("bogus(100%),flatten(cycles=2)", 11);
    config.verification.max_size_growth = Some(1.0);
    let err = obfuscate(object(&max_program()), &config, &NullSink, &CancelToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 6);
    assert_eq!(err.report.kind, "verification");
    assert!(err.report.partial_metrics.is_some());
}
