//! Progress events of a run.
//!
//! A run announces every stage it plans as `pending`, then reports each one
//! as `running` and `done` (or `failed`). Percentages never go backwards.

use crate::config::PassSpec;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// Percent reported when the input parameters are accepted.
pub const INPUT_PARAMS_PERCENT: u8 = 8;
/// Percent reported once the input is loaded; passes start here.
pub const FILE_ATTRS_PERCENT: u8 = 20;
/// Share of the percentage range spread over the passes.
pub const PASS_SPAN: u8 = 62;
/// Percent reported around verification.
pub const VERIFICATION_PERCENT: u8 = 92;
/// Percent of the final event, which carries the output size.
pub const DOWNLOAD_READY_PERCENT: u8 = 100;

/// Stage key of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    InputParams,
    FileAttrs,
    BogusAmount,
    CyclesCompleted,
    StringEnc,
    FakeInserted,
    Verification,
    DownloadReady,
}

impl Stage {
    /// Wire name of the stage.
    pub const fn key(self) -> &'static str {
        match self {
            Self::InputParams => "inputParams",
            Self::FileAttrs => "fileAttrs",
            Self::BogusAmount => "bogusAmount",
            Self::CyclesCompleted => "cyclesCompleted",
            Self::StringEnc => "stringEnc",
            Self::FakeInserted => "fakeInserted",
            Self::Verification => "verification",
            Self::DownloadReady => "downloadReady",
        }
    }

    /// Stage a pass reports under.
    pub const fn for_pass(spec: &PassSpec) -> Self {
        match spec {
            PassSpec::Bogus { .. } => Self::BogusAmount,
            PassSpec::Flatten { .. } => Self::CyclesCompleted,
            PassSpec::StringEncrypt => Self::StringEnc,
            PassSpec::Subst { .. } | PassSpec::AntiDebug | PassSpec::SymbolRename => Self::FakeInserted,
        }
    }
}

/// Where a stage is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventState {
    Pending,
    Running,
    Done,
    Failed,
}

/// Measurements attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    /// Overall progress, 0 to 100, never decreasing
    pub percent: u8,
    /// Output size in bytes, on the final event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Name of the pass the event is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Stage the event is about
    pub event: Stage,
    /// New state of that stage
    pub state: EventState,
    /// Extra data on `done` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    /// Failure reason, on `failed` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Receiver of progress events. Called synchronously from the run.
pub trait EventSink: Send + Sync {
    /// Delivers one event.
    fn emit(&self, event: Event);
}

impl EventSink for UnboundedSender<Event> {
    fn emit(&self, event: Event) {
        if self.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Turns run milestones into events with monotone percentages.
pub struct ProgressTracker<'a> {
    sink: &'a dyn EventSink,
    passes: Vec<PassSpec>,
    percent: u8,
}

impl<'a> ProgressTracker<'a> {
    /// Tracker for a run executing `passes`.
    pub fn new(sink: &'a dyn EventSink, passes: &[PassSpec]) -> Self {
        Self {
            sink,
            passes: passes.to_vec(),
            percent: 0,
        }
    }

    /// Stages of the run in order, each listed once.
    pub fn planned(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::InputParams, Stage::FileAttrs];
        for pass in &self.passes {
            let stage = Stage::for_pass(pass);
            if !stages.contains(&stage) {
                stages.push(stage);
            }
        }
        stages.extend([Stage::Verification, Stage::DownloadReady]);
        stages
    }

    /// Announces every planned stage as pending.
    pub fn announce(&mut self) {
        for stage in self.planned() {
            self.sink.emit(Event {
                event: stage,
                state: EventState::Pending,
                payload: None,
                message: None,
            });
        }
    }

    /// Percent at the start of pass `index`.
    pub fn pass_percent(&self, index: usize) -> u8 {
        let total = self.passes.len().max(1);
        let share = usize::from(PASS_SPAN) * index.min(total) / total;
        FILE_ATTRS_PERCENT + share as u8
    }

    fn send(&mut self, stage: Stage, state: EventState, percent: u8, size: Option<u64>, pass: Option<&str>) {
        self.percent = self.percent.max(percent.min(DOWNLOAD_READY_PERCENT));
        self.sink.emit(Event {
            event: stage,
            state,
            payload: Some(Payload {
                percent: self.percent,
                size,
                pass: pass.map(str::to_string),
            }),
            message: None,
        });
    }

    /// Reports `stage` as running.
    pub fn running(&mut self, stage: Stage, percent: u8, pass: Option<&str>) {
        self.send(stage, EventState::Running, percent, None, pass);
    }

    /// Reports `stage` as done.
    pub fn done(&mut self, stage: Stage, percent: u8, size: Option<u64>, pass: Option<&str>) {
        self.send(stage, EventState::Done, percent, size, pass);
    }

    /// Reports `stage` as failed with `message`; keeps the last percentage.
    pub fn failed(&mut self, stage: Stage, message: String) {
        self.sink.emit(Event {
            event: stage,
            state: EventState::Failed,
            payload: Some(Payload {
                percent: self.percent,
                size: None,
                pass: None,
            }),
            message: Some(message),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_pass_order;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl EventSink for Recorder {
        fn emit(&self, event: Event) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn pending_stages_follow_pass_mapping() {
        let passes = parse_pass_order("subst,bogus(10%),sym,flatten").unwrap();
        let recorder = Recorder::default();
        let mut tracker = ProgressTracker::new(&recorder, &passes);
        tracker.announce();
        let keys: Vec<&str> = recorder.0.lock().unwrap().iter().map(|e| e.event.key()).collect();
        assert_eq!(
            keys,
            [
                "inputParams",
                "fileAttrs",
                "fakeInserted",
                "bogusAmount",
                "cyclesCompleted",
                "verification",
                "downloadReady"
            ]
        );
    }

    #[test]
    fn percentages_never_decrease() {
        let passes = parse_pass_order("bogus,flatten").unwrap();
        let recorder = Recorder::default();
        let mut tracker = ProgressTracker::new(&recorder, &passes);
        assert_eq!(tracker.pass_percent(0), 20);
        assert_eq!(tracker.pass_percent(1), 51);
        assert_eq!(tracker.pass_percent(2), 82);
        tracker.done(Stage::FileAttrs, FILE_ATTRS_PERCENT, Some(10), None);
        tracker.running(Stage::InputParams, INPUT_PARAMS_PERCENT, None);
        let events = recorder.0.lock().unwrap();
        assert_eq!(events[1].payload.as_ref().unwrap().percent, 20);
    }

    #[test]
    fn events_serialize_with_stage_keys() {
        let event = Event {
            event: Stage::DownloadReady,
            state: EventState::Done,
            payload: Some(Payload {
                percent: 100,
                size: Some(512),
                pass: None,
            }),
            message: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "downloadReady", "state": "done", "payload": {"percent": 100, "size": 512}})
        );
    }

    #[tokio::test]
    async fn channel_sender_is_a_sink() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut tracker = ProgressTracker::new(&tx, &[]);
        tracker.running(Stage::InputParams, INPUT_PARAMS_PERCENT, None);
        drop(tracker);
        drop(tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, EventState::Running);
        assert!(rx.recv().await.is_none());
    }
}
