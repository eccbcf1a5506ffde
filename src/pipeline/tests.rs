//! Unit tests for the step runner.

use std::sync::{Arc, Mutex};

use rstest::{fixture, rstest};

use super::*;
use crate::config::BuildConfig;
use crate::test_support::{RecordingCommunicator, RecordingHook, ScriptedProvider, build_config};

type Journal = Arc<Mutex<Vec<String>>>;

fn entries(journal: &Journal) -> Vec<String> {
    journal
        .lock()
        .unwrap_or_else(|err| panic!("journal lock: {err}"))
        .clone()
}

fn note(journal: &Journal, entry: String) {
    journal
        .lock()
        .unwrap_or_else(|err| panic!("journal lock: {err}"))
        .push(entry);
}

enum Outcome {
    Continue,
    Fail(BuildError),
    Cancel,
}

struct Recorder {
    name: &'static str,
    journal: Journal,
    outcome: Outcome,
    cleanup_fails: bool,
}

impl Recorder {
    fn ok(name: &'static str, journal: &Journal) -> Self {
        Self {
            name,
            journal: Arc::clone(journal),
            outcome: Outcome::Continue,
            cleanup_fails: false,
        }
    }

    fn failing(name: &'static str, journal: &Journal, err: BuildError) -> Self {
        Self {
            outcome: Outcome::Fail(err),
            ..Self::ok(name, journal)
        }
    }

    fn cancelling(name: &'static str, journal: &Journal) -> Self {
        Self {
            outcome: Outcome::Cancel,
            ..Self::ok(name, journal)
        }
    }

    fn with_failing_cleanup(mut self) -> Self {
        self.cleanup_fails = true;
        self
    }
}

impl Step for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        _state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            note(&self.journal, format!("run {}", self.name));
            match &self.outcome {
                Outcome::Continue => StepAction::Continue,
                Outcome::Fail(err) => StepAction::fail(err.clone()),
                Outcome::Cancel => {
                    ctx.cancel.cancel();
                    StepAction::Continue
                }
            }
        })
    }

    fn cleanup<'a>(
        &'a self,
        _ctx: StepContext<'a>,
        _state: &'a mut BuildState,
    ) -> StepFuture<'a, Result<(), CleanupError>> {
        Box::pin(async move {
            note(&self.journal, format!("cleanup {}", self.name));
            if self.cleanup_fails {
                return Err(CleanupError::new(self.name, "still there"));
            }
            Ok(())
        })
    }
}

struct Harness {
    provider: ScriptedProvider,
    config: BuildConfig,
    cancel: CancelToken,
    communicator: RecordingCommunicator,
    provisioner: RecordingHook,
    redactor: Redactor,
}

impl Harness {
    fn ctx(&self) -> StepContext<'_> {
        StepContext {
            provider: &self.provider,
            config: &self.config,
            cancel: &self.cancel,
            communicator: &self.communicator,
            provisioner: &self.provisioner,
            redactor: &self.redactor,
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness {
        provider: ScriptedProvider::new(),
        config: build_config(),
        cancel: CancelToken::new(),
        communicator: RecordingCommunicator::new(),
        provisioner: RecordingHook::new(),
        redactor: Redactor::new(),
    }
}

#[fixture]
fn journal() -> Journal {
    Journal::default()
}

#[rstest]
#[tokio::test]
async fn success_runs_in_order_then_cleans_up_in_reverse(harness: Harness, journal: Journal) {
    let runner = StepRunner::new()
        .step(Recorder::ok("a", &journal))
        .step(Recorder::ok("b", &journal))
        .step(Recorder::ok("c", &journal));
    let mut state = BuildState::new();

    runner.run(harness.ctx(), &mut state).await;

    assert!(!state.is_halted());
    assert_eq!(
        entries(&journal),
        ["run a", "run b", "run c", "cleanup c", "cleanup b", "cleanup a"]
    );
}

#[rstest]
#[tokio::test]
async fn halting_step_stops_forward_progress_and_is_cleaned_up(
    harness: Harness,
    journal: Journal,
) {
    let runner = StepRunner::new()
        .step(Recorder::ok("a", &journal))
        .step(Recorder::failing(
            "b",
            &journal,
            BuildError::Provision(String::from("boom")),
        ))
        .step(Recorder::ok("c", &journal));
    let mut state = BuildState::new();

    runner.run(harness.ctx(), &mut state).await;

    assert_eq!(
        state.error(),
        Some(&BuildError::Provision(String::from("boom")))
    );
    assert_eq!(
        entries(&journal),
        ["run a", "run b", "cleanup b", "cleanup a"]
    );
}

#[rstest]
#[tokio::test]
async fn cleanup_failure_is_recorded_without_replacing_the_error(
    harness: Harness,
    journal: Journal,
) {
    let runner = StepRunner::new()
        .step(Recorder::ok("a", &journal).with_failing_cleanup())
        .step(Recorder::failing(
            "b",
            &journal,
            BuildError::MissingState("droplet"),
        ));
    let mut state = BuildState::new();

    runner.run(harness.ctx(), &mut state).await;

    assert_eq!(state.error(), Some(&BuildError::MissingState("droplet")));
    assert_eq!(
        state.cleanup_errors(),
        [CleanupError::new("a", "still there")]
    );
    assert_eq!(entries(&journal).last().map(String::as_str), Some("cleanup a"));
}

#[rstest]
#[tokio::test]
async fn cancellation_between_steps_halts_before_the_next_one(
    harness: Harness,
    journal: Journal,
) {
    let runner = StepRunner::new()
        .step(Recorder::cancelling("a", &journal))
        .step(Recorder::ok("b", &journal));
    let mut state = BuildState::new();

    runner.run(harness.ctx(), &mut state).await;

    assert_eq!(state.error(), Some(&BuildError::Cancelled));
    assert_eq!(entries(&journal), ["run a", "cleanup a"]);
}

#[rstest]
fn step_if_skips_excluded_steps(journal: Journal) {
    let runner = StepRunner::new()
        .step_if(false, Recorder::ok("keygen", &journal))
        .step(Recorder::ok("create", &journal))
        .step_if(true, Recorder::ok("wait", &journal));

    assert_eq!(runner.names(), ["create", "wait"]);
}

#[test]
fn cancelled_build_error_maps_to_cancelled_halt() {
    assert_eq!(
        StepAction::fail(BuildError::Cancelled),
        StepAction::cancelled()
    );
    assert_eq!(
        StepAction::from(Err::<(), _>(BuildError::MissingState("x"))),
        StepAction::Halt(Halt::Failed(BuildError::MissingState("x")))
    );
}
