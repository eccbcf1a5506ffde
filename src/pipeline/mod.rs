//! Ordered step pipeline with reverse-order cleanup.
//!
//! A [`StepRunner`] holds the steps of one build, assembled once. It runs
//! them strictly in order against a shared [`BuildState`]. The first step
//! that halts stops forward progress and its error is recorded. Every step
//! that ran, the halting one included, is then cleaned up in reverse order.
//! Cleanup also runs after a successful build.

use std::future::Future;
use std::pin::Pin;

use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::digitalocean::Provider;
use crate::error::{BuildError, CleanupError};
use crate::logging::Redactor;
use crate::provision::{Communicator, ProvisionHook};
use crate::state::BuildState;

mod poll;

pub use poll::{PollOutcome, poll_until};

/// Future returned by step operations.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why a step stopped the pipeline.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Halt {
    /// The build was cancelled.
    Cancelled,
    /// The step failed.
    Failed(BuildError),
}

impl Halt {
    /// Converts the halt into the error recorded in the state.
    #[must_use]
    pub fn into_error(self) -> BuildError {
        match self {
            Self::Cancelled => BuildError::Cancelled,
            Self::Failed(err) => err,
        }
    }
}

impl From<BuildError> for Halt {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Cancelled => Self::Cancelled,
            other => Self::Failed(other),
        }
    }
}

/// Outcome of a step's `run`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop the pipeline.
    Halt(Halt),
}

impl StepAction {
    /// Halts with `err`.
    #[must_use]
    pub fn fail(err: impl Into<BuildError>) -> Self {
        Self::Halt(Halt::from(err.into()))
    }

    /// Halts because the build was cancelled.
    #[must_use]
    pub const fn cancelled() -> Self {
        Self::Halt(Halt::Cancelled)
    }
}

impl From<Result<(), BuildError>> for StepAction {
    fn from(result: Result<(), BuildError>) -> Self {
        match result {
            Ok(()) => Self::Continue,
            Err(err) => Self::fail(err),
        }
    }
}

/// Collaborators shared by every step of a build.
#[derive(Clone, Copy)]
pub struct StepContext<'a> {
    /// Cloud provider.
    pub provider: &'a dyn Provider,
    /// Validated configuration.
    pub config: &'a BuildConfig,
    /// Build-scoped cancellation.
    pub cancel: &'a CancelToken,
    /// Reaches the droplet.
    pub communicator: &'a dyn Communicator,
    /// Customises the droplet.
    pub provisioner: &'a dyn ProvisionHook,
    /// Receives secrets minted during the build.
    pub redactor: &'a Redactor,
}

/// One phase of the build.
pub trait Step: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Runs the phase.
    fn run<'a>(&'a self, ctx: StepContext<'a>, state: &'a mut BuildState)
    -> StepFuture<'a, StepAction>;

    /// Undoes what `run` created. Called once for every step that ran.
    fn cleanup<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, Result<(), CleanupError>> {
        let _ = (ctx, state);
        Box::pin(async { Ok(()) })
    }
}

/// Runs an ordered list of steps.
#[derive(Default)]
pub struct StepRunner {
    steps: Vec<Box<dyn Step>>,
}

impl StepRunner {
    /// Creates an empty runner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `step`.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Appends `step` when `include` is true.
    #[must_use]
    pub fn step_if(self, include: bool, step: impl Step + 'static) -> Self {
        if include { self.step(step) } else { self }
    }

    /// Names of the assembled steps, in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|step| step.name()).collect()
    }

    /// Runs every step, then the cleanup cascade.
    ///
    /// The outcome is left in `state`: its error slot holds the halting
    /// error, if any.
    pub async fn run(&self, ctx: StepContext<'_>, state: &mut BuildState) {
        let mut ran = 0_usize;
        for step in &self.steps {
            if ctx.cancel.is_cancelled() {
                warn!(step = step.name(), "build cancelled before step");
                state.record_error(BuildError::Cancelled);
                break;
            }

            info!(step = step.name(), "running step");
            ran += 1;
            if let StepAction::Halt(halt) = step.run(ctx, state).await {
                let err = halt.into_error();
                warn!(step = step.name(), error = %err, "step halted the build");
                state.record_error(err);
                break;
            }
        }

        for step in self.steps.iter().take(ran).rev() {
            if let Err(err) = step.cleanup(ctx, state).await {
                warn!(step = step.name(), error = %err, "cleanup failed");
                state.record_cleanup_error(err);
            }
        }
    }
}

#[cfg(test)]
mod tests;
