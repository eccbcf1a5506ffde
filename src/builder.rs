//! Drives one droplet-to-snapshot build end to end.
//!
//! The builder validates snapshot regions before touching anything, then
//! assembles the step pipeline once from the configuration and runs it.
//! Cleanup of every step that ran happens inside the runner, so by the time
//! [`Builder::run`] returns the temporary key has been removed from the
//! account whether the build succeeded or not.

use tracing::{info, warn};

use crate::artifact::Artifact;
use crate::cancel::CancelToken;
use crate::config::BuildConfig;
use crate::digitalocean::Provider;
use crate::error::BuildError;
use crate::logging::Redactor;
use crate::pipeline::{StepContext, StepRunner};
use crate::provision::{Communicator, ProvisionHook};
use crate::state::BuildState;
use crate::steps::transfer::validate_snapshot_regions;
use crate::steps::{
    CleanupTempKey, Connect, CreateInstance, CreateKey, DumpKey, KeyGen, PowerOff, Provision,
    Shutdown, Snapshot, WaitReady,
};

/// Builds a snapshot from a temporary droplet.
#[derive(Debug)]
pub struct Builder<P, C, H> {
    provider: P,
    communicator: C,
    provisioner: H,
    config: BuildConfig,
    redactor: Redactor,
    cancel: CancelToken,
}

impl<P, C, H> Builder<P, C, H>
where
    P: Provider,
    C: Communicator,
    H: ProvisionHook,
{
    /// Creates a builder with a fresh cancellation token and redactor.
    #[must_use]
    pub fn new(provider: P, communicator: C, provisioner: H, config: BuildConfig) -> Self {
        Self {
            provider,
            communicator,
            provisioner,
            config,
            redactor: Redactor::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Shares `redactor` with the build so secrets it mints are masked by
    /// the log writer built from the same redactor.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Handle used to cancel the build from another task.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Assembles the pipeline for the current configuration.
    #[must_use]
    pub fn pipeline(&self) -> StepRunner {
        let temporary_key = self.config.needs_temporary_key();
        StepRunner::new()
            .step_if(temporary_key, KeyGen)
            .step_if(temporary_key && self.config.dumps_temporary_key(), DumpKey)
            .step_if(temporary_key, CreateKey)
            .step(CreateInstance)
            .step(WaitReady)
            .step(Connect)
            .step(Provision)
            .step_if(temporary_key, CleanupTempKey)
            .step(Shutdown)
            .step(PowerOff)
            .step(Snapshot)
    }

    async fn preflight(&self) -> Result<(), BuildError> {
        if self.config.snapshot_regions.is_empty() {
            return Ok(());
        }
        let regions = self.provider.list_regions().await?;
        validate_snapshot_regions(&regions, &self.config.region, &self.config.snapshot_regions)
    }

    /// Runs the build.
    ///
    /// # Errors
    ///
    /// Returns the first error recorded by the pipeline, or the pre-flight
    /// failure when a configured region does not exist.
    pub async fn run(&self) -> Result<Artifact, BuildError> {
        self.redactor.register(self.config.token.clone());
        self.preflight().await?;

        let ctx = StepContext {
            provider: &self.provider,
            config: &self.config,
            cancel: &self.cancel,
            communicator: &self.communicator,
            provisioner: &self.provisioner,
            redactor: &self.redactor,
        };
        let runner = self.pipeline();
        info!(steps = ?runner.names(), "starting build");

        let mut state = BuildState::new();
        runner.run(ctx, &mut state).await;

        for err in state.cleanup_errors() {
            warn!(error = %err, "resource left behind");
        }
        if let Some(err) = state.take_error() {
            return Err(err);
        }
        let artifact = Artifact::from_state(&state)?;
        info!(%artifact, "build finished");
        Ok(artifact)
    }
}
