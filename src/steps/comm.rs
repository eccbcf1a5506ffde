//! Steps delegated to the communicator and the provisioning hook.

use tracing::info;

use crate::error::BuildError;
use crate::pipeline::{Step, StepAction, StepContext, StepFuture};
use crate::provision::ProvisionError;
use crate::state::BuildState;

use super::connect_target;

/// Resolves the host and waits until the droplet accepts connections.
#[derive(Clone, Copy, Debug, Default)]
pub struct Connect;

impl Step for Connect {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let Some(address) = state.droplet_address else {
                return StepAction::fail(BuildError::MissingState("droplet address"));
            };
            state.connect_host = Some(ctx.communicator.host(address));
            let target = match connect_target(ctx, state) {
                Ok(target) => target,
                Err(err) => return StepAction::fail(err),
            };
            info!(host = %target.host, port = target.port, "connecting");
            match ctx.communicator.connect(&target, ctx.cancel).await {
                Ok(()) => StepAction::Continue,
                Err(ProvisionError::Cancelled) => StepAction::cancelled(),
                Err(err) => StepAction::fail(BuildError::Communicator(err.to_string())),
            }
        })
    }
}

/// Runs the provisioning hook.
#[derive(Clone, Copy, Debug, Default)]
pub struct Provision;

impl Step for Provision {
    fn name(&self) -> &'static str {
        "provision"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let target = match connect_target(ctx, state) {
                Ok(target) => target,
                Err(err) => return StepAction::fail(err),
            };
            match ctx.provisioner.provision(&target, ctx.cancel).await {
                Ok(()) => StepAction::Continue,
                Err(ProvisionError::Cancelled) => StepAction::cancelled(),
                Err(err) => StepAction::fail(BuildError::Provision(err.to_string())),
            }
        })
    }
}
