//! Graceful shutdown followed by a guaranteed power-off.

use tracing::{info, warn};

use crate::digitalocean::{ActionStatus, DropletAction, DropletStatus};
use crate::error::{BuildError, TimeoutPhase};
use crate::pipeline::{PollOutcome, Step, StepAction, StepContext, StepFuture, poll_until};
use crate::state::BuildState;

/// Requests a graceful shutdown and waits for the action to settle. Any
/// failure here is logged and left for [`PowerOff`] to resolve.
#[derive(Clone, Copy, Debug, Default)]
pub struct Shutdown;

impl Step for Shutdown {
    fn name(&self) -> &'static str {
        "shutdown"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let droplet_id = match state.require_droplet() {
                Ok(droplet) => droplet.id,
                Err(err) => return StepAction::fail(err),
            };
            info!(droplet_id, "requesting graceful shutdown");
            let action = match ctx
                .provider
                .droplet_action(droplet_id, &DropletAction::Shutdown)
                .await
            {
                Ok(action) => action,
                Err(err) => {
                    warn!(droplet_id, error = %err, "shutdown request failed; forcing power off");
                    return StepAction::Continue;
                }
            };

            let action_id = action.id;
            let provider = ctx.provider;
            let config = ctx.config;
            let outcome = poll_until(
                ctx.cancel,
                config.state_timeout,
                config.poll_interval,
                || async move {
                    let current = provider.get_action(action_id).await?;
                    Ok::<_, BuildError>(match current.status {
                        ActionStatus::Completed | ActionStatus::Errored => Some(current.status),
                        _ => None,
                    })
                },
            )
            .await;

            match outcome {
                Ok(PollOutcome::Ready(ActionStatus::Completed)) => {
                    info!(droplet_id, "droplet shut down");
                }
                Ok(PollOutcome::Cancelled) => return StepAction::cancelled(),
                Ok(PollOutcome::TimedOut) => {
                    warn!(droplet_id, "graceful shutdown timed out; forcing power off");
                }
                Ok(PollOutcome::Ready(status)) => {
                    warn!(droplet_id, ?status, "graceful shutdown failed; forcing power off");
                }
                Err(err) => {
                    warn!(droplet_id, error = %err, "could not track shutdown; forcing power off");
                }
            }
            StepAction::Continue
        })
    }
}

/// Ensures the droplet is off, powering it off when needed.
#[derive(Clone, Copy, Debug, Default)]
pub struct PowerOff;

impl Step for PowerOff {
    fn name(&self) -> &'static str {
        "power-off"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let droplet_id = match state.require_droplet() {
                Ok(droplet) => droplet.id,
                Err(err) => return StepAction::fail(err),
            };
            let provider = ctx.provider;
            match provider.get_droplet(droplet_id).await {
                Ok(droplet) if droplet.status == DropletStatus::Off => {
                    info!(droplet_id, "droplet already off");
                    return StepAction::Continue;
                }
                Ok(_) => {}
                Err(err) => return StepAction::fail(err),
            }

            info!(droplet_id, "powering off droplet");
            if let Err(err) = provider
                .droplet_action(droplet_id, &DropletAction::PowerOff)
                .await
            {
                return StepAction::fail(err);
            }

            let config = ctx.config;
            let outcome = poll_until(
                ctx.cancel,
                config.state_timeout,
                config.poll_interval,
                || async move {
                    let droplet = provider.get_droplet(droplet_id).await?;
                    Ok::<_, BuildError>((droplet.status == DropletStatus::Off).then_some(()))
                },
            )
            .await;

            match outcome {
                Ok(PollOutcome::Ready(())) => {
                    info!(droplet_id, "droplet is off");
                    StepAction::Continue
                }
                Ok(PollOutcome::TimedOut) => StepAction::fail(BuildError::Timeout {
                    phase: TimeoutPhase::DropletOff,
                    droplet_id,
                    waited: config.state_timeout,
                }),
                Ok(PollOutcome::Cancelled) => StepAction::cancelled(),
                Err(err) => StepAction::fail(err),
            }
        })
    }
}
