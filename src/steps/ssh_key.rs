//! Account key registration and instance key cleanup.

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BuildError, CleanupError};
use crate::pipeline::{Step, StepAction, StepContext, StepFuture};
use crate::state::BuildState;

use super::connect_target;

/// Registers the temporary public key on the account. Its cleanup always
/// removes the key again; a key that is already gone counts as removed.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateKey;

impl Step for CreateKey {
    fn name(&self) -> &'static str {
        "create-key"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let Some(key) = state.temporary_key.as_ref() else {
                return StepAction::fail(BuildError::MissingState("temporary key"));
            };
            let name = format!("dropsmith-{}", Uuid::new_v4());
            match ctx.provider.create_key(&name, &key.public_openssh).await {
                Ok(registered) => {
                    info!(key_id = registered.id, %name, "registered temporary SSH key");
                    state.ssh_key_id = Some(registered.id);
                    StepAction::Continue
                }
                Err(source) => StepAction::fail(BuildError::ResourceCreation {
                    resource: "SSH key",
                    source,
                }),
            }
        })
    }

    fn cleanup<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, Result<(), CleanupError>> {
        Box::pin(async move {
            let Some(key_id) = state.ssh_key_id else {
                return Ok(());
            };
            info!(key_id, "deleting temporary SSH key");
            match ctx.provider.delete_key(key_id).await {
                Ok(()) => {
                    state.ssh_key_id = None;
                    Ok(())
                }
                Err(err) if err.is_not_found() => {
                    state.ssh_key_id = None;
                    Ok(())
                }
                Err(err) => Err(CleanupError::new(
                    self.name(),
                    format!("failed to delete SSH key {key_id}, remove it manually: {err}"),
                )),
            }
        })
    }
}

/// Removes the temporary public key from the droplet before it is
/// snapshotted. Failure is logged and does not stop the build.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupTempKey;

impl Step for CleanupTempKey {
    fn name(&self) -> &'static str {
        "cleanup-temp-key"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let Some(public_key) = state
                .temporary_key
                .as_ref()
                .map(|key| key.public_openssh.clone())
            else {
                return StepAction::Continue;
            };
            let target = match connect_target(ctx, state) {
                Ok(target) => target,
                Err(err) => return StepAction::fail(err),
            };
            info!(host = %target.host, "removing temporary key from authorized_keys");
            if let Err(err) = ctx
                .communicator
                .remove_temporary_key(&target, &public_key)
                .await
            {
                warn!(
                    error = %err,
                    "could not remove temporary key from the droplet; clean it up manually"
                );
            }
            StepAction::Continue
        })
    }
}
