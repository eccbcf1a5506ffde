//! Snapshot capture followed by replication into the requested regions.

use tracing::info;

use crate::digitalocean::{ActionStatus, DropletAction};
use crate::error::BuildError;
use crate::pipeline::{PollOutcome, Step, StepAction, StepContext, StepFuture, poll_until};
use crate::state::{BuildState, SnapshotRecord};

use super::transfer::replicate;

/// Snapshots the powered-off droplet, locates the resulting image, and
/// copies it into every requested region.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot;

impl Snapshot {
    async fn capture(
        ctx: StepContext<'_>,
        state: &BuildState,
    ) -> Result<Option<SnapshotRecord>, BuildError> {
        let droplet = state.require_droplet()?;
        let droplet_id = droplet.id;
        let name = ctx.config.snapshot_name.clone();
        info!(droplet_id, snapshot = %name, "creating snapshot");
        let action = ctx
            .provider
            .droplet_action(droplet_id, &DropletAction::Snapshot { name: name.clone() })
            .await?;

        let action_id = action.id;
        let provider = ctx.provider;
        let config = ctx.config;
        let outcome = poll_until(
            ctx.cancel,
            config.snapshot_timeout,
            config.poll_interval,
            || async move {
                let current = provider.get_action(action_id).await?;
                Ok::<_, BuildError>(match current.status {
                    ActionStatus::Completed | ActionStatus::Errored => Some(current.status),
                    _ => None,
                })
            },
        )
        .await?;

        match outcome {
            PollOutcome::Ready(ActionStatus::Completed) => {}
            PollOutcome::Ready(_) => {
                return Err(BuildError::SnapshotFailed { name, action_id });
            }
            PollOutcome::TimedOut => {
                return Err(BuildError::SnapshotTimeout {
                    name,
                    waited: config.snapshot_timeout,
                });
            }
            PollOutcome::Cancelled => return Ok(None),
        }

        let images = provider.droplet_snapshots(droplet_id).await?;
        let Some(image) = images.into_iter().find(|image| image.name == name) else {
            return Err(BuildError::SnapshotNotFound { name, droplet_id });
        };
        let origin_region = image
            .regions
            .first()
            .cloned()
            .unwrap_or_else(|| droplet.region.clone());
        info!(image_id = image.id, snapshot = %name, region = %origin_region, "snapshot created");
        Ok(Some(SnapshotRecord {
            id: image.id,
            name,
            origin_region,
        }))
    }
}

impl Step for Snapshot {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let snapshot = match Self::capture(ctx, state).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => return StepAction::cancelled(),
                Err(err) => return StepAction::fail(err),
            };
            state.snapshot = Some(snapshot.clone());
            replicate(ctx, state, &snapshot).await
        })
    }
}
