//! Region validation and multi-region snapshot transfers.
//!
//! Transfers are initiated for every requested region except the snapshot's
//! origin. Without waiting, the step returns as soon as every transfer has
//! been initiated. With waiting, each region initiates and polls in its own
//! future with its own deadline, and the step settles only after all of
//! them have.

use std::collections::BTreeSet;

use futures_util::future::join_all;
use tracing::{info, warn};

use crate::api::ApiError;
use crate::digitalocean::{ActionStatus, Region};
use crate::error::{BuildError, TransferFailure};
use crate::pipeline::{PollOutcome, StepAction, StepContext, poll_until};
use crate::state::{BuildState, SnapshotRecord, Transfer, TransferStatus};

/// Checks the build region and every snapshot region against `valid`.
///
/// # Errors
///
/// Returns [`BuildError::InvalidRegion`] naming the first unknown slug.
pub fn validate_snapshot_regions(
    valid: &[Region],
    build_region: &str,
    snapshot_regions: &[String],
) -> Result<(), BuildError> {
    let known: BTreeSet<&str> = valid.iter().map(|region| region.slug.as_str()).collect();
    std::iter::once(build_region)
        .chain(snapshot_regions.iter().map(String::as_str))
        .find(|region| !known.contains(region))
        .map_or(Ok(()), |region| {
            Err(BuildError::InvalidRegion {
                region: region.to_owned(),
            })
        })
}

/// Requested regions minus `origin`, deduplicated, in request order.
#[must_use]
pub fn transfer_targets(origin: &str, requested: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    requested
        .iter()
        .filter(|region| region.as_str() != origin)
        .filter(|region| seen.insert(region.as_str()))
        .cloned()
        .collect()
}

/// `origin` plus every requested region, sorted and unique.
#[must_use]
pub fn final_regions(origin: &str, requested: &[String]) -> Vec<String> {
    std::iter::once(origin.to_owned())
        .chain(requested.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

struct Settled {
    transfer: Transfer,
    reason: Option<String>,
}

impl Settled {
    const fn completed(region: String, action_id: u64) -> Self {
        Self {
            transfer: Transfer {
                region,
                status: TransferStatus::Completed,
                action_id: Some(action_id),
            },
            reason: None,
        }
    }

    fn failed(
        region: String,
        status: TransferStatus,
        action_id: Option<u64>,
        reason: String,
    ) -> Self {
        Self {
            transfer: Transfer {
                region,
                status,
                action_id,
            },
            reason: Some(reason),
        }
    }
}

async fn initiate(ctx: StepContext<'_>, image_id: u64, region: &str) -> Result<u64, ApiError> {
    info!(image_id, %region, "transferring snapshot");
    let action = ctx.provider.transfer_image(image_id, region).await?;
    Ok(action.id)
}

async fn transfer_and_wait(ctx: StepContext<'_>, image_id: u64, region: String) -> Settled {
    let action_id = match initiate(ctx, image_id, &region).await {
        Ok(action_id) => action_id,
        Err(err) => {
            return Settled::failed(region, TransferStatus::Failed, None, err.to_string());
        }
    };

    let provider = ctx.provider;
    let timeout = ctx.config.transfer_timeout;
    let outcome = poll_until(ctx.cancel, timeout, ctx.config.poll_interval, || async move {
        let action = provider.get_image_action(image_id, action_id).await?;
        Ok::<_, ApiError>(match action.status {
            ActionStatus::Completed | ActionStatus::Errored => Some(action.status),
            _ => None,
        })
    })
    .await;

    match outcome {
        Ok(PollOutcome::Ready(ActionStatus::Completed)) => {
            info!(%region, image_id, "snapshot transfer completed");
            Settled::completed(region, action_id)
        }
        Ok(PollOutcome::Ready(_)) => Settled::failed(
            region,
            TransferStatus::Failed,
            Some(action_id),
            String::from("transfer action errored"),
        ),
        Ok(PollOutcome::TimedOut) => Settled::failed(
            region,
            TransferStatus::TimedOut,
            Some(action_id),
            format!("timed out after {timeout:?}"),
        ),
        Ok(PollOutcome::Cancelled) => Settled::failed(
            region,
            TransferStatus::Failed,
            Some(action_id),
            String::from("cancelled"),
        ),
        Err(err) => Settled::failed(
            region,
            TransferStatus::Failed,
            Some(action_id),
            err.to_string(),
        ),
    }
}

async fn transfer_without_waiting(
    ctx: StepContext<'_>,
    image_id: u64,
    targets: Vec<String>,
) -> Vec<Settled> {
    let mut settled = Vec::with_capacity(targets.len());
    for region in targets {
        let outcome = match initiate(ctx, image_id, &region).await {
            Ok(action_id) => Settled {
                transfer: Transfer {
                    region,
                    status: TransferStatus::InProgress,
                    action_id: Some(action_id),
                },
                reason: None,
            },
            Err(err) => Settled::failed(region, TransferStatus::Failed, None, err.to_string()),
        };
        settled.push(outcome);
    }
    settled
}

/// Copies `snapshot` into the configured regions and records the outcome
/// in `state`.
pub async fn replicate(
    ctx: StepContext<'_>,
    state: &mut BuildState,
    snapshot: &SnapshotRecord,
) -> StepAction {
    let requested = &ctx.config.snapshot_regions;
    let targets = transfer_targets(&snapshot.origin_region, requested);
    if targets.is_empty() {
        state.regions = final_regions(&snapshot.origin_region, requested);
        return StepAction::Continue;
    }

    state.transfers = targets
        .iter()
        .map(|region| Transfer {
            region: region.clone(),
            status: TransferStatus::Pending,
            action_id: None,
        })
        .collect();

    let settled = if ctx.config.wait_snapshot_transfer {
        join_all(
            targets
                .into_iter()
                .map(|region| transfer_and_wait(ctx, snapshot.id, region)),
        )
        .await
    } else {
        transfer_without_waiting(ctx, snapshot.id, targets).await
    };

    let mut failures = Vec::new();
    state.transfers = settled
        .into_iter()
        .map(|outcome| {
            if let Some(reason) = outcome.reason {
                warn!(region = %outcome.transfer.region, %reason, "snapshot transfer failed");
                failures.push(TransferFailure {
                    region: outcome.transfer.region.clone(),
                    reason,
                });
            }
            outcome.transfer
        })
        .collect();

    if ctx.cancel.is_cancelled() {
        return StepAction::cancelled();
    }
    if !failures.is_empty() {
        return StepAction::fail(BuildError::TransferFailed { failures });
    }
    state.regions = final_regions(&snapshot.origin_region, requested);
    StepAction::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn region(slug: &str) -> Region {
        Region {
            slug: slug.to_owned(),
            name: slug.to_uppercase(),
            available: true,
        }
    }

    fn slugs(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[rstest]
    #[case("nyc3", &["sfo3"], None)]
    #[case("nyc3", &["sfo3", "mars1"], Some("mars1"))]
    #[case("atlantis1", &["sfo3"], Some("atlantis1"))]
    fn validates_build_and_snapshot_regions(
        #[case] build_region: &str,
        #[case] requested: &[&str],
        #[case] invalid: Option<&str>,
    ) {
        let valid = [region("nyc3"), region("sfo3"), region("ams3")];
        let result = validate_snapshot_regions(&valid, build_region, &slugs(requested));
        match invalid {
            None => assert!(result.is_ok(), "unexpected: {result:?}"),
            Some(slug) => assert_eq!(
                result,
                Err(BuildError::InvalidRegion {
                    region: slug.to_owned()
                })
            ),
        }
    }

    #[test]
    fn targets_skip_origin_and_duplicates() {
        let targets = transfer_targets("nyc3", &slugs(&["sfo3", "nyc3", "ams3", "sfo3"]));
        assert_eq!(targets, slugs(&["sfo3", "ams3"]));
    }

    #[test]
    fn final_regions_are_sorted_and_unique() {
        let regions = final_regions("nyc3", &slugs(&["sfo3", "ams3", "nyc3"]));
        assert_eq!(regions, slugs(&["ams3", "nyc3", "sfo3"]));
    }
}
