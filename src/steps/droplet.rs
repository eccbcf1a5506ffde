//! Droplet creation and readiness.

use std::net::IpAddr;

use tracing::info;

use crate::config::{BuildConfig, UserData};
use crate::digitalocean::{DropletRequest, DropletStatus, ImageRef};
use crate::error::{BuildError, TimeoutPhase};
use crate::files;
use crate::pipeline::{PollOutcome, Step, StepAction, StepContext, StepFuture, poll_until};
use crate::state::{BuildState, DropletRecord};

fn user_data(config: &BuildConfig) -> Result<Option<String>, BuildError> {
    match &config.user_data {
        None => Ok(None),
        Some(UserData::Inline(payload)) => Ok(Some(payload.clone())),
        Some(UserData::File(path)) => files::read_to_string(path).map(Some),
    }
}

/// Builds the create request from configuration and the registered keys.
///
/// # Errors
///
/// Returns [`BuildError::Io`] when the user data file cannot be read.
pub fn droplet_request(
    config: &BuildConfig,
    state: &BuildState,
) -> Result<DropletRequest, BuildError> {
    let ssh_keys = state
        .ssh_key_id
        .into_iter()
        .chain(config.ssh.key_id)
        .collect();
    Ok(DropletRequest {
        name: config.droplet_name.clone(),
        region: config.region.clone(),
        size: config.size.clone(),
        image: ImageRef::parse(&config.image),
        ssh_keys,
        private_networking: config.private_networking,
        monitoring: config.monitoring,
        ipv6: config.ipv6,
        user_data: user_data(config)?,
        tags: config.tags.clone(),
        vpc_uuid: config.vpc_uuid.clone(),
        with_droplet_agent: config.droplet_agent,
    })
}

/// Creates the droplet.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateInstance;

impl Step for CreateInstance {
    fn name(&self) -> &'static str {
        "create-droplet"
    }

    fn run<'a>(
        &'a self,
        ctx: StepContext<'a>,
        state: &'a mut BuildState,
    ) -> StepFuture<'a, StepAction> {
        Box::pin(async move {
            let request = match droplet_request(ctx.config, state) {
                Ok(request) => request,
                Err(err) => return StepAction::fail(err),
            };
            info!(
                name = %request.name,
                region = %request.region,
                size = %request.size,
                "creating droplet"
            );
            match ctx.provider.create_droplet(&request).await {
                Ok(droplet) => {
                    info!(droplet_id = droplet.id, "droplet created");
                    let source_image_id = droplet.image.map(|image| image.id).or(
                        match request.image {
                            ImageRef::Id(id) => Some(id),
                            ImageRef::Slug(_) => None,
                        },
                    );
                    state.droplet = Some(DropletRecord {
                        id: droplet.id,
                        name: droplet.name,
                        size: request.size,
                        region: request.region,
                        source_image_id,
                    });
                    StepAction::Continue
                }
                Err(source) => StepAction::fail(BuildError::ResourceCreation {
                    resource: "droplet",
                    source,
                }),
            }
        })
    }
}

/// Waits for the droplet to become active and records the address to
/// connect to.
#[derive(Clone, Copy, Debug, Default)]
pub struct WaitReady;

impl Step for WaitReady {
    fn name(&self) -> &'static str {
        "wait-ready"
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
            let config = ctx.config;
            info!(droplet_id, "waiting for droplet to become active");

            let provider = ctx.provider;
            let outcome = poll_until(
                ctx.cancel,
                config.state_timeout,
                config.poll_interval,
                || async move {
                    let droplet = provider.get_droplet(droplet_id).await?;
                    let ready = match droplet.status {
                        DropletStatus::Active => Some(droplet),
                        DropletStatus::Errored | DropletStatus::Archive => {
                            return Err(BuildError::DropletErrored {
                                droplet_id,
                                status: droplet.status,
                            });
                        }
                        _ => None,
                    };
                    Ok::<_, BuildError>(ready)
                },
            )
            .await;

            let droplet = match outcome {
                Ok(PollOutcome::Ready(droplet)) => droplet,
                Ok(PollOutcome::TimedOut) => {
                    return StepAction::fail(BuildError::Timeout {
                        phase: TimeoutPhase::DropletActive,
                        droplet_id,
                        waited: config.state_timeout,
                    });
                }
                Ok(PollOutcome::Cancelled) => return StepAction::cancelled(),
                Err(err) => return StepAction::fail(err),
            };

            let use_private = config.private_networking && config.connect_with_private_ip;
            let (network, address) = if use_private {
                ("private", droplet.private_ipv4())
            } else {
                ("public", droplet.public_ipv4())
            };
            let Some(address) = address else {
                return StepAction::fail(BuildError::MissingAddress {
                    droplet_id,
                    network,
                });
            };
            info!(droplet_id, %address, "droplet is active");
            state.droplet_address = Some(IpAddr::V4(address));
            StepAction::Continue
        })
    }
}
