//! The build phases, in the order the builder assembles them.

use crate::error::BuildError;
use crate::pipeline::StepContext;
use crate::provision::ConnectTarget;
use crate::state::BuildState;

mod comm;
mod droplet;
mod keygen;
mod shutdown;
mod snapshot;
mod ssh_key;
pub mod transfer;

pub use comm::{Connect, Provision};
pub use droplet::{CreateInstance, WaitReady, droplet_request};
pub use keygen::{DumpKey, KeyGen, generate_key};
pub use shutdown::{PowerOff, Shutdown};
pub use snapshot::Snapshot;
pub use ssh_key::{CleanupTempKey, CreateKey};

/// Login details for the droplet once a connect host is known.
pub(crate) fn connect_target(
    ctx: StepContext<'_>,
    state: &BuildState,
) -> Result<ConnectTarget, BuildError> {
    let host = state
        .connect_host
        .clone()
        .ok_or(BuildError::MissingState("connect host"))?;
    let ssh = &ctx.config.ssh;
    Ok(ConnectTarget {
        host,
        port: ssh.port,
        username: ssh.username.clone(),
        private_key: state
            .temporary_key
            .as_ref()
            .map(|key| key.private_openssh.clone()),
        private_key_file: ssh.private_key_file.clone(),
    })
}
