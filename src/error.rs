//! Build-level error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::api::ApiError;
use crate::config::ConfigError;
use crate::digitalocean::DropletStatus;

/// Polling phase that ran out of time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeoutPhase {
    /// Waiting for a new droplet to become `active`.
    DropletActive,
    /// Waiting for the droplet to report `off`.
    DropletOff,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DropletActive => f.write_str("droplet to become active"),
            Self::DropletOff => f.write_str("droplet to power off"),
        }
    }
}

/// One region whose snapshot transfer did not complete.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferFailure {
    /// Region slug.
    pub region: String,
    /// Human readable reason.
    pub reason: String,
}

fn render_failures(failures: &[TransferFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.region, failure.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Coarse classification of a [`BuildError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Rejected before any provider mutation.
    Config,
    /// Retryable API failure that outlived the retry budget.
    TransientApi,
    /// Non-retryable API failure.
    Api,
    /// The provider refused to create a resource.
    ResourceCreation,
    /// A polling phase timed out.
    Timeout,
    /// A snapshot or transfer action failed.
    Snapshot,
    /// The build was cancelled.
    Cancelled,
    /// Local failure: keys, files, SSH or provisioning.
    Local,
}

/// Terminal failure of a build.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A configured region does not exist.
    #[error("invalid region: {region}")]
    InvalidRegion {
        /// Offending region slug.
        region: String,
    },
    /// A provider call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
    /// The provider rejected a create call.
    #[error("failed to create {resource}: {source}")]
    ResourceCreation {
        /// Resource kind, for example `droplet`.
        resource: &'static str,
        /// Provider error.
        source: ApiError,
    },
    /// A polling phase exceeded its timeout.
    #[error("timed out after {waited:?} waiting for {phase} (droplet {droplet_id})")]
    Timeout {
        /// Phase that timed out.
        phase: TimeoutPhase,
        /// Droplet being polled.
        droplet_id: u64,
        /// Configured timeout.
        waited: Duration,
    },
    /// The droplet entered a terminal state other than the one awaited.
    #[error("droplet {droplet_id} entered status {status}")]
    DropletErrored {
        /// Droplet identifier.
        droplet_id: u64,
        /// Status observed.
        status: DropletStatus,
    },
    /// The droplet became active without the requested address.
    #[error("droplet {droplet_id} has no {network} IPv4 address")]
    MissingAddress {
        /// Droplet identifier.
        droplet_id: u64,
        /// `public` or `private`.
        network: &'static str,
    },
    /// The snapshot action reported an error.
    #[error("snapshot {name} failed (action {action_id})")]
    SnapshotFailed {
        /// Snapshot name.
        name: String,
        /// Action identifier.
        action_id: u64,
    },
    /// The snapshot action did not finish in time.
    #[error("timed out after {waited:?} waiting for snapshot {name}")]
    SnapshotTimeout {
        /// Snapshot name.
        name: String,
        /// Configured timeout.
        waited: Duration,
    },
    /// The completed snapshot could not be located.
    #[error("snapshot {name} not found on droplet {droplet_id}")]
    SnapshotNotFound {
        /// Snapshot name.
        name: String,
        /// Droplet identifier.
        droplet_id: u64,
    },
    /// One or more regional transfers failed or timed out.
    #[error("snapshot transfer failed for regions: {}", render_failures(.failures))]
    TransferFailed {
        /// Every failed region.
        failures: Vec<TransferFailure>,
    },
    /// The build was cancelled.
    #[error("build cancelled")]
    Cancelled,
    /// Temporary key generation failed.
    #[error("failed to generate SSH key: {0}")]
    KeyGeneration(String),
    /// The communicator could not reach the droplet.
    #[error("communicator failed: {0}")]
    Communicator(String),
    /// The provisioning hook failed.
    #[error("provisioning failed: {0}")]
    Provision(String),
    /// Local file I/O failed.
    #[error("I/O error on {path}: {message}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error.
        message: String,
    },
    /// A step ran before the step that writes its input.
    #[error("build state is missing {0}")]
    MissingState(&'static str),
}

impl BuildError {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::InvalidRegion { .. } => ErrorKind::Config,
            Self::Api(err) if err.is_retryable() => ErrorKind::TransientApi,
            Self::Api(_) | Self::MissingState(_) => ErrorKind::Api,
            Self::ResourceCreation { .. } => ErrorKind::ResourceCreation,
            Self::Timeout { .. } | Self::SnapshotTimeout { .. } => ErrorKind::Timeout,
            Self::DropletErrored { .. }
            | Self::MissingAddress { .. }
            | Self::SnapshotFailed { .. }
            | Self::SnapshotNotFound { .. }
            | Self::TransferFailed { .. } => ErrorKind::Snapshot,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::KeyGeneration(_)
            | Self::Communicator(_)
            | Self::Provision(_)
            | Self::Io { .. } => ErrorKind::Local,
        }
    }
}

/// Failure during a step's cleanup. Logged and recorded, never propagated.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("cleanup of {step} failed: {message}")]
pub struct CleanupError {
    /// Step whose cleanup failed.
    pub step: &'static str,
    /// Underlying error.
    pub message: String,
}

impl CleanupError {
    /// Creates a cleanup error for `step`.
    #[must_use]
    pub fn new(step: &'static str, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_failure_message_names_every_region() {
        let err = BuildError::TransferFailed {
            failures: vec![
                TransferFailure {
                    region: String::from("sfo3"),
                    reason: String::from("timed out"),
                },
                TransferFailure {
                    region: String::from("lon1"),
                    reason: String::from("errored"),
                },
            ],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("sfo3 (timed out)"), "rendered: {rendered}");
        assert!(rendered.contains("lon1 (errored)"), "rendered: {rendered}");
    }

    #[test]
    fn exhausted_rate_limit_is_transient() {
        let err = BuildError::Api(ApiError::Status {
            status: 429,
            id: None,
            message: String::from("slow down"),
        });
        assert_eq!(err.kind(), ErrorKind::TransientApi);
    }
}
