//! Core library for the dropsmith snapshot builder.
//!
//! A build boots a temporary DigitalOcean droplet from a base image,
//! customises it over SSH, powers it off and captures it as a snapshot,
//! optionally copying the snapshot into further regions. The work is split
//! into [`steps`] run in order by a [`pipeline::StepRunner`]; every provider
//! call goes through the retrying client in [`api`].

pub mod api;
pub mod artifact;
pub mod builder;
pub mod cancel;
pub mod config;
pub mod digitalocean;
pub mod error;
pub mod files;
pub mod logging;
pub mod pipeline;
pub mod provision;
pub mod state;
pub mod steps;
pub mod test_support;

pub use api::{ApiError, HttpTransport, RetryPolicy, RetryingClient};
pub use artifact::Artifact;
pub use builder::Builder;
pub use cancel::CancelToken;
pub use config::{BuildConfig, BuilderConfig, ConfigError};
pub use digitalocean::{DigitalOceanProvider, Provider};
pub use error::{BuildError, CleanupError, ErrorKind};
pub use logging::Redactor;
pub use provision::{Communicator, ConnectTarget, ProvisionHook, SshCommunicator, SshProvisioner};
pub use state::BuildState;
