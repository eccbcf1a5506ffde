//! Seams for reaching and customising the droplet.
//!
//! The builder only needs two things from the outside world once a droplet
//! is up: a [`Communicator`] that can reach it, and a [`ProvisionHook`] that
//! customises it. The binary plugs in the SSH implementations from
//! [`ssh`]; tests substitute recording doubles.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::cancel::CancelToken;

mod runner;
pub mod ssh;

pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner};
pub use ssh::{SshCommunicator, SshProvisioner};

/// Where and how to log in to the droplet.
#[derive(Clone, Eq, PartialEq)]
pub struct ConnectTarget {
    /// Host name or address.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Temporary OpenSSH private key, when one was generated. Preferred over
    /// `private_key_file`.
    pub private_key: Option<String>,
    /// Private key file configured by the user.
    pub private_key_file: Option<Utf8PathBuf>,
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("private_key_file", &self.private_key_file)
            .finish_non_exhaustive()
    }
}

/// Errors raised by communicators and provisioning hooks.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// A local program could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program name.
        program: String,
        /// OS error.
        message: String,
    },
    /// A remote command exited unsuccessfully.
    #[error(
        "command `{command}` exited with {}: {stderr}",
        .code.map_or_else(|| String::from("no status"), |code| code.to_string())
    )]
    CommandFailed {
        /// Command as run on the droplet.
        command: String,
        /// Exit code, when the process reported one.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// SSH never accepted a connection.
    #[error("{host}:{port} did not accept SSH connections within {waited:?}")]
    Unreachable {
        /// Host polled.
        host: String,
        /// Port polled.
        port: u16,
        /// Time waited.
        waited: Duration,
    },
    /// Local file handling failed.
    #[error("I/O error: {message}")]
    Io {
        /// Underlying error.
        message: String,
    },
    /// The build was cancelled.
    #[error("cancelled")]
    Cancelled,
}

/// Future returned by communicator and hook operations.
pub type ProvisionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<(), ProvisionError>> + Send + 'a>>;

/// Reaches a running droplet.
pub trait Communicator: Send + Sync {
    /// Host string used to reach `address`.
    fn host(&self, address: IpAddr) -> String {
        address.to_string()
    }

    /// Waits until the droplet accepts connections.
    fn connect<'a>(&'a self, target: &'a ConnectTarget, cancel: &'a CancelToken)
    -> ProvisionFuture<'a>;

    /// Removes `public_key` from the login user's authorized keys.
    fn remove_temporary_key<'a>(
        &'a self,
        target: &'a ConnectTarget,
        public_key: &'a str,
    ) -> ProvisionFuture<'a>;
}

/// Customises the droplet before it is snapshotted.
pub trait ProvisionHook: Send + Sync {
    /// Runs the customisation.
    fn provision<'a>(
        &'a self,
        target: &'a ConnectTarget,
        cancel: &'a CancelToken,
    ) -> ProvisionFuture<'a>;
}
