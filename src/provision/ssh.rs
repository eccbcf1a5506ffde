//! SSH-backed [`Communicator`] and [`ProvisionHook`].

use std::ffi::OsString;
use std::io::Write;
use std::time::Duration;

use shell_escape::unix::escape;
use tempfile::NamedTempFile;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info};

use crate::cancel::CancelToken;

use super::{
    CommandRunner, Communicator, ConnectTarget, ProcessCommandRunner, ProvisionError,
    ProvisionFuture, ProvisionHook,
};

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";

/// Identity file handed to `ssh -i`. A temporary key takes precedence over
/// a configured file and lives in a private temp file for as long as this
/// value does.
enum Identity {
    Configured(String),
    Temporary(NamedTempFile),
    None,
}

impl Identity {
    fn for_target(target: &ConnectTarget) -> Result<Self, ProvisionError> {
        let Some(key) = &target.private_key else {
            return Ok(target
                .private_key_file
                .as_ref()
                .map_or(Self::None, |path| Self::Configured(path.to_string())));
        };
        let mut file = NamedTempFile::new().map_err(|err| ProvisionError::Io {
            message: err.to_string(),
        })?;
        file.write_all(key.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|err| ProvisionError::Io {
                message: err.to_string(),
            })?;
        Ok(Self::Temporary(file))
    }

    fn path(&self) -> Option<String> {
        match self {
            Self::Configured(path) => Some(path.clone()),
            Self::Temporary(file) => Some(file.path().to_string_lossy().into_owned()),
            Self::None => None,
        }
    }
}

fn ssh_args(target: &ConnectTarget, identity: &Identity, remote_command: &str) -> Vec<OsString> {
    let mut args = vec![OsString::from("-p"), OsString::from(target.port.to_string())];
    if let Some(path) = identity.path() {
        args.push(OsString::from("-i"));
        args.push(OsString::from(path));
    }
    for option in [
        "BatchMode=yes",
        "StrictHostKeyChecking=no",
        "UserKnownHostsFile=/dev/null",
    ] {
        args.push(OsString::from("-o"));
        args.push(OsString::from(option));
    }
    args.push(OsString::from(format!("{}@{}", target.username, target.host)));
    args.push(OsString::from(remote_command));
    args
}

fn run_remote<R: CommandRunner>(
    runner: &R,
    ssh_bin: &str,
    target: &ConnectTarget,
    remote_command: &str,
) -> Result<(), ProvisionError> {
    let identity = Identity::for_target(target)?;
    let args = ssh_args(target, &identity, remote_command);
    let output = runner.run(ssh_bin, &args)?;
    if output.is_success() {
        return Ok(());
    }
    Err(ProvisionError::CommandFailed {
        command: remote_command.to_owned(),
        code: output.code,
        stderr: output.stderr,
    })
}

/// Builds the remote command that drops `public_key` from the authorized
/// keys file.
pub(crate) fn remove_key_command(public_key: &str) -> String {
    let escaped_key = escape(public_key.trim().into());
    format!(
        "grep -vxF {escaped_key} {AUTHORIZED_KEYS} > {AUTHORIZED_KEYS}.dropsmith; \
         mv {AUTHORIZED_KEYS}.dropsmith {AUTHORIZED_KEYS}"
    )
}

/// Waits for the SSH port and edits `authorized_keys` through the system
/// `ssh` client.
#[derive(Clone, Debug)]
pub struct SshCommunicator<R = ProcessCommandRunner> {
    runner: R,
    ssh_bin: String,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl<R: CommandRunner> SshCommunicator<R> {
    /// Creates a communicator that waits up to `wait_timeout` for SSH.
    #[must_use]
    pub fn new(
        runner: R,
        ssh_bin: impl Into<String>,
        wait_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            wait_timeout,
            poll_interval,
        }
    }

    async fn wait_for_ssh(
        &self,
        target: &ConnectTarget,
        cancel: &CancelToken,
    ) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            let addr = (target.host.as_str(), target.port);
            let connect = timeout(SSH_CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
            if matches!(connect, Ok(Ok(_))) {
                info!(host = %target.host, port = target.port, "SSH port is accepting connections");
                return Ok(());
            }
            debug!(host = %target.host, port = target.port, "SSH not ready yet");
            tokio::select! {
                () = sleep(self.poll_interval) => {}
                () = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            }
        }

        Err(ProvisionError::Unreachable {
            host: target.host.clone(),
            port: target.port,
            waited: self.wait_timeout,
        })
    }
}

impl<R: CommandRunner> Communicator for SshCommunicator<R> {
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
        cancel: &'a CancelToken,
    ) -> ProvisionFuture<'a> {
        Box::pin(self.wait_for_ssh(target, cancel))
    }

    fn remove_temporary_key<'a>(
        &'a self,
        target: &'a ConnectTarget,
        public_key: &'a str,
    ) -> ProvisionFuture<'a> {
        Box::pin(async move {
            run_remote(
                &self.runner,
                &self.ssh_bin,
                target,
                &remove_key_command(public_key),
            )
        })
    }
}

/// Runs a fixed list of shell commands on the droplet, one `ssh` call each.
#[derive(Clone, Debug)]
pub struct SshProvisioner<R = ProcessCommandRunner> {
    runner: R,
    ssh_bin: String,
    commands: Vec<String>,
}

impl<R: CommandRunner> SshProvisioner<R> {
    /// Creates a provisioner for `commands`.
    #[must_use]
    pub fn new(runner: R, ssh_bin: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            commands,
        }
    }
}

impl<R: CommandRunner> ProvisionHook for SshProvisioner<R> {
    fn provision<'a>(
        &'a self,
        target: &'a ConnectTarget,
        cancel: &'a CancelToken,
    ) -> ProvisionFuture<'a> {
        Box::pin(async move {
            for command in &self.commands {
                if cancel.is_cancelled() {
                    return Err(ProvisionError::Cancelled);
                }
                info!(host = %target.host, %command, "running provisioning command");
                run_remote(&self.runner, &self.ssh_bin, target, command)?;
            }
            Ok(())
        })
    }
}
