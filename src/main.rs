//! Binary entry point for the dropsmith CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing::warn;

use dropsmith::provision::ProcessCommandRunner;
use dropsmith::{
    ApiError, BuildError, Builder, BuilderConfig, ConfigError, DigitalOceanProvider, Redactor,
    SshCommunicator, SshProvisioner, logging,
};

mod cli;

use cli::{BuildCommand, Cli};

const SSH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("provider error: {0}")]
    Provider(#[from] ApiError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
    #[error("failed to write artifact: {0}")]
    Output(String),
}

#[tokio::main]
async fn main() {
    let redactor = Redactor::new();
    if let Err(err) = logging::init(redactor.clone()) {
        writeln!(io::stderr(), "failed to initialise logging: {err}").ok();
    }

    let Cli::Build(command) = Cli::parse();
    let exit_code = match build(&command, redactor).await {
        Ok(()) => 0,
        Err(err) => {
            write_error(io::stderr(), &err);
            1
        }
    };

    process::exit(exit_code);
}

fn apply_overrides(mut config: BuilderConfig, command: &BuildCommand) -> BuilderConfig {
    if let Some(region) = &command.region {
        config.region.clone_from(region);
    }
    if let Some(name) = &command.snapshot_name {
        config.snapshot_name = Some(name.clone());
    }
    if !command.snapshot_regions.is_empty() {
        config.snapshot_regions.clone_from(&command.snapshot_regions);
    }
    if command.no_wait_transfer {
        config.wait_snapshot_transfer = false;
    }
    if command.debug {
        config.debug = true;
    }
    config
}

async fn build(command: &BuildCommand, redactor: Redactor) -> Result<(), CliError> {
    let loaded = BuilderConfig::load_without_cli_args()?;
    let config = apply_overrides(loaded, command).validate()?;
    redactor.register(config.token.clone());

    let provider =
        DigitalOceanProvider::connect(&config.token, config.api_url.as_deref(), config.retry)?;
    let communicator = SshCommunicator::new(
        ProcessCommandRunner,
        config.ssh.ssh_bin.clone(),
        config.ssh.timeout,
        SSH_POLL_INTERVAL,
    );
    let provisioner = SshProvisioner::new(
        ProcessCommandRunner,
        config.ssh.ssh_bin.clone(),
        config.provision_commands.clone(),
    );
    let builder =
        Builder::new(provider, communicator, provisioner, config).with_redactor(redactor);

    let cancel = builder.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling build");
            cancel.cancel();
        }
    });

    let artifact = builder.run().await?;
    let rendered =
        serde_json::to_string_pretty(&artifact).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ortho_config::OrthoConfig;

    fn loaded() -> BuilderConfig {
        BuilderConfig::load_from_iter([std::ffi::OsString::from("dropsmith")])
            .unwrap_or_else(|err| panic!("defaults should load: {err}"))
    }

    #[test]
    fn flags_override_loaded_values() {
        let command = BuildCommand {
            region: Some(String::from("ams3")),
            snapshot_name: Some(String::from("golden")),
            snapshot_regions: vec![String::from("sfo3")],
            no_wait_transfer: true,
            debug: true,
        };

        let config = apply_overrides(loaded(), &command);

        assert_eq!(config.region, "ams3");
        assert_eq!(config.snapshot_name.as_deref(), Some("golden"));
        assert_eq!(config.snapshot_regions, vec![String::from("sfo3")]);
        assert!(!config.wait_snapshot_transfer);
        assert!(config.debug);
    }

    #[test]
    fn absent_flags_keep_loaded_values() {
        let before = loaded();
        let after = apply_overrides(before.clone(), &BuildCommand::default());
        assert_eq!(before, after);
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::Build(BuildError::Cancelled));
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert_eq!(rendered, "build failed: build cancelled\n");
    }
}
