//! Command-line interface definitions for the `dropsmith` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `dropsmith` binary.
#[derive(Debug, Parser)]
#[command(
    name = "dropsmith",
    about = "Build DigitalOcean snapshots from a temporary droplet",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Create a droplet, provision it, and snapshot it.
    #[command(name = "build", about = "Create a droplet, provision it, and snapshot it")]
    Build(BuildCommand),
}

/// Arguments for the `dropsmith build` subcommand.
///
/// Every flag overrides the value merged from defaults, `dropsmith.toml`
/// and the `DIGITALOCEAN_*` environment.
#[derive(Debug, Default, Parser)]
pub(crate) struct BuildCommand {
    /// Override the region the droplet is built in.
    #[arg(long, value_name = "SLUG")]
    pub(crate) region: Option<String>,
    /// Override the snapshot name.
    #[arg(long, value_name = "NAME")]
    pub(crate) snapshot_name: Option<String>,
    /// Copy the snapshot into this region as well. Repeatable.
    #[arg(long = "snapshot-region", value_name = "SLUG")]
    pub(crate) snapshot_regions: Vec<String>,
    /// Return once regional transfers have started instead of waiting for
    /// them to finish.
    #[arg(long)]
    pub(crate) no_wait_transfer: bool,
    /// Write the temporary private key to `do_<build_name>.pem`.
    #[arg(long)]
    pub(crate) debug: bool,
}
