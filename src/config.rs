//! Configuration loading via `ortho-config`.
//!
//! [`BuilderConfig`] is the raw, layered configuration (defaults, config
//! file, environment, CLI). [`BuilderConfig::validate`] turns it into the
//! immutable [`BuildConfig`] the builder runs against.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::api::RetryPolicy;

/// Environment variable consulted when `DIGITALOCEAN_TOKEN` is unset.
pub const ACCESS_TOKEN_ENV: &str = "DIGITALOCEAN_ACCESS_TOKEN";
/// Deprecated token variable, still honoured with a warning.
pub const LEGACY_TOKEN_ENV: &str = "DIGITALOCEAN_API_TOKEN";

const MAX_TAG_LEN: usize = 255;

/// DigitalOcean builder configuration derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(
    prefix = "DIGITALOCEAN",
    discovery(
        app_name = "dropsmith",
        env_var = "DROPSMITH_CONFIG_PATH",
        config_file_name = "dropsmith.toml",
        dotfile_name = ".dropsmith.toml",
        project_file_name = "dropsmith.toml"
    )
)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "droplet creation exposes several independent provider toggles"
)]
pub struct BuilderConfig {
    /// API token. Falls back to `DIGITALOCEAN_ACCESS_TOKEN` and then the
    /// deprecated `DIGITALOCEAN_API_TOKEN`.
    pub token: Option<String>,
    /// Base URL of a DigitalOcean-compatible API.
    pub api_url: Option<String>,
    /// Retries allowed per API call for 429 and 5xx responses. `0` disables
    /// retrying.
    #[ortho_config(default = 5)]
    pub http_retry_max: u32,
    /// Minimum wait between retries, in seconds.
    #[ortho_config(default = 1.0)]
    pub http_retry_wait_min: f64,
    /// Maximum wait between retries, in seconds.
    #[ortho_config(default = 30.0)]
    pub http_retry_wait_max: f64,
    /// Region slug the droplet is built in.
    #[ortho_config(default = String::new())]
    pub region: String,
    /// Droplet size slug.
    #[ortho_config(default = String::new())]
    pub size: String,
    /// Base image slug or numeric image id.
    #[ortho_config(default = String::new())]
    pub image: String,
    /// Enable private networking on the droplet.
    #[ortho_config(default = false)]
    pub private_networking: bool,
    /// Enable the monitoring agent.
    #[ortho_config(default = false)]
    pub monitoring: bool,
    /// Enable IPv6.
    #[ortho_config(default = false)]
    pub ipv6: bool,
    /// Install the droplet agent. Unset leaves the provider default.
    pub droplet_agent: Option<bool>,
    /// Tags applied to the droplet.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Inline cloud-init user data.
    pub user_data: Option<String>,
    /// Path of a file holding cloud-init user data.
    pub user_data_file: Option<String>,
    /// VPC the droplet joins. Requires private networking.
    pub vpc_uuid: Option<String>,
    /// Connect over the private address. Requires private networking.
    #[ortho_config(default = false)]
    pub connect_with_private_ip: bool,
    /// Droplet name; defaults to `dropsmith-<uuid>`.
    pub droplet_name: Option<String>,
    /// Snapshot name; defaults to `dropsmith-<unix timestamp>`.
    pub snapshot_name: Option<String>,
    /// Additional regions the snapshot is copied into.
    #[serde(default)]
    pub snapshot_regions: Vec<String>,
    /// Wait for every regional copy to finish before succeeding.
    #[ortho_config(default = true)]
    pub wait_snapshot_transfer: bool,
    /// Seconds to wait for droplet state changes.
    #[ortho_config(default = 360)]
    pub state_timeout_secs: u64,
    /// Seconds to wait for the snapshot to complete.
    #[ortho_config(default = 3600)]
    pub snapshot_timeout_secs: u64,
    /// Seconds each regional copy may take, measured from its initiation.
    #[ortho_config(default = 1800)]
    pub transfer_timeout_secs: u64,
    /// Seconds between status polls.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Existing account SSH key to install on the droplet.
    pub ssh_key_id: Option<u64>,
    /// Private key matching `ssh_key_id`. Supports `~/` expansion.
    pub ssh_private_key_file: Option<String>,
    /// Never generate a temporary keypair.
    #[ortho_config(default = false)]
    pub skip_keygen: bool,
    /// SSH login user.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_username: String,
    /// SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Seconds to wait for SSH to accept connections.
    #[ortho_config(default = 300)]
    pub ssh_timeout_secs: u64,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Write the temporary private key next to the working directory.
    #[ortho_config(default = false)]
    pub debug: bool,
    /// Build name used for the debug key file.
    #[ortho_config(default = "dropsmith".to_owned())]
    pub build_name: String,
    /// Shell commands run on the droplet before it is snapshotted.
    #[serde(default)]
    #[ortho_config(cli_short = 'x')]
    pub provision_commands: Vec<String>,
}

/// Source of cloud-init user data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UserData {
    /// Inline payload.
    Inline(String),
    /// Payload read from a file when the droplet is created.
    File(Utf8PathBuf),
}

/// SSH settings used by the key steps and the communicator.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Login user.
    pub username: String,
    /// Port.
    pub port: u16,
    /// Time allowed for SSH to come up.
    pub timeout: Duration,
    /// Existing account key id.
    pub key_id: Option<u64>,
    /// Private key file, tilde-expanded.
    pub private_key_file: Option<Utf8PathBuf>,
    /// Never generate a temporary keypair.
    pub skip_keygen: bool,
    /// `ssh` executable.
    pub ssh_bin: String,
}

/// Validated, immutable build configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
#[expect(
    clippy::struct_excessive_bools,
    reason = "mirrors the provider toggles of BuilderConfig"
)]
pub struct BuildConfig {
    /// API token.
    pub token: String,
    /// API base URL override.
    pub api_url: Option<String>,
    /// Retry policy for every API call.
    pub retry: RetryPolicy,
    /// Build region slug.
    pub region: String,
    /// Droplet size slug.
    pub size: String,
    /// Base image slug or id.
    pub image: String,
    /// Private networking.
    pub private_networking: bool,
    /// Monitoring agent.
    pub monitoring: bool,
    /// IPv6.
    pub ipv6: bool,
    /// Droplet agent; `None` keeps the provider default.
    pub droplet_agent: Option<bool>,
    /// Droplet tags.
    pub tags: Vec<String>,
    /// Cloud-init user data.
    pub user_data: Option<UserData>,
    /// VPC UUID.
    pub vpc_uuid: Option<String>,
    /// Connect over the private address.
    pub connect_with_private_ip: bool,
    /// Droplet name.
    pub droplet_name: String,
    /// Snapshot name.
    pub snapshot_name: String,
    /// Extra snapshot regions.
    pub snapshot_regions: Vec<String>,
    /// Wait for regional copies.
    pub wait_snapshot_transfer: bool,
    /// Droplet state timeout.
    pub state_timeout: Duration,
    /// Snapshot timeout.
    pub snapshot_timeout: Duration,
    /// Per-region transfer timeout.
    pub transfer_timeout: Duration,
    /// Interval between status polls.
    pub poll_interval: Duration,
    /// SSH settings.
    pub ssh: SshSettings,
    /// Dump the temporary private key to disk.
    pub debug: bool,
    /// Build name.
    pub build_name: String,
    /// Provisioning commands.
    pub provision_commands: Vec<String>,
}

impl BuildConfig {
    /// Returns `true` when the build must create its own keypair.
    #[must_use]
    pub const fn needs_temporary_key(&self) -> bool {
        !self.ssh.skip_keygen && (self.ssh.key_id.is_none() || self.ssh.private_key_file.is_none())
    }

    /// Returns `true` when the temporary private key is written to disk.
    #[must_use]
    pub const fn dumps_temporary_key(&self) -> bool {
        self.debug && self.ssh.private_key_file.is_none()
    }

    /// Path the debug key dump is written to.
    #[must_use]
    pub fn debug_key_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("do_{}.pem", self.build_name))
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl BuilderConfig {
    fn require_field(value: Option<&str>, metadata: &FieldMetadata) -> Result<String, ConfigError> {
        match value.map(str::trim) {
            Some(trimmed) if !trimmed.is_empty() => Ok(trimmed.to_owned()),
            _ => Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to dropsmith.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            ))),
        }
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables,
    /// and the token fallback variables are consulted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from("dropsmith")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        Ok(config.with_token_fallback(|name| std::env::var(name).ok()))
    }

    /// Fills an unset token from the fallback variables, read through
    /// `lookup`.
    #[must_use]
    pub fn with_token_fallback(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.token.as_deref().is_some_and(|token| !token.trim().is_empty()) {
            return self;
        }
        if let Some(token) = lookup(ACCESS_TOKEN_ENV).filter(|token| !token.trim().is_empty()) {
            self.token = Some(token);
        } else if let Some(token) = lookup(LEGACY_TOKEN_ENV).filter(|token| !token.trim().is_empty())
        {
            warn!("{LEGACY_TOKEN_ENV} is deprecated; set DIGITALOCEAN_TOKEN instead");
            self.token = Some(token);
        }
        self
    }

    /// Performs semantic validation and produces the immutable
    /// [`BuildConfig`]. Error messages include guidance on how to provide
    /// missing values via environment variables or configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when values conflict or are malformed.
    /// The latter lists every problem found, separated by `; `.
    pub fn validate(&self) -> Result<BuildConfig, ConfigError> {
        let token = Self::require_field(
            self.token.as_deref(),
            &FieldMetadata::new("DigitalOcean API token", "DIGITALOCEAN_TOKEN", "token"),
        )?;
        let region = Self::require_field(
            Some(&self.region),
            &FieldMetadata::new("build region", "DIGITALOCEAN_REGION", "region"),
        )?;
        let size = Self::require_field(
            Some(&self.size),
            &FieldMetadata::new("droplet size", "DIGITALOCEAN_SIZE", "size"),
        )?;
        let image = Self::require_field(
            Some(&self.image),
            &FieldMetadata::new("base image", "DIGITALOCEAN_IMAGE", "image"),
        )?;

        let mut problems = Vec::new();
        let retry = self
            .retry_policy()
            .map_err(|problem| problems.push(problem))
            .ok();
        if let Some(err) = self
            .api_url
            .as_deref()
            .and_then(|url| crate::api::parse_base_url(url).err())
        {
            problems.push(format!("api_url: {err}"));
        }

        problems.extend(self.tags.iter().filter(|tag| !is_valid_tag(tag)).map(|tag| {
            format!(
                "invalid tag {tag:?}: tags must be 1-{MAX_TAG_LEN} characters of \
                 letters, digits, ':', '_' or '-'"
            )
        }));

        let user_data = self
            .user_data_source()
            .map_err(|problem| problems.push(problem))
            .ok();

        if self.vpc_uuid.is_some() && !self.private_networking {
            problems.push(String::from(
                "vpc_uuid requires private_networking to be enabled",
            ));
        }
        if self.connect_with_private_ip && !self.private_networking {
            problems.push(String::from(
                "connect_with_private_ip requires private_networking to be enabled",
            ));
        }

        let private_key_file = self
            .ssh_private_key_file
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(|path| Utf8PathBuf::from(expand_tilde(path)));
        if self.ssh_key_id.is_some() && private_key_file.is_none() {
            problems.push(String::from("ssh_key_id requires ssh_private_key_file"));
        }

        problems.extend(
            [
                ("state_timeout_secs", self.state_timeout_secs),
                ("snapshot_timeout_secs", self.snapshot_timeout_secs),
                ("transfer_timeout_secs", self.transfer_timeout_secs),
                ("poll_interval_secs", self.poll_interval_secs),
                ("ssh_timeout_secs", self.ssh_timeout_secs),
            ]
            .into_iter()
            .filter(|(_, value)| *value == 0)
            .map(|(field, _)| format!("{field} must be greater than zero")),
        );

        let (Some(retry), Some(user_data), true) = (retry, user_data, problems.is_empty()) else {
            return Err(ConfigError::Invalid(problems.join("; ")));
        };

        Ok(BuildConfig {
            token,
            api_url: self.api_url.clone(),
            retry,
            region,
            size,
            image,
            private_networking: self.private_networking,
            monitoring: self.monitoring,
            ipv6: self.ipv6,
            droplet_agent: self.droplet_agent,
            tags: self.tags.clone(),
            user_data,
            vpc_uuid: self.vpc_uuid.clone(),
            connect_with_private_ip: self.connect_with_private_ip,
            droplet_name: self
                .droplet_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| format!("dropsmith-{}", Uuid::new_v4())),
            snapshot_name: self
                .snapshot_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(default_snapshot_name),
            snapshot_regions: self
                .snapshot_regions
                .iter()
                .map(|region| region.trim().to_owned())
                .filter(|region| !region.is_empty())
                .collect(),
            wait_snapshot_transfer: self.wait_snapshot_transfer,
            state_timeout: Duration::from_secs(self.state_timeout_secs),
            snapshot_timeout: Duration::from_secs(self.snapshot_timeout_secs),
            transfer_timeout: Duration::from_secs(self.transfer_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ssh: SshSettings {
                username: self.ssh_username.clone(),
                port: self.ssh_port,
                timeout: Duration::from_secs(self.ssh_timeout_secs),
                key_id: self.ssh_key_id,
                private_key_file,
                skip_keygen: self.skip_keygen,
                ssh_bin: self.ssh_bin.clone(),
            },
            debug: self.debug,
            build_name: self.build_name.clone(),
            provision_commands: self.provision_commands.clone(),
        })
    }

    fn retry_policy(&self) -> Result<RetryPolicy, String> {
        let wait_min = seconds("http_retry_wait_min", self.http_retry_wait_min)?;
        let wait_max = seconds("http_retry_wait_max", self.http_retry_wait_max)?;
        if wait_max < wait_min {
            return Err(String::from(
                "http_retry_wait_max must not be smaller than http_retry_wait_min",
            ));
        }
        Ok(RetryPolicy::new(self.http_retry_max, wait_min, wait_max))
    }

    fn user_data_source(&self) -> Result<Option<UserData>, String> {
        match (&self.user_data, &self.user_data_file) {
            (Some(_), Some(_)) => Err(String::from(
                "only one of user_data or user_data_file can be specified",
            )),
            (Some(inline), None) => Ok(Some(UserData::Inline(inline.clone()))),
            (None, Some(path)) => {
                let expanded = Utf8PathBuf::from(expand_tilde(path));
                if !expanded.is_file() {
                    return Err(format!("user_data_file not found: {expanded}"));
                }
                Ok(Some(UserData::File(expanded)))
            }
            (None, None) => Ok(None),
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|err| format!("{field}: {err}"))
}

fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-'))
}

fn default_snapshot_name() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    format!("dropsmith-{timestamp}")
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is not set the input is returned unchanged.
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A value is malformed or conflicts with another value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
