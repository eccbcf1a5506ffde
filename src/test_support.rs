//! Test support utilities shared across unit and integration tests.
//!
//! Every double records what it was asked to do behind an `Arc<Mutex<_>>`,
//! so a clone handed to the code under test and the clone kept by the test
//! observe the same history.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::api::{ApiError, ApiRequest, ApiResponse, RetryPolicy, Transport, TransportFuture};
use crate::cancel::CancelToken;
use crate::config::{BuildConfig, SshSettings};
use crate::digitalocean::{
    Action, ActionStatus, Droplet, DropletAction, DropletImage, DropletRequest, DropletStatus,
    Image, NetworkV4, Networks, Provider, ProviderFuture, Region, RegionRef, SshKey,
};
use crate::provision::{
    CommandOutput, CommandRunner, Communicator, ConnectTarget, ProvisionError, ProvisionFuture,
    ProvisionHook,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport that replays queued responses in FIFO order and records every
/// request it receives.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<ApiResponse>>>,
    requests: Arc<Mutex<Vec<ApiRequest>>>,
}

impl ScriptedTransport {
    /// Creates a transport with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_status(&self, status: u16, body: impl Into<String>) {
        locked(&self.responses).push_back(ApiResponse::new(status, body));
    }

    /// Number of requests sent so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        locked(&self.requests).len()
    }

    /// Requests sent so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ApiRequest> {
        locked(&self.requests).clone()
    }
}

impl Transport for ScriptedTransport {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> TransportFuture<'a> {
        locked(&self.requests).push(request.clone());
        let response = locked(&self.responses)
            .pop_front()
            .ok_or_else(|| ApiError::Transport {
                message: String::from("no scripted response available"),
            });
        Box::pin(std::future::ready(response))
    }
}

/// Droplet id handed out by [`ScriptedProvider`].
pub const DROPLET_ID: u64 = 4242;
/// Account key id handed out by [`ScriptedProvider`].
pub const KEY_ID: u64 = 77;
/// Snapshot image id reported by [`ScriptedProvider`].
pub const SNAPSHOT_ID: u64 = 900;
/// Image id reported for the scripted droplet.
pub const SOURCE_IMAGE_ID: u64 = 129_211_873;
/// Public address reported for the scripted droplet.
pub const PUBLIC_ADDRESS: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 10);
/// Private address reported for the scripted droplet.
pub const PRIVATE_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 110, 0, 5);

/// A call received by [`ScriptedProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// `list_regions`.
    ListRegions,
    /// `create_key`.
    CreateKey {
        /// Key name.
        name: String,
        /// Public key.
        public_key: String,
    },
    /// `delete_key`.
    DeleteKey(u64),
    /// `create_droplet`.
    CreateDroplet(DropletRequest),
    /// `get_droplet`.
    GetDroplet(u64),
    /// `droplet_action`.
    DropletAction(DropletAction),
    /// `get_action`.
    GetAction(u64),
    /// `droplet_snapshots`.
    DropletSnapshots(u64),
    /// `transfer_image`.
    TransferImage {
        /// Image transferred.
        image_id: u64,
        /// Target region.
        region: String,
    },
    /// `get_image_action`.
    GetImageAction {
        /// Image polled.
        image_id: u64,
        /// Action polled.
        action_id: u64,
    },
}

#[derive(Debug, Default)]
struct ProviderScript {
    regions: Vec<Region>,
    droplet_statuses: VecDeque<DropletStatus>,
    droplet: Option<DropletRequest>,
    powered_off: bool,
    without_address: bool,
    action_statuses: BTreeMap<&'static str, ActionStatus>,
    actions: BTreeMap<u64, &'static str>,
    next_action_id: u64,
    snapshot_name: Option<String>,
    transfer_statuses: BTreeMap<String, ActionStatus>,
    transfer_polls: BTreeMap<String, u32>,
    failing_transfers: BTreeSet<String>,
    transfer_actions: BTreeMap<u64, String>,
    create_droplet_error: Option<ApiError>,
    delete_key_error: Option<ApiError>,
    cancel_during_readiness: Option<CancelToken>,
    calls: Vec<ProviderCall>,
}

impl ProviderScript {
    fn next_action(&mut self, kind: &'static str) -> u64 {
        self.next_action_id += 1;
        self.actions.insert(self.next_action_id, kind);
        self.next_action_id
    }

    fn droplet_status(&mut self) -> DropletStatus {
        if self.powered_off {
            return DropletStatus::Off;
        }
        if self.droplet_statuses.len() > 1 {
            return self
                .droplet_statuses
                .pop_front()
                .unwrap_or(DropletStatus::Active);
        }
        self.droplet_statuses
            .front()
            .copied()
            .unwrap_or(DropletStatus::Active)
    }

    fn action_status(&self, kind: &str) -> ActionStatus {
        self.action_statuses
            .get(kind)
            .copied()
            .unwrap_or(ActionStatus::Completed)
    }

    fn build_region(&self) -> String {
        self.droplet
            .as_ref()
            .map_or_else(|| String::from("nyc3"), |request| request.region.clone())
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::Status {
        status: 404,
        id: Some(String::from("not_found")),
        message: format!("{what} not found"),
    }
}

/// In-memory [`Provider`] whose droplet, action and transfer outcomes are
/// scripted by the test. Unscripted actions complete immediately.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<ProviderScript>>,
}

impl ScriptedProvider {
    /// Creates a provider whose droplet becomes active on the first poll.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Regions reported by `list_regions`.
    pub fn set_regions(&self, slugs: &[&str]) {
        locked(&self.script).regions = slugs
            .iter()
            .map(|slug| Region {
                slug: (*slug).to_owned(),
                name: slug.to_uppercase(),
                available: true,
            })
            .collect();
    }

    /// Queues droplet statuses; the last one repeats.
    pub fn push_droplet_status(&self, status: DropletStatus) {
        locked(&self.script).droplet_statuses.push_back(status);
    }

    /// Reports no addresses for the droplet.
    pub fn without_address(&self) {
        locked(&self.script).without_address = true;
    }

    /// Status reported for droplet actions of `kind` (`shutdown`,
    /// `power_off` or `snapshot`).
    pub fn set_action_status(&self, kind: &'static str, status: ActionStatus) {
        locked(&self.script).action_statuses.insert(kind, status);
    }

    /// Status reported for the transfer into `region`.
    pub fn set_transfer_status(&self, region: &str, status: ActionStatus) {
        locked(&self.script)
            .transfer_statuses
            .insert(region.to_owned(), status);
    }

    /// Reports the transfer into `region` as in progress until it has been
    /// polled `polls` times.
    pub fn complete_transfer_after(&self, region: &str, polls: u32) {
        locked(&self.script)
            .transfer_polls
            .insert(region.to_owned(), polls);
    }

    /// Makes initiating a transfer into `region` fail.
    pub fn fail_transfer(&self, region: &str) {
        locked(&self.script)
            .failing_transfers
            .insert(region.to_owned());
    }

    /// Makes `create_droplet` fail with `err`.
    pub fn fail_create_droplet(&self, err: ApiError) {
        locked(&self.script).create_droplet_error = Some(err);
    }

    /// Makes `delete_key` fail with `err`.
    pub fn fail_delete_key(&self, err: ApiError) {
        locked(&self.script).delete_key_error = Some(err);
    }

    /// Cancels `token` the first time the droplet is polled.
    pub fn cancel_during_readiness(&self, token: CancelToken) {
        locked(&self.script).cancel_during_readiness = Some(token);
    }

    /// Every call received, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        locked(&self.script).calls.clone()
    }

    /// Number of calls matching `predicate`.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&ProviderCall) -> bool) -> usize {
        locked(&self.script)
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Regions transfers were initiated for, in order.
    #[must_use]
    pub fn transferred_regions(&self) -> Vec<String> {
        locked(&self.script)
            .calls
            .iter()
            .filter_map(|call| match call {
                ProviderCall::TransferImage { region, .. } => Some(region.clone()),
                _ => None,
            })
            .collect()
    }

    fn droplet(script: &mut ProviderScript) -> Droplet {
        let status = script.droplet_status();
        let v4 = if script.without_address {
            Vec::new()
        } else {
            vec![
                NetworkV4 {
                    ip_address: PUBLIC_ADDRESS,
                    kind: String::from("public"),
                },
                NetworkV4 {
                    ip_address: PRIVATE_ADDRESS,
                    kind: String::from("private"),
                },
            ]
        };
        Droplet {
            id: DROPLET_ID,
            name: script
                .droplet
                .as_ref()
                .map_or_else(String::new, |request| request.name.clone()),
            status,
            networks: Networks { v4 },
            region: Some(RegionRef {
                slug: script.build_region(),
            }),
            image: Some(DropletImage { id: SOURCE_IMAGE_ID }),
        }
    }
}

impl Provider for ScriptedProvider {
    fn list_regions(&self) -> ProviderFuture<'_, Vec<Region>> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::ListRegions);
        Box::pin(std::future::ready(Ok(script.regions.clone())))
    }

    fn create_key<'a>(&'a self, name: &'a str, public_key: &'a str) -> ProviderFuture<'a, SshKey> {
        locked(&self.script).calls.push(ProviderCall::CreateKey {
            name: name.to_owned(),
            public_key: public_key.to_owned(),
        });
        Box::pin(std::future::ready(Ok(SshKey {
            id: KEY_ID,
            fingerprint: String::from("aa:bb"),
            name: name.to_owned(),
        })))
    }

    fn delete_key(&self, key_id: u64) -> ProviderFuture<'_, ()> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::DeleteKey(key_id));
        let result = script.delete_key_error.clone().map_or(Ok(()), Err);
        Box::pin(std::future::ready(result))
    }

    fn create_droplet<'a>(&'a self, request: &'a DropletRequest) -> ProviderFuture<'a, Droplet> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::CreateDroplet(request.clone()));
        if let Some(err) = script.create_droplet_error.clone() {
            return Box::pin(std::future::ready(Err(err)));
        }
        script.droplet = Some(request.clone());
        let mut droplet = Self::droplet(&mut script);
        droplet.status = DropletStatus::New;
        droplet.networks = Networks::default();
        Box::pin(std::future::ready(Ok(droplet)))
    }

    fn get_droplet(&self, droplet_id: u64) -> ProviderFuture<'_, Droplet> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::GetDroplet(droplet_id));
        if let Some(token) = script.cancel_during_readiness.take() {
            token.cancel();
            let mut droplet = Self::droplet(&mut script);
            droplet.status = DropletStatus::New;
            return Box::pin(std::future::ready(Ok(droplet)));
        }
        Box::pin(std::future::ready(Ok(Self::droplet(&mut script))))
    }

    fn droplet_action<'a>(
        &'a self,
        _droplet_id: u64,
        action: &'a DropletAction,
    ) -> ProviderFuture<'a, Action> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::DropletAction(action.clone()));
        let kind = match action {
            DropletAction::Shutdown => "shutdown",
            DropletAction::PowerOff => "power_off",
            DropletAction::Snapshot { name } => {
                script.snapshot_name = Some(name.clone());
                "snapshot"
            }
        };
        if matches!(action, DropletAction::PowerOff)
            || (matches!(action, DropletAction::Shutdown)
                && script.action_status(kind) == ActionStatus::Completed)
        {
            script.powered_off = true;
        }
        let id = script.next_action(kind);
        Box::pin(std::future::ready(Ok(Action {
            id,
            status: ActionStatus::InProgress,
            kind: kind.to_owned(),
            region_slug: Some(script.build_region()),
        })))
    }

    fn get_action(&self, action_id: u64) -> ProviderFuture<'_, Action> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::GetAction(action_id));
        let result = script
            .actions
            .get(&action_id)
            .copied()
            .map(|kind| Action {
                id: action_id,
                status: script.action_status(kind),
                kind: kind.to_owned(),
                region_slug: Some(script.build_region()),
            })
            .ok_or_else(|| not_found("action"));
        Box::pin(std::future::ready(result))
    }

    fn droplet_snapshots(&self, droplet_id: u64) -> ProviderFuture<'_, Vec<Image>> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::DropletSnapshots(droplet_id));
        let region = script.build_region();
        let images = script
            .snapshot_name
            .clone()
            .map(|name| Image {
                id: SNAPSHOT_ID,
                name,
                regions: vec![region],
            })
            .into_iter()
            .collect();
        Box::pin(std::future::ready(Ok(images)))
    }

    fn transfer_image<'a>(
        &'a self,
        image_id: u64,
        region: &'a str,
    ) -> ProviderFuture<'a, Action> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::TransferImage {
            image_id,
            region: region.to_owned(),
        });
        if script.failing_transfers.contains(region) {
            return Box::pin(std::future::ready(Err(ApiError::Status {
                status: 422,
                id: Some(String::from("unprocessable_entity")),
                message: format!("cannot transfer to {region}"),
            })));
        }
        let id = script.next_action("transfer");
        script.transfer_actions.insert(id, region.to_owned());
        Box::pin(std::future::ready(Ok(Action {
            id,
            status: ActionStatus::InProgress,
            kind: String::from("transfer"),
            region_slug: Some(region.to_owned()),
        })))
    }

    fn get_image_action(&self, image_id: u64, action_id: u64) -> ProviderFuture<'_, Action> {
        let mut script = locked(&self.script);
        script.calls.push(ProviderCall::GetImageAction {
            image_id,
            action_id,
        });
        let Some(region) = script.transfer_actions.get(&action_id).cloned() else {
            return Box::pin(std::future::ready(Err(not_found("image action"))));
        };
        let status = match script.transfer_polls.get_mut(&region) {
            Some(remaining) if *remaining > 1 => {
                *remaining -= 1;
                ActionStatus::InProgress
            }
            Some(_) => ActionStatus::Completed,
            None => script
                .transfer_statuses
                .get(&region)
                .copied()
                .unwrap_or(ActionStatus::Completed),
        };
        let result = Ok(Action {
            id: action_id,
            status,
            kind: String::from("transfer"),
            region_slug: Some(region),
        });
        Box::pin(std::future::ready(result))
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy().into_owned()),
            )
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        locked(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        locked(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ProvisionError> {
        locked(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        locked(&self.responses)
            .pop_front()
            .ok_or_else(|| ProvisionError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

#[derive(Debug, Default)]
struct CommunicatorLog {
    connects: Vec<ConnectTarget>,
    removed_keys: Vec<String>,
    connect_error: Option<ProvisionError>,
}

/// [`Communicator`] that accepts every connection and records what it was
/// asked to do.
#[derive(Clone, Debug, Default)]
pub struct RecordingCommunicator {
    log: Arc<Mutex<CommunicatorLog>>,
}

impl RecordingCommunicator {
    /// Creates a communicator that always connects.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `connect` fail with `err`.
    pub fn fail_connect(&self, err: ProvisionError) {
        locked(&self.log).connect_error = Some(err);
    }

    /// Targets passed to `connect`.
    #[must_use]
    pub fn connects(&self) -> Vec<ConnectTarget> {
        locked(&self.log).connects.clone()
    }

    /// Public keys passed to `remove_temporary_key`.
    #[must_use]
    pub fn removed_keys(&self) -> Vec<String> {
        locked(&self.log).removed_keys.clone()
    }
}

impl Communicator for RecordingCommunicator {
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
        _cancel: &'a CancelToken,
    ) -> ProvisionFuture<'a> {
        let mut log = locked(&self.log);
        log.connects.push(target.clone());
        let result = log.connect_error.clone().map_or(Ok(()), Err);
        Box::pin(std::future::ready(result))
    }

    fn remove_temporary_key<'a>(
        &'a self,
        _target: &'a ConnectTarget,
        public_key: &'a str,
    ) -> ProvisionFuture<'a> {
        locked(&self.log).removed_keys.push(public_key.to_owned());
        Box::pin(std::future::ready(Ok(())))
    }
}

/// [`ProvisionHook`] that records each invocation and optionally fails.
#[derive(Clone, Debug, Default)]
pub struct RecordingHook {
    calls: Arc<Mutex<Vec<ConnectTarget>>>,
    error: Arc<Mutex<Option<ProvisionError>>>,
}

impl RecordingHook {
    /// Creates a hook that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every provision call fail with `err`.
    pub fn fail_with(&self, err: ProvisionError) {
        *locked(&self.error) = Some(err);
    }

    /// Targets the hook ran against.
    #[must_use]
    pub fn calls(&self) -> Vec<ConnectTarget> {
        locked(&self.calls).clone()
    }
}

impl ProvisionHook for RecordingHook {
    fn provision<'a>(
        &'a self,
        target: &'a ConnectTarget,
        _cancel: &'a CancelToken,
    ) -> ProvisionFuture<'a> {
        locked(&self.calls).push(target.clone());
        let result = locked(&self.error).clone().map_or(Ok(()), Err);
        Box::pin(std::future::ready(result))
    }
}

/// Valid configuration with millisecond timeouts for fast tests.
#[must_use]
pub fn build_config() -> BuildConfig {
    BuildConfig {
        token: String::from("dop_v1_test_token"),
        api_url: None,
        retry: RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1)),
        region: String::from("nyc3"),
        size: String::from("s-1vcpu-1gb"),
        image: String::from("ubuntu-24-04-x64"),
        private_networking: false,
        monitoring: false,
        ipv6: false,
        droplet_agent: None,
        tags: Vec::new(),
        user_data: None,
        vpc_uuid: None,
        connect_with_private_ip: false,
        droplet_name: String::from("dropsmith-test"),
        snapshot_name: String::from("dropsmith-test-snapshot"),
        snapshot_regions: Vec::new(),
        wait_snapshot_transfer: true,
        state_timeout: Duration::from_millis(200),
        snapshot_timeout: Duration::from_millis(200),
        transfer_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(1),
        ssh: SshSettings {
            username: String::from("root"),
            port: 22,
            timeout: Duration::from_secs(1),
            key_id: None,
            private_key_file: None,
            skip_keygen: false,
            ssh_bin: String::from("ssh"),
        },
        debug: false,
        build_name: String::from("test"),
        provision_commands: Vec::new(),
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and removes environment variables while holding [`ENV_LOCK`].
    /// A `None` value removes the variable.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
