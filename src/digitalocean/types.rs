//! Wire types for the subset of the DigitalOcean v2 API used by the builder.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Lifecycle status reported for a droplet.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DropletStatus {
    /// Being created.
    New,
    /// Booted and reachable.
    Active,
    /// Powered off.
    Off,
    /// Archived by the provider.
    Archive,
    /// Creation failed.
    Errored,
    /// A status this client does not recognise.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for DropletStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Off => "off",
            Self::Archive => "archive",
            Self::Errored => "errored",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// An IPv4 interface attached to a droplet.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkV4 {
    /// Assigned address.
    pub ip_address: Ipv4Addr,
    /// `public` or `private`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// Network interfaces of a droplet.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Networks {
    /// IPv4 interfaces.
    #[serde(default)]
    pub v4: Vec<NetworkV4>,
}

/// Region reference embedded in droplet payloads.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RegionRef {
    /// Region slug, for example `nyc3`.
    pub slug: String,
}

/// Image reference embedded in droplet payloads.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DropletImage {
    /// Numeric image identifier, also reported for public slugs.
    pub id: u64,
}

/// A droplet as returned by `GET /v2/droplets/{id}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Droplet {
    /// Numeric droplet identifier.
    pub id: u64,
    /// Droplet name.
    pub name: String,
    /// Current lifecycle status.
    pub status: DropletStatus,
    /// Attached networks; empty until the droplet has booted.
    #[serde(default)]
    pub networks: Networks,
    /// Region the droplet lives in.
    #[serde(default)]
    pub region: Option<RegionRef>,
    /// Image the droplet was created from.
    #[serde(default)]
    pub image: Option<DropletImage>,
}

impl Droplet {
    fn address_of_kind(&self, kind: &str) -> Option<Ipv4Addr> {
        self.networks
            .v4
            .iter()
            .find(|net| net.kind == kind)
            .map(|net| net.ip_address)
    }

    /// First public IPv4 address, if assigned.
    #[must_use]
    pub fn public_ipv4(&self) -> Option<Ipv4Addr> {
        self.address_of_kind("public")
    }

    /// First private IPv4 address, if assigned.
    #[must_use]
    pub fn private_ipv4(&self) -> Option<Ipv4Addr> {
        self.address_of_kind("private")
    }
}

/// Status of an asynchronous provider action.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    /// Still running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Errored,
    /// A status this client does not recognise.
    #[serde(other)]
    Unknown,
}

/// An asynchronous action such as a shutdown, snapshot or image transfer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Action {
    /// Action identifier.
    pub id: u64,
    /// Current status.
    pub status: ActionStatus,
    /// Action type, for example `snapshot` or `transfer`.
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Region the action runs in, when reported.
    #[serde(default)]
    pub region_slug: Option<String>,
}

/// A snapshot image.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Image {
    /// Image identifier.
    pub id: u64,
    /// Image name.
    pub name: String,
    /// Regions holding a copy of the image.
    #[serde(default)]
    pub regions: Vec<String>,
}

/// A datacenter region.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Region {
    /// Region slug.
    pub slug: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Whether new resources may be created in the region.
    #[serde(default)]
    pub available: bool,
}

/// An SSH public key registered on the account.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SshKey {
    /// Key identifier.
    pub id: u64,
    /// MD5 fingerprint as reported by the provider.
    #[serde(default)]
    pub fingerprint: String,
    /// Key name.
    pub name: String,
}

/// Base image for a new droplet: a public slug or a numeric image id.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ImageRef {
    /// Numeric id of a private image or snapshot.
    Id(u64),
    /// Public image slug, for example `ubuntu-24-04-x64`.
    Slug(String),
}

impl ImageRef {
    /// Interprets an all-digit value as an image id and anything else as a
    /// slug.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        raw.parse::<u64>()
            .map_or_else(|_| Self::Slug(raw.to_owned()), Self::Id)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Slug(slug) => f.write_str(slug),
        }
    }
}

/// Body of `POST /v2/droplets`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DropletRequest {
    /// Droplet name.
    pub name: String,
    /// Region slug.
    pub region: String,
    /// Size slug.
    pub size: String,
    /// Base image.
    pub image: ImageRef,
    /// Ids of account SSH keys to install.
    pub ssh_keys: Vec<u64>,
    /// Enable private networking.
    pub private_networking: bool,
    /// Enable the monitoring agent.
    pub monitoring: bool,
    /// Enable IPv6.
    pub ipv6: bool,
    /// Cloud-init user data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    /// Tags applied to the droplet.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// VPC to place the droplet in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc_uuid: Option<String>,
    /// Install the droplet agent; left to the provider default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub with_droplet_agent: Option<bool>,
}

/// Actions issued against a droplet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DropletAction {
    /// Graceful ACPI shutdown.
    Shutdown,
    /// Hard power off.
    PowerOff,
    /// Snapshot the powered-off droplet under `name`.
    Snapshot {
        /// Snapshot name.
        name: String,
    },
}

impl DropletAction {
    /// JSON body for `POST /v2/droplets/{id}/actions`.
    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        match self {
            Self::Shutdown => serde_json::json!({ "type": "shutdown" }),
            Self::PowerOff => serde_json::json!({ "type": "power_off" }),
            Self::Snapshot { name } => serde_json::json!({ "type": "snapshot", "name": name }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn droplet_decodes_addresses_and_unknown_status() {
        let droplet: Droplet = serde_json::from_str(
            r#"{
                "id": 7,
                "name": "builder",
                "status": "migrating",
                "networks": {"v4": [
                    {"ip_address": "10.0.0.5", "type": "private"},
                    {"ip_address": "203.0.113.9", "type": "public"}
                ]},
                "region": {"slug": "nyc3"},
                "image": {"id": 129211873, "slug": "ubuntu-24-04-x64"}
            }"#,
        )
        .unwrap_or_else(|err| panic!("decode droplet: {err}"));

        assert_eq!(droplet.status, DropletStatus::Unknown);
        assert_eq!(droplet.public_ipv4(), Some(Ipv4Addr::new(203, 0, 113, 9)));
        assert_eq!(droplet.private_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(droplet.image, Some(DropletImage { id: 129_211_873 }));
    }

    #[test]
    fn action_status_uses_kebab_case() {
        let action: Action =
            serde_json::from_str(r#"{"id": 1, "status": "in-progress", "type": "snapshot"}"#)
                .unwrap_or_else(|err| panic!("decode action: {err}"));
        assert_eq!(action.status, ActionStatus::InProgress);
        assert_eq!(action.kind, "snapshot");
    }

    #[rstest]
    #[case("ubuntu-24-04-x64", ImageRef::Slug(String::from("ubuntu-24-04-x64")))]
    #[case("123456", ImageRef::Id(123_456))]
    fn image_ref_distinguishes_ids_from_slugs(#[case] raw: &str, #[case] expected: ImageRef) {
        assert_eq!(ImageRef::parse(raw), expected);
    }

    #[test]
    fn droplet_request_omits_unset_optionals() {
        let request = DropletRequest {
            name: String::from("b"),
            region: String::from("nyc3"),
            size: String::from("s-1vcpu-1gb"),
            image: ImageRef::Id(42),
            ssh_keys: vec![9],
            private_networking: false,
            monitoring: false,
            ipv6: false,
            user_data: None,
            tags: Vec::new(),
            vpc_uuid: None,
            with_droplet_agent: None,
        };
        let value = serde_json::to_value(&request).unwrap_or_else(|err| panic!("encode: {err}"));
        assert_eq!(value["image"], serde_json::json!(42));
        assert!(value.get("tags").is_none());
        assert!(value.get("with_droplet_agent").is_none());
    }
}
