//! DigitalOcean v2 provider.
//!
//! [`Provider`] is the seam the build steps talk to. [`DigitalOceanProvider`]
//! implements it over a [`RetryingClient`], so every call made by a step is
//! subject to the same retry budget.

use std::future::Future;
use std::pin::Pin;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::api::{
    ApiError, ApiRequest, ApiResponse, HttpTransport, RetryPolicy, RetryingClient, Transport,
};

pub mod types;

pub use types::{
    Action, ActionStatus, Droplet, DropletAction, DropletImage, DropletRequest, DropletStatus,
    Image, ImageRef, NetworkV4, Networks, Region, RegionRef, SshKey,
};

/// Page size used for list calls.
pub const PAGE_SIZE: u32 = 200;

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Operations the builder needs from the cloud provider.
pub trait Provider: Send + Sync {
    /// Lists available regions (first page of [`PAGE_SIZE`]).
    fn list_regions(&self) -> ProviderFuture<'_, Vec<Region>>;

    /// Registers an SSH public key on the account.
    fn create_key<'a>(&'a self, name: &'a str, public_key: &'a str) -> ProviderFuture<'a, SshKey>;

    /// Removes an SSH key from the account.
    fn delete_key(&self, key_id: u64) -> ProviderFuture<'_, ()>;

    /// Creates a droplet.
    fn create_droplet<'a>(&'a self, request: &'a DropletRequest) -> ProviderFuture<'a, Droplet>;

    /// Reads a droplet.
    fn get_droplet(&self, droplet_id: u64) -> ProviderFuture<'_, Droplet>;

    /// Issues an action against a droplet.
    fn droplet_action<'a>(
        &'a self,
        droplet_id: u64,
        action: &'a DropletAction,
    ) -> ProviderFuture<'a, Action>;

    /// Reads an action by id.
    fn get_action(&self, action_id: u64) -> ProviderFuture<'_, Action>;

    /// Lists snapshots taken from a droplet.
    fn droplet_snapshots(&self, droplet_id: u64) -> ProviderFuture<'_, Vec<Image>>;

    /// Starts copying an image into `region`.
    fn transfer_image<'a>(&'a self, image_id: u64, region: &'a str)
    -> ProviderFuture<'a, Action>;

    /// Reads an action started against an image.
    fn get_image_action(&self, image_id: u64, action_id: u64) -> ProviderFuture<'_, Action>;
}

#[derive(Deserialize)]
struct RegionsEnvelope {
    regions: Vec<Region>,
}

#[derive(Deserialize)]
struct SshKeyEnvelope {
    ssh_key: SshKey,
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct ActionEnvelope {
    action: Action,
}

#[derive(Deserialize)]
struct SnapshotsEnvelope {
    snapshots: Vec<Image>,
}

/// [`Provider`] backed by the DigitalOcean HTTP API.
#[derive(Clone, Debug)]
pub struct DigitalOceanProvider<T = HttpTransport> {
    client: RetryingClient<T>,
}

impl DigitalOceanProvider<HttpTransport> {
    /// Builds a provider talking to `base_url` (or the public API).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the HTTP transport cannot be constructed.
    pub fn connect(
        token: &str,
        base_url: Option<&str>,
        policy: RetryPolicy,
    ) -> Result<Self, ApiError> {
        let transport = HttpTransport::new(token, base_url)?;
        Ok(Self::new(RetryingClient::new(transport, policy)))
    }
}

impl<T: Transport> DigitalOceanProvider<T> {
    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: RetryingClient<T>) -> Self {
        Self { client }
    }

    async fn call<R: DeserializeOwned>(&self, request: ApiRequest) -> Result<R, ApiError> {
        let response: ApiResponse = self.client.execute(&request).await?;
        response.json()
    }

    fn paged(path: impl Into<String>) -> ApiRequest {
        ApiRequest::get(path)
            .with_query("page", "1")
            .with_query("per_page", PAGE_SIZE.to_string())
    }

    fn encode<B: serde::Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(body).map_err(|err| ApiError::Decode {
            message: err.to_string(),
        })
    }
}

impl<T: Transport> Provider for DigitalOceanProvider<T> {
    fn list_regions(&self) -> ProviderFuture<'_, Vec<Region>> {
        Box::pin(async move {
            let envelope: RegionsEnvelope = self.call(Self::paged("v2/regions")).await?;
            Ok(envelope.regions)
        })
    }

    fn create_key<'a>(&'a self, name: &'a str, public_key: &'a str) -> ProviderFuture<'a, SshKey> {
        Box::pin(async move {
            let body = serde_json::json!({ "name": name, "public_key": public_key });
            let envelope: SshKeyEnvelope =
                self.call(ApiRequest::post("v2/account/keys", body)).await?;
            Ok(envelope.ssh_key)
        })
    }

    fn delete_key(&self, key_id: u64) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            self.client
                .execute(&ApiRequest::delete(format!("v2/account/keys/{key_id}")))
                .await?;
            Ok(())
        })
    }

    fn create_droplet<'a>(&'a self, request: &'a DropletRequest) -> ProviderFuture<'a, Droplet> {
        Box::pin(async move {
            let body = Self::encode(request)?;
            let envelope: DropletEnvelope =
                self.call(ApiRequest::post("v2/droplets", body)).await?;
            Ok(envelope.droplet)
        })
    }

    fn get_droplet(&self, droplet_id: u64) -> ProviderFuture<'_, Droplet> {
        Box::pin(async move {
            let envelope: DropletEnvelope = self
                .call(ApiRequest::get(format!("v2/droplets/{droplet_id}")))
                .await?;
            Ok(envelope.droplet)
        })
    }

    fn droplet_action<'a>(
        &'a self,
        droplet_id: u64,
        action: &'a DropletAction,
    ) -> ProviderFuture<'a, Action> {
        Box::pin(async move {
            let request =
                ApiRequest::post(format!("v2/droplets/{droplet_id}/actions"), action.body());
            let envelope: ActionEnvelope = self.call(request).await?;
            Ok(envelope.action)
        })
    }

    fn get_action(&self, action_id: u64) -> ProviderFuture<'_, Action> {
        Box::pin(async move {
            let envelope: ActionEnvelope = self
                .call(ApiRequest::get(format!("v2/actions/{action_id}")))
                .await?;
            Ok(envelope.action)
        })
    }

    fn droplet_snapshots(&self, droplet_id: u64) -> ProviderFuture<'_, Vec<Image>> {
        Box::pin(async move {
            let envelope: SnapshotsEnvelope = self
                .call(Self::paged(format!("v2/droplets/{droplet_id}/snapshots")))
                .await?;
            Ok(envelope.snapshots)
        })
    }

    fn transfer_image<'a>(
        &'a self,
        image_id: u64,
        region: &'a str,
    ) -> ProviderFuture<'a, Action> {
        Box::pin(async move {
            let body = serde_json::json!({ "type": "transfer", "region": region });
            let envelope: ActionEnvelope = self
                .call(ApiRequest::post(format!("v2/images/{image_id}/actions"), body))
                .await?;
            Ok(envelope.action)
        })
    }

    fn get_image_action(&self, image_id: u64, action_id: u64) -> ProviderFuture<'_, Action> {
        Box::pin(async move {
            let envelope: ActionEnvelope = self
                .call(ApiRequest::get(format!(
                    "v2/images/{image_id}/actions/{action_id}"
                )))
                .await?;
            Ok(envelope.action)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Method;
    use crate::test_support::ScriptedTransport;
    use std::time::Duration;

    fn provider(transport: &ScriptedTransport) -> DigitalOceanProvider<ScriptedTransport> {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        DigitalOceanProvider::new(RetryingClient::new(transport.clone(), policy))
    }

    #[tokio::test]
    async fn list_regions_requests_a_single_large_page() {
        let transport = ScriptedTransport::new();
        transport.push_status(
            200,
            r#"{"regions":[{"slug":"nyc3","name":"New York 3","available":true}]}"#,
        );

        let regions = provider(&transport)
            .list_regions()
            .await
            .unwrap_or_else(|err| panic!("list regions: {err}"));

        assert_eq!(regions.len(), 1);
        let requests = transport.requests();
        let request = requests.first().unwrap_or_else(|| panic!("no request recorded"));
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "v2/regions");
        assert!(
            request
                .query
                .contains(&(String::from("per_page"), String::from("200")))
        );
    }

    #[tokio::test]
    async fn transfer_image_posts_transfer_action() {
        let transport = ScriptedTransport::new();
        transport.push_status(
            201,
            r#"{"action":{"id":55,"status":"in-progress","type":"transfer","region_slug":"ams3"}}"#,
        );

        let action = provider(&transport)
            .transfer_image(9, "sfo3")
            .await
            .unwrap_or_else(|err| panic!("transfer: {err}"));

        assert_eq!(action.id, 55);
        let requests = transport.requests();
        let request = requests.first().unwrap_or_else(|| panic!("no request recorded"));
        assert_eq!(request.path, "v2/images/9/actions");
        assert_eq!(
            request.body,
            Some(serde_json::json!({"type": "transfer", "region": "sfo3"}))
        );
    }

    #[tokio::test]
    async fn provider_calls_share_the_retry_budget() {
        let transport = ScriptedTransport::new();
        transport.push_status(429, "{}");
        transport.push_status(
            200,
            r#"{"droplet":{"id":3,"name":"d","status":"active"}}"#,
        );

        let droplet = provider(&transport)
            .get_droplet(3)
            .await
            .unwrap_or_else(|err| panic!("get droplet: {err}"));

        assert_eq!(droplet.status, DropletStatus::Active);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn delete_key_surfaces_not_found() {
        let transport = ScriptedTransport::new();
        transport.push_status(404, r#"{"id":"not_found","message":"gone"}"#);

        let err = provider(&transport)
            .delete_key(12)
            .await
            .expect_err("404 should surface");

        assert!(err.is_not_found());
    }
}
