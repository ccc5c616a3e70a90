//! Azure Resource Manager client.
//!
//! This module provides the HTTP client for the ARM REST API: bearer-token
//! authentication, retries for transient failures and polling of
//! long-running operations.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Client, Method, StatusCode, header};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::config::ConfigParser;
use crate::error::{CloudError, DeployError, Result};
use super::provider::CloudProvider;
use super::types::{
    ArmErrorResponse, ArmResource, ArmSnapshot, ProvisionedResource, ResourceAddress,
    ResourceRequest, Snapshot, TokenResponse,
};

/// ARM endpoint.
const ARM_URL: &str = "https://management.azure.com";

/// Entra ID token endpoint.
const LOGIN_URL: &str = "https://login.microsoftonline.com";

/// Scope requested for ARM tokens.
const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// API version for snapshot lookups.
const SNAPSHOT_API_VERSION: &str = "2023-04-02";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for transient failures.
const MAX_RETRIES: u32 = 3;

/// Delay between retries in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Interval between provisioning state polls.
const POLL_INTERVAL_SECS: u64 = 10;

/// Longest wait for a resource to reach a terminal state.
const POLL_TIMEOUT_SECS: u64 = 1800;

/// How ARM requests are authenticated.
#[derive(Clone)]
pub enum AzureAuth {
    /// A pre-issued bearer token.
    Token(String),
    /// Service principal client credentials.
    ClientSecret {
        /// Directory (tenant) id.
        tenant_id: String,
        /// Application (client) id.
        client_id: String,
        /// Client secret.
        client_secret: String,
    },
}

impl std::fmt::Debug for AzureAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(***)"),
            Self::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

impl AzureAuth {
    /// Reads credentials from the environment.
    ///
    /// `AZURE_ACCESS_TOKEN` wins over the service principal variables.
    ///
    /// # Errors
    ///
    /// Returns an error if neither form of credential is configured.
    pub fn from_env() -> Result<Self> {
        if let Some(token) = ConfigParser::optional_env("AZURE_ACCESS_TOKEN") {
            return Ok(Self::Token(token));
        }

        Ok(Self::ClientSecret {
            tenant_id: ConfigParser::required_env("AZURE_TENANT_ID")?,
            client_id: ConfigParser::required_env("AZURE_CLIENT_ID")?,
            client_secret: ConfigParser::required_env("AZURE_CLIENT_SECRET")?,
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

/// ARM API client.
#[derive(Debug)]
pub struct AzureClient {
    client: Client,
    subscription_id: String,
    auth: AzureAuth,
    arm_url: String,
    login_url: String,
    token: RwLock<Option<CachedToken>>,
    poll_interval: Duration,
    poll_timeout: Duration,
    retry_delay: Duration,
}

impl AzureClient {
    /// Creates a new ARM client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(subscription_id: &str, auth: AzureAuth) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| CloudError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            subscription_id: subscription_id.to_string(),
            auth,
            arm_url: ARM_URL.to_string(),
            login_url: LOGIN_URL.to_string(),
            token: RwLock::new(None),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            poll_timeout: Duration::from_secs(POLL_TIMEOUT_SECS),
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Creates a client from `AZURE_SUBSCRIPTION_ID` and the credential
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is missing or the HTTP client cannot be
    /// created.
    pub fn from_env() -> Result<Self> {
        let subscription_id = ConfigParser::required_env("AZURE_SUBSCRIPTION_ID")?;
        Self::new(&subscription_id, AzureAuth::from_env()?)
    }

    /// Points the client at other ARM and login endpoints.
    #[must_use]
    pub fn with_endpoints(mut self, arm_url: &str, login_url: &str) -> Self {
        self.arm_url = arm_url.trim_end_matches('/').to_string();
        self.login_url = login_url.trim_end_matches('/').to_string();
        self
    }

    /// Sets the polling interval and timeout for long-running operations.
    #[must_use]
    pub const fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    /// Sets the base delay between retries.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    fn url(&self, address: &ResourceAddress) -> String {
        format!(
            "{}{}?api-version={}",
            self.arm_url,
            address.resource_id(&self.subscription_id),
            address.kind.api_version()
        )
    }

    /// Returns a bearer token, fetching a new one when the cached token is
    /// about to expire.
    async fn access_token(&self) -> Result<String> {
        let (tenant_id, client_id, client_secret) = match &self.auth {
            AzureAuth::Token(token) => return Ok(token.clone()),
            AzureAuth::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => (tenant_id, client_id, client_secret),
        };

        if let Some(cached) = self.token.read().await.as_ref()
            && cached.expires_at > Utc::now() + ChronoDuration::minutes(5)
        {
            return Ok(cached.value.clone());
        }

        debug!("Requesting ARM token for client {}", client_id);
        let response = self
            .client
            .post(format!("{}/{tenant_id}/oauth2/v2.0/token", self.login_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", ARM_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| CloudError::network(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::Cloud(CloudError::AuthenticationFailed {
                message: format!("token endpoint returned {status}: {body}"),
            }));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CloudError::invalid_response(format!("Failed to parse token: {e}")))?;

        let lifetime = i64::try_from(token.expires_in.unwrap_or(3600)).unwrap_or(3600);
        *self.token.write().await = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(lifetime),
        });

        Ok(token.access_token)
    }

    /// Sends a request, retrying transient failures.
    ///
    /// Returns `None` for 404 responses.
    async fn execute<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Option<T>> {
        let mut last_error: Option<DeployError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = self.retry_delay * attempt;
                let delay = last_error
                    .as_ref()
                    .and_then(DeployError::retry_after_secs)
                    .map_or(backoff, |secs| backoff.max(Duration::from_secs(secs)));
                debug!("Retry attempt {attempt} of {MAX_RETRIES} in {delay:?}");
                tokio::time::sleep(delay).await;
            }

            match self.execute_once::<T>(method.clone(), url, body).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if e.is_retryable() {
                        warn!("Transient ARM failure: {}", e);
                        last_error = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DeployError::Cloud(CloudError::NetworkError {
                message: String::from("Max retries exceeded"),
            })
        }))
    }

    /// Executes a single request.
    async fn execute_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Option<T>> {
        trace!("{} {}", method, url);
        let token = self.access_token().await?;

        let mut request = self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {token}"));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CloudError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let retry_after = if retry_after == 0 { 60 } else { retry_after };

            return Err(DeployError::Cloud(CloudError::RateLimited {
                retry_after_secs: retry_after,
            }));
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::Cloud(CloudError::AuthenticationFailed {
                message: arm_message(&body),
            }));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::Cloud(CloudError::api_error(
                status.as_u16(),
                arm_message(&body),
            )));
        }

        // DELETE and some 202 responses carry no body.
        let text = response
            .text()
            .await
            .map_err(|e| CloudError::network(format!("Failed to read response: {e}")))?;
        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                CloudError::invalid_response(format!("Failed to parse response: {e}"))
            })?
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CloudError::invalid_response(format!("Unexpected response shape: {e}")).into())
    }

    /// Issues a PUT and waits for a terminal provisioning state.
    async fn put(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        let address = &request.address;
        info!("PUT {}", address);

        let url = self.url(address);
        let created: Option<ArmResource> =
            self.execute(Method::PUT, &url, Some(&request.body)).await?;
        let created = created.ok_or_else(|| {
            DeployError::Cloud(CloudError::ResourceNotFound {
                kind: address.kind.to_string(),
                name: address.name.clone(),
            })
        })?;

        let mut resource = ProvisionedResource::from_arm(address.clone(), created);
        let deadline = tokio::time::Instant::now() + self.poll_timeout;

        while !resource.is_terminal() {
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::Cloud(CloudError::Timeout {
                    kind: address.kind.to_string(),
                    name: address.name.clone(),
                }));
            }
            debug!(
                "{} is {}, polling",
                address,
                resource.provisioning_state.as_deref().unwrap_or("unknown")
            );
            tokio::time::sleep(self.poll_interval).await;

            resource = self.read(address).await?.ok_or_else(|| {
                DeployError::Cloud(CloudError::ResourceNotFound {
                    kind: address.kind.to_string(),
                    name: address.name.clone(),
                })
            })?;
        }

        if resource.is_failed() {
            return Err(DeployError::Cloud(CloudError::ProvisioningFailed {
                kind: address.kind.to_string(),
                name: address.name.clone(),
                message: format!(
                    "provisioning state {}",
                    resource.provisioning_state.as_deref().unwrap_or("unknown")
                ),
            }));
        }

        Ok(resource)
    }
}

/// Extracts the message from an ARM error body.
fn arm_message(body: &str) -> String {
    serde_json::from_str::<ArmErrorResponse>(body)
        .map(|e| format!("{}: {}", e.error.code, e.error.message))
        .unwrap_or_else(|_| body.to_string())
}

#[async_trait]
impl CloudProvider for AzureClient {
    async fn lookup_snapshot(&self, resource_group: &str, name: &str) -> Result<Snapshot> {
        let url = format!(
            "{}/subscriptions/{}/resourceGroups/{resource_group}/providers/Microsoft.Compute/snapshots/{name}?api-version={SNAPSHOT_API_VERSION}",
            self.arm_url, self.subscription_id
        );

        let snapshot: Option<ArmSnapshot> = self.execute(Method::GET, &url, None).await?;
        snapshot.map(Snapshot::from).ok_or_else(|| {
            DeployError::Cloud(CloudError::SnapshotNotFound {
                name: name.to_string(),
                resource_group: resource_group.to_string(),
            })
        })
    }

    async fn create(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        self.put(request).await
    }

    async fn read(&self, address: &ResourceAddress) -> Result<Option<ProvisionedResource>> {
        let resource: Option<ArmResource> =
            self.execute(Method::GET, &self.url(address), None).await?;
        Ok(resource.map(|r| ProvisionedResource::from_arm(address.clone(), r)))
    }

    async fn update(&self, request: &ResourceRequest) -> Result<ProvisionedResource> {
        self.put(request).await
    }

    async fn delete(&self, address: &ResourceAddress) -> Result<()> {
        info!("DELETE {}", address);
        let url = self.url(address);

        let deleted: Option<Value> = self.execute(Method::DELETE, &url, None).await?;
        if deleted.is_none() {
            return Err(DeployError::Cloud(CloudError::ResourceNotFound {
                kind: address.kind.to_string(),
                name: address.name.clone(),
            }));
        }

        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        while self.read(address).await?.is_some() {
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::Cloud(CloudError::Timeout {
                    kind: address.kind.to_string(),
                    name: address.name.clone(),
                }));
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "azure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use serde_json::json;
    use wiremock::matchers::{header as header_eq, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SUB: &str = "sub-1";

    async fn client(server: &MockServer) -> AzureClient {
        AzureClient::new(SUB, AzureAuth::Token(String::from("t0k3n")))
            .expect("client")
            .with_endpoints(&server.uri(), &server.uri())
            .with_polling(Duration::from_millis(10), Duration::from_millis(500))
            .with_retry_delay(Duration::from_millis(1))
    }

    fn vnet_address() -> ResourceAddress {
        ResourceAddress::new("rg", ResourceKind::VirtualNetwork, "vnet")
    }

    const VNET_PATH: &str =
        "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/vnet";

    #[tokio::test]
    async fn test_lookup_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/subscriptions/sub-1/resourceGroups/rg/providers/Microsoft.Compute/snapshots/dcsOsHdd",
            ))
            .and(query_param("api-version", SNAPSHOT_API_VERSION))
            .and(header_eq("authorization", "Bearer t0k3n"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "/snap/dcsOsHdd",
                "name": "dcsOsHdd",
                "location": "northcentralus",
                "properties": { "diskSizeGB": 256 }
            })))
            .mount(&server)
            .await;

        let snapshot = client(&server)
            .await
            .lookup_snapshot("rg", "dcsOsHdd")
            .await
            .expect("snapshot found");

        assert_eq!(snapshot.id, "/snap/dcsOsHdd");
        assert_eq!(snapshot.size_gb, 256);
    }

    #[tokio::test]
    async fn test_missing_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .lookup_snapshot("rg", "nope")
            .await
            .expect_err("not found");
        assert!(matches!(
            err,
            DeployError::Cloud(CloudError::SnapshotNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_put_polls_until_succeeded() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(VNET_PATH))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": VNET_PATH,
                "name": "vnet",
                "properties": { "provisioningState": "Updating" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(VNET_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": VNET_PATH,
                "name": "vnet",
                "tags": { "dcs-deploy-hash": "abc" },
                "properties": { "provisioningState": "Succeeded" }
            })))
            .mount(&server)
            .await;

        let request = ResourceRequest {
            address: vnet_address(),
            body: json!({ "location": "northcentralus", "properties": {} }),
        };
        let resource = client(&server).await.create(&request).await.expect("created");

        assert_eq!(resource.provisioning_state.as_deref(), Some("Succeeded"));
        assert_eq!(resource.spec_hash(), Some("abc"));
    }

    #[tokio::test]
    async fn test_failed_provisioning() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": VNET_PATH,
                "properties": { "provisioningState": "Failed" }
            })))
            .mount(&server)
            .await;

        let request = ResourceRequest {
            address: vnet_address(),
            body: json!({}),
        };
        let err = client(&server).await.update(&request).await.expect_err("failed");
        assert!(matches!(
            err,
            DeployError::Cloud(CloudError::ProvisioningFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(VNET_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(VNET_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": VNET_PATH,
                "properties": { "provisioningState": "Succeeded" }
            })))
            .mount(&server)
            .await;

        let resource = client(&server)
            .await
            .read(&vnet_address())
            .await
            .expect("read succeeds after retries");
        assert!(resource.is_some());
    }

    #[tokio::test]
    async fn test_arm_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "code": "InvalidParameter", "message": "bad prefix" }
            })))
            .mount(&server)
            .await;

        let request = ResourceRequest {
            address: vnet_address(),
            body: json!({}),
        };
        let err = client(&server).await.create(&request).await.expect_err("rejected");
        match err {
            DeployError::Cloud(CloudError::ApiRequestFailed { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "InvalidParameter: bad prefix");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_delete_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .delete(&vnet_address())
            .await
            .expect_err("missing");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_waits_for_removal() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(VNET_PATH))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(VNET_PATH))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client(&server)
            .await
            .delete(&vnet_address())
            .await
            .expect("deleted");
    }

    #[tokio::test]
    async fn test_client_credentials_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "issued",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header_eq("authorization", "Bearer issued"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = AzureClient::new(
            SUB,
            AzureAuth::ClientSecret {
                tenant_id: String::from("tenant-1"),
                client_id: String::from("app"),
                client_secret: String::from("secret"),
            },
        )
        .expect("client")
        .with_endpoints(&server.uri(), &server.uri());

        assert!(client.read(&vnet_address()).await.expect("read").is_none());
        assert!(client.read(&vnet_address()).await.expect("read").is_none());
    }

    #[test]
    fn test_auth_debug_is_redacted() {
        let auth = AzureAuth::ClientSecret {
            tenant_id: String::from("t"),
            client_id: String::from("c"),
            client_secret: String::from("very-secret"),
        };
        assert!(!format!("{auth:?}").contains("very-secret"));
        assert!(!format!("{:?}", AzureAuth::Token(String::from("bearer-value"))).contains("bearer-value"));
    }
}
