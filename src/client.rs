//! IPAM client adapter.
//!
//! [`IpamApi`] is the capability surface the lifecycle code depends on.
//! [`PhpIpamClient`] implements it over the phpIPAM REST API using token
//! authentication; [`MemoryIpam`](crate::memory::MemoryIpam) implements it
//! in-process.
//!
//! Every call returns the decoded [`ApiResponse`] envelope, including
//! non-success statuses. An `Err` means the call itself did not complete.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::config::Config;
use crate::models::{Address, ApiResponse, Section, Subnet};

/// Format of the `expires` field returned by the login endpoint.
const TOKEN_EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Tokens closer than this to expiry are renewed before use.
const TOKEN_RENEWAL_MARGIN_SECONDS: i64 = 60;

/// Envelope codes phpIPAM uses for a missing, expired or invalid token.
const CODE_UNAUTHORIZED: u16 = 401;
const CODE_FORBIDDEN: u16 = 403;

/// Errors raised when an IPAM call cannot be completed.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("URL {0} cannot be used as an API base")]
    BaseUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("failed to decode response (HTTP {status}): {source}")]
    Decode {
        status: u16,
        #[source]
        source: serde_json::Error,
    },

    /// The backend refused to serve the call.
    #[error("backend unavailable: {0}")]
    Backend(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Operations required from an IPAM service.
#[async_trait]
pub trait IpamApi: Send + Sync {
    async fn list_sections(&self) -> ClientResult<ApiResponse<Vec<Section>>>;

    async fn list_section_subnets(&self, section_id: &str)
    -> ClientResult<ApiResponse<Vec<Subnet>>>;

    async fn search_hostname(&self, hostname: &str) -> ClientResult<ApiResponse<Vec<Address>>>;

    async fn search_ip(&self, ip: &str) -> ClientResult<ApiResponse<Vec<Address>>>;

    async fn get_address(&self, address_id: &str) -> ClientResult<ApiResponse<Address>>;

    async fn get_subnet(&self, subnet_id: &str) -> ClientResult<ApiResponse<Subnet>>;

    async fn get_section(&self, section_id: &str) -> ClientResult<ApiResponse<Section>>;

    /// Claims the first free address in a subnet. The payload is the IP literal.
    async fn create_first_free(
        &self,
        subnet_id: &str,
        hostname: &str,
        owner: &str,
    ) -> ClientResult<ApiResponse<String>>;

    async fn update_hostname(
        &self,
        address_id: &str,
        hostname: &str,
    ) -> ClientResult<ApiResponse<Value>>;

    /// Reachability probe; a `200` status means the host answered.
    async fn ping_address(&self, address_id: &str) -> ClientResult<ApiResponse<Value>>;

    async fn delete_address(&self, address_id: &str) -> ClientResult<ApiResponse<Value>>;
}

#[derive(Debug, Clone, Deserialize)]
struct LoginData {
    token: String,
    #[serde(default)]
    expires: Option<String>,
}

/// An authenticated API session.
#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: Option<NaiveDateTime>,
}

impl Session {
    fn from_login(data: LoginData) -> Self {
        let expires_at = data
            .expires
            .as_deref()
            .and_then(|value| NaiveDateTime::parse_from_str(value, TOKEN_EXPIRY_FORMAT).ok());
        Self {
            token: data.token,
            expires_at,
        }
    }

    /// Tokens without a parsable expiry are kept; phpIPAM extends them on use.
    ///
    /// phpIPAM reports `expires` in the server's local time while this
    /// compares against UTC, so the check is approximate. A token the server
    /// rejects is renewed by [`PhpIpamClient::call`] regardless.
    fn is_fresh(&self, now: NaiveDateTime) -> bool {
        match self.expires_at {
            Some(expires_at) => now + TimeDelta::seconds(TOKEN_RENEWAL_MARGIN_SECONDS) < expires_at,
            None => true,
        }
    }
}

/// phpIPAM REST client.
///
/// Logs in lazily with the configured credentials and reuses the session
/// token until it nears expiry.
#[derive(Debug)]
pub struct PhpIpamClient {
    http: reqwest::Client,
    api: Url,
    username: String,
    password: String,
    session: Mutex<Option<Session>>,
}

impl PhpIpamClient {
    /// Builds a client for `{server_url}/api/{app_id}/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server URL does not parse or the HTTP client
    /// cannot be constructed.
    pub fn new(config: &Config) -> ClientResult<Self> {
        let api = Self::api_base(config.server_url(), &config.app_id)?;
        let http = reqwest::ClientBuilder::new()
            .timeout(config.timeout())
            .build()?;

        info!("phpIPAM client configured for server {}", config.server_url());

        Ok(Self {
            http,
            api,
            username: config.username().to_string(),
            password: config.password().to_string(),
            session: Mutex::new(None),
        })
    }

    fn api_base(server_url: &str, app_id: &str) -> ClientResult<Url> {
        let mut api = Url::parse(server_url)?;
        api.path_segments_mut()
            .map_err(|_| ClientError::BaseUrl(server_url.to_string()))?
            .pop_if_empty()
            .extend(["api", app_id]);
        Ok(api)
    }

    /// Builds an endpoint URL with a trailing slash. Segments are percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.api.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::BaseUrl(self.api.to_string()))?
            .extend(segments)
            .push("");
        Ok(url)
    }

    async fn token(&self) -> ClientResult<String> {
        let mut session = self.session.lock().await;
        let now = Utc::now().naive_utc();

        if let Some(current) = session.as_ref()
            && current.is_fresh(now)
        {
            return Ok(current.token.clone());
        }

        let fresh = self.login().await?;
        let token = fresh.token.clone();
        *session = Some(fresh);
        Ok(token)
    }

    async fn login(&self) -> ClientResult<Session> {
        let url = self.endpoint(&["user"])?;
        debug!("Requesting phpIPAM token from {}", url);

        let response = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let envelope: ApiResponse<LoginData> = Self::decode(response).await?;

        if !envelope.is_success() {
            return Err(ClientError::Authentication(
                envelope
                    .message
                    .unwrap_or_else(|| format!("login returned code {}", envelope.code)),
            ));
        }

        envelope
            .data
            .map(Session::from_login)
            .ok_or_else(|| ClientError::Authentication("login returned no token".to_string()))
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> ClientResult<ApiResponse<T>> {
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|source| ClientError::Decode { status, source })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> ClientResult<ApiResponse<T>> {
        let url = self.endpoint(segments)?;
        let envelope = self.send(&method, &url, body.as_ref()).await?;
        if !matches!(envelope.code, CODE_UNAUTHORIZED | CODE_FORBIDDEN) {
            return Ok(envelope);
        }

        info!(
            "phpIPAM refused the session token (code {}), logging in again",
            envelope.code
        );
        self.session.lock().await.take();
        self.send(&method, &url, body.as_ref()).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
    ) -> ClientResult<ApiResponse<T>> {
        let token = self.token().await?;

        debug!("{} {}", method, url);
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header("token", token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let envelope: ApiResponse<T> = Self::decode(request.send().await?).await?;
        debug!("phpIPAM answered code {}", envelope.code);
        Ok(envelope)
    }
}

#[async_trait]
impl IpamApi for PhpIpamClient {
    async fn list_sections(&self) -> ClientResult<ApiResponse<Vec<Section>>> {
        self.call(Method::GET, &["sections"], None).await
    }

    async fn list_section_subnets(
        &self,
        section_id: &str,
    ) -> ClientResult<ApiResponse<Vec<Subnet>>> {
        self.call(Method::GET, &["sections", section_id, "subnets"], None)
            .await
    }

    async fn search_hostname(&self, hostname: &str) -> ClientResult<ApiResponse<Vec<Address>>> {
        self.call(
            Method::GET,
            &["addresses", "search_hostname", hostname],
            None,
        )
        .await
    }

    async fn search_ip(&self, ip: &str) -> ClientResult<ApiResponse<Vec<Address>>> {
        self.call(Method::GET, &["addresses", "search", ip], None)
            .await
    }

    async fn get_address(&self, address_id: &str) -> ClientResult<ApiResponse<Address>> {
        self.call(Method::GET, &["addresses", address_id], None)
            .await
    }

    async fn get_subnet(&self, subnet_id: &str) -> ClientResult<ApiResponse<Subnet>> {
        self.call(Method::GET, &["subnets", subnet_id], None).await
    }

    async fn get_section(&self, section_id: &str) -> ClientResult<ApiResponse<Section>> {
        self.call(Method::GET, &["sections", section_id], None)
            .await
    }

    async fn create_first_free(
        &self,
        subnet_id: &str,
        hostname: &str,
        owner: &str,
    ) -> ClientResult<ApiResponse<String>> {
        self.call(
            Method::POST,
            &["addresses", "first_free", subnet_id],
            Some(json!({ "hostname": hostname, "owner": owner })),
        )
        .await
    }

    async fn update_hostname(
        &self,
        address_id: &str,
        hostname: &str,
    ) -> ClientResult<ApiResponse<Value>> {
        self.call(
            Method::PATCH,
            &["addresses", address_id],
            Some(json!({ "hostname": hostname })),
        )
        .await
    }

    async fn ping_address(&self, address_id: &str) -> ClientResult<ApiResponse<Value>> {
        self.call(Method::GET, &["addresses", address_id, "ping"], None)
            .await
    }

    async fn delete_address(&self, address_id: &str) -> ClientResult<ApiResponse<Value>> {
        self.call(Method::DELETE, &["addresses", address_id], None)
            .await
    }
}
