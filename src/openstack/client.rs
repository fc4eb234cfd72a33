use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as HttpClient, Method, Response};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::auth::AuthManager;
use super::services::{NeutronService, NovaService};
use crate::config::{CallClass, CloudConfig, TimeoutConfig};
use crate::error::BackendError;

/// Authenticated HTTP transport shared by the service clients.
#[derive(Clone)]
pub struct Transport {
    http_client: HttpClient,
    auth_manager: Arc<RwLock<AuthManager>>,
    timeouts: TimeoutConfig,
}

impl Transport {
    pub async fn auth_token(&self) -> Result<String, BackendError> {
        if let Some(token) = self.auth_manager.read().await.valid_token() {
            return Ok(token.token.clone());
        }
        let token = self.auth_manager.write().await.refresh_token().await?;
        Ok(token.token)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        class: CallClass,
        api_version: Option<&'static str>,
    ) -> Result<Response, BackendError> {
        let token = self.auth_token().await?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "X-Auth-Token",
            HeaderValue::from_str(&token)
                .map_err(|e| BackendError::AuthError(format!("Unusable token: {e}")))?,
        );
        if let Some(version) = api_version {
            headers.insert("X-OpenStack-Nova-API-Version", HeaderValue::from_static(version));
        }

        debug!("{} {}", method, url);
        let mut request = self
            .http_client
            .request(method, url)
            .headers(headers)
            .timeout(self.timeouts.for_class(class));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BackendError::ApiError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }

    pub async fn make_authenticated_request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        class: CallClass,
        api_version: Option<&'static str>,
    ) -> Result<T, BackendError> {
        let response = self.send(method, url, body, class, api_version).await?;
        Ok(response.json::<T>().await?)
    }

    /// Sends a request whose success is signalled by the status code alone.
    pub async fn make_authenticated_call(
        &self,
        method: Method,
        url: &str,
        class: CallClass,
        api_version: Option<&'static str>,
    ) -> Result<u16, BackendError> {
        let response = self.send(method, url, None, class, api_version).await?;
        Ok(response.status().as_u16())
    }
}

#[derive(Clone)]
pub struct Client {
    transport: Transport,
    pub nova: NovaService,
    pub neutron: NeutronService,
}

impl Client {
    pub fn new(config: &CloudConfig, timeouts: &TimeoutConfig) -> Result<Self, BackendError> {
        let http_client = HttpClient::builder()
            .connect_timeout(timeouts.connect())
            .build()?;

        let auth_manager = Arc::new(RwLock::new(AuthManager::new(
            config.clone(),
            http_client.clone(),
            timeouts.clone(),
        )));
        let transport = Transport {
            http_client,
            auth_manager,
            timeouts: timeouts.clone(),
        };

        let nova = NovaService::new(transport.clone(), config.compute_url.clone());
        let neutron = NeutronService::new(transport.clone(), config.network_url.clone());

        info!("Cloud client initialized for {}", config.compute_url);

        Ok(Self {
            transport,
            nova,
            neutron,
        })
    }

    /// Fetches a fresh token, replacing any cached one.
    pub async fn authenticate(&self) -> Result<(), BackendError> {
        self.transport
            .auth_manager
            .write()
            .await
            .refresh_token()
            .await?;
        Ok(())
    }
}
