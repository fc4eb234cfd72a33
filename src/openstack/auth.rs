use chrono::{DateTime, Duration, Utc};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CallClass, CloudConfig, TimeoutConfig};
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::minutes(5) > self.expires_at
    }
}

#[derive(Serialize)]
struct AuthRequest {
    auth: AuthPayload,
}

#[derive(Serialize)]
struct AuthPayload {
    identity: Identity,
    scope: Scope,
}

#[derive(Serialize)]
struct Identity {
    methods: Vec<String>,
    password: PasswordAuth,
}

#[derive(Serialize)]
struct PasswordAuth {
    user: UserAuth,
}

#[derive(Serialize)]
struct UserAuth {
    name: String,
    domain: Domain,
    password: String,
}

#[derive(Serialize)]
struct Domain {
    name: String,
}

#[derive(Serialize)]
struct Scope {
    project: Project,
}

#[derive(Serialize)]
struct Project {
    name: String,
    domain: Domain,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: TokenInfo,
}

#[derive(Deserialize)]
struct TokenInfo {
    expires_at: String,
}

/// Holds the current project-scoped token for the identity service.
pub struct AuthManager {
    config: CloudConfig,
    http_client: HttpClient,
    timeouts: TimeoutConfig,
    current_token: Option<AuthToken>,
}

impl AuthManager {
    pub fn new(config: CloudConfig, http_client: HttpClient, timeouts: TimeoutConfig) -> Self {
        Self {
            config,
            http_client,
            timeouts,
            current_token: None,
        }
    }

    /// The cached token, if one exists and has not expired.
    pub fn valid_token(&self) -> Option<&AuthToken> {
        self.current_token.as_ref().filter(|token| !token.is_expired())
    }

    pub async fn refresh_token(&mut self) -> Result<AuthToken, BackendError> {
        debug!("Requesting identity token for {}", self.config.username);

        let auth_request = AuthRequest {
            auth: AuthPayload {
                identity: Identity {
                    methods: vec!["password".to_string()],
                    password: PasswordAuth {
                        user: UserAuth {
                            name: self.config.username.clone(),
                            domain: Domain {
                                name: self.config.user_domain.clone(),
                            },
                            password: self.config.password.clone(),
                        },
                    },
                },
                scope: Scope {
                    project: Project {
                        name: self.config.project_name.clone(),
                        domain: Domain {
                            name: self.config.project_domain.clone(),
                        },
                    },
                },
            },
        };

        let response = self
            .http_client
            .post(format!("{}/v3/auth/tokens", self.config.identity_url))
            .timeout(self.timeouts.for_class(CallClass::Auth))
            .json(&auth_request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::AuthError(format!(
                "identity service answered {}",
                response.status()
            )));
        }

        let token_header = response
            .headers()
            .get("X-Subject-Token")
            .ok_or_else(|| BackendError::AuthError("No token in response".to_string()))?
            .to_str()
            .map_err(|e| BackendError::AuthError(format!("Unreadable token header: {e}")))?
            .to_string();

        let auth_response: AuthResponse = response.json().await?;
        let expires_at = DateTime::parse_from_rfc3339(&auth_response.token.expires_at)
            .map_err(|e| BackendError::AuthError(format!("Bad token expiry: {e}")))?
            .with_timezone(&Utc);

        let token = AuthToken {
            token: token_header,
            expires_at,
        };
        self.current_token = Some(token.clone());

        debug!("Identity token refreshed, expires at {}", expires_at);
        Ok(token)
    }
}
