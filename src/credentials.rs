use anyhow::{bail, Result};
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

pub const TOKEN_ENDPOINT: &str = "https://id.twitch.tv/oauth2/token";

/// One access/refresh token pair as persisted per role.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub scope: Vec<String>,
    /// Epoch seconds after which the access token is no longer trusted.
    /// Zero means "already expired, refresh before first use".
    pub expires_at: i64,
    pub obtained_at: i64,
}

impl Credentials {
    /// Builds a record from the configuration seed tokens. The zero expiry
    /// forces a refresh the first time the pair is handed to the provider.
    pub fn seeded(access_token: &str, refresh_token: &str) -> Self {
        Credentials {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            scope: Vec::new(),
            expires_at: 0,
            obtained_at: Utc::now().timestamp(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() >= self.expires_at
    }
}

/// What the provider reports after rotating a token pair. Tokens are optional
/// because a broken refresh response can genuinely lack them; the supervisor
/// decides what to do with partial data.
#[derive(Clone, Debug, Deserialize)]
pub struct RefreshPayload {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub expires_in: i64,
}

impl RefreshPayload {
    /// `None` when either token is absent; such a payload must never be
    /// written over a good record.
    pub fn into_credentials(self) -> Option<Credentials> {
        let access_token = self.access_token?;
        let refresh_token = self.refresh_token?;
        let now = Utc::now().timestamp();
        Some(Credentials {
            access_token,
            refresh_token,
            scope: self.scope,
            expires_at: now + self.expires_in,
            obtained_at: now,
        })
    }
}

/// Thin client for the Twitch OAuth token endpoint (refresh grant only).
#[derive(Clone)]
pub struct TokenClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    endpoint: String,
}

impl TokenClient {
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        TokenClient {
            client: reqwest::Client::new(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            endpoint: TOKEN_ENDPOINT.to_string(),
        }
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshPayload> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&params)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        if status != 200 {
            bail!("token refresh rejected with status {status}: {body}");
        }

        tracing::debug!("token pair refreshed");
        Ok(serde_json::from_str(&body)?)
    }
}
