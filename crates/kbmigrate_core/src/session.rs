use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::config::{DestinationSettings, Environment};
use crate::retry::Reauthenticate;

const NATIVE_CLIENT_REDIRECT_URI: &str =
    "https://login.microsoftonline.com/common/oauth2/nativeclient";

/// Source of bearer tokens for the destination system.
pub trait TokenProvider {
    fn acquire(&mut self) -> Result<String>;
}

/// OAuth2 refresh-token exchange; falls back to client credentials when no
/// refresh token was supplied. Rotated refresh tokens are kept for the next call.
pub struct OAuthTokenProvider {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    refresh_token: Option<String>,
}

impl OAuthTokenProvider {
    pub fn new(settings: &DestinationSettings, environment: &Environment) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("failed to build token HTTP client")?;
        Ok(Self {
            client,
            token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                settings.tenant_id
            ),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            scope: environment.scope.clone(),
            refresh_token: environment.refresh_token.clone(),
        })
    }
}

impl TokenProvider for OAuthTokenProvider {
    fn acquire(&mut self) -> Result<String> {
        let mut form = vec![
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.clone()),
            ("scope", self.scope.clone()),
        ];
        match &self.refresh_token {
            Some(token) => {
                form.push(("grant_type", "refresh_token".to_string()));
                form.push(("refresh_token", token.clone()));
                form.push(("redirect_uri", NATIVE_CLIENT_REDIRECT_URI.to_string()));
            }
            None => form.push(("grant_type", "client_credentials".to_string())),
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .context("failed to call token endpoint")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("failed to obtain tokens: HTTP {status}: {body}");
        }
        let payload: TokenResponse = response
            .json()
            .context("failed to decode token response")?;
        if let Some(rotated) = payload.refresh_token {
            self.refresh_token = Some(rotated);
        }
        Ok(payload.access_token)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

/// Process-wide credential state, threaded explicitly into every destination call.
///
/// The token is acquired lazily and replaced in place; callers never hold on to a
/// token across a retry boundary.
pub struct Session {
    provider: Box<dyn TokenProvider>,
    token: Option<String>,
    generation: u64,
}

impl Session {
    pub fn new(provider: Box<dyn TokenProvider>) -> Self {
        Self {
            provider,
            token: None,
            generation: 0,
        }
    }

    pub fn bearer(&mut self) -> Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        self.refresh()?;
        self.token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("token provider returned no access token"))
    }

    pub fn refresh(&mut self) -> Result<()> {
        let token = self.provider.acquire()?;
        self.token = Some(token);
        self.generation += 1;
        tracing::info!("Access token refreshed (session {})", self.generation);
        Ok(())
    }

    pub fn invalidate(&mut self) {
        self.token = None;
    }

    /// Incremented on every successful refresh.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Reauthenticate for Session {
    fn reauthenticate(&mut self) -> Result<()> {
        self.refresh()
    }
}
