//! Clients for the backing web service: server registration and the
//! online-id token exchange. Kept apart from the controllers so the
//! lobby never blocks on HTTP.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::config::{ServerConfig, USER_AGENT, VERSION};

/// Attempts before a first-run registration failure becomes fatal.
const REGISTER_ATTEMPTS: u32 = 5;
const RETRY_DELAY_SECS: u64 = 3;

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    success: bool,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    valid: bool,
    #[serde(default)]
    username: String,
}

/// Talks to the registration endpoint configured in `register_url`.
pub struct RegistrationClient {
    http: reqwest::Client,
    base_url: String,
}

impl RegistrationClient {
    pub fn new(config: &ServerConfig) -> Result<RegistrationClient> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build the HTTP client")?;
        Ok(RegistrationClient {
            http,
            base_url: config.register_url.trim_end_matches('/').to_string(),
        })
    }

    /// Registers this server's public address; retried a few times, and
    /// a permanent failure on first run is fatal (exit code 1).
    pub async fn register(&self, config: &ServerConfig) -> Result<()> {
        let payload = json!({
            "address": config.public_address,
            "name": config.server_name,
            "uid": config.server_uid,
            "max_players": config.max_players,
            "password_protected": !config.password.is_empty(),
            "version": VERSION.to_string(),
        });

        let mut last_error = None;
        for attempt in 1..=REGISTER_ATTEMPTS {
            match self.try_register(&payload).await {
                Ok(()) => {
                    log::info!("registered at {}", self.base_url);
                    return Ok(());
                }
                Err(error) => {
                    log::warn!(
                        "registration attempt {}/{} failed: {}",
                        attempt,
                        REGISTER_ATTEMPTS,
                        error
                    );
                    last_error = Some(error);
                    tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS)).await;
                }
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }

    async fn try_register(&self, payload: &serde_json::Value) -> Result<()> {
        let response: RegisterResponse = self
            .http
            .post(format!("{}/server/register", self.base_url))
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !response.success {
            bail!("endpoint refused registration: {}", response.info);
        }
        Ok(())
    }

    /// Verifies a client-presented online-id token; returns the
    /// confirmed username.
    pub async fn verify_token(&self, online_id: u32, token: &str) -> Result<Option<String>> {
        let response: TokenResponse = self
            .http
            .post(format!("{}/session/validate", self.base_url))
            .json(&json!({ "online_id": online_id, "token": token }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(if response.valid {
            Some(response.username)
        } else {
            None
        })
    }

    /// Unregisters on clean shutdown; best effort.
    pub async fn unregister(&self, config: &ServerConfig) {
        let result = self
            .http
            .post(format!("{}/server/unregister", self.base_url))
            .json(&json!({ "uid": config.server_uid }))
            .send()
            .await;
        if let Err(error) = result {
            log::warn!("failed to unregister: {}", error);
        }
    }
}
