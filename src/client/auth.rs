//! Call authentication.
//!
//! Two mutually exclusive modes: a static shared-secret header, or a bearer
//! token obtained from a credential provider and cached until shortly
//! before its stated expiry. The cache is an explicit object owned by the
//! client, guarded for concurrent refresh; a redundant refresh is harmless.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::{AuthConfig, BearerConfig};
use crate::error::ConfigError;

/// Refresh this many seconds before the token's stated expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Header name for the static shared-secret mode.
pub const API_KEY_HEADER: &str = "api-key";

#[derive(Debug, Clone)]
pub struct BearerToken {
    pub token: String,
    /// Unix seconds. Tokens without an expiry are refreshed on every call.
    pub expires_on: Option<i64>,
}

impl BearerToken {
    fn is_fresh(&self, now: i64) -> bool {
        self.expires_on
            .is_some_and(|expires| expires - EXPIRY_SKEW_SECS > now)
    }
}

/// Source of bearer tokens. Implementations fetch a fresh token; caching
/// lives in [`CachedTokenSource`].
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<BearerToken>;
}

/// Fixed token, optionally with an expiry. Used for pre-issued tokens and
/// in tests.
pub struct StaticTokenSource {
    token: BearerToken,
}

impl StaticTokenSource {
    pub fn new(token: String, expires_on: Option<i64>) -> Self {
        Self {
            token: BearerToken { token, expires_on },
        }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<BearerToken> {
        Ok(self.token.clone())
    }
}

/// External credential command printing `{"token": ..., "expires_on": ...}`
/// on stdout (`access_token`/`expiresOn` accepted as aliases).
pub struct CommandTokenSource {
    command: String,
}

impl CommandTokenSource {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[derive(Deserialize)]
struct CommandTokenOutput {
    #[serde(alias = "access_token", alias = "accessToken")]
    token: String,
    #[serde(default, alias = "expiresOn", alias = "expires_at")]
    expires_on: Option<i64>,
}

#[async_trait]
impl TokenSource for CommandTokenSource {
    async fn fetch(&self) -> Result<BearerToken> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .output()
            .await
            .with_context(|| format!("credential command failed to start: {}", self.command))?;
        if !output.status.success() {
            bail!(
                "credential command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let parsed: CommandTokenOutput = serde_json::from_slice(&output.stdout)
            .context("credential command did not print token JSON")?;
        Ok(BearerToken {
            token: parsed.token,
            expires_on: parsed.expires_on,
        })
    }
}

/// Token cache in front of a [`TokenSource`]. Single-writer-wins: the mutex
/// serializes refreshes, and an extra refresh under contention is harmless.
pub struct CachedTokenSource {
    source: Box<dyn TokenSource>,
    cached: Mutex<Option<BearerToken>>,
}

impl CachedTokenSource {
    pub fn new(source: Box<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, refreshed when within the expiry skew window.
    pub async fn bearer(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.is_fresh(now)
        {
            return Ok(token.token.clone());
        }
        let fresh = self.source.fetch().await?;
        let value = fresh.token.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

/// Active authentication mode, decided once from configuration.
pub enum AuthMode {
    ApiKey(String),
    Bearer(CachedTokenSource),
}

impl AuthMode {
    /// Selects the mode from config. Selecting neither or both is a
    /// configuration error (validated again here for direct constructors).
    pub fn from_config(auth: &AuthConfig) -> Result<Self, ConfigError> {
        match (&auth.api_key, &auth.bearer) {
            (Some(key), None) => Ok(Self::ApiKey(key.clone())),
            (None, Some(bearer)) => Ok(Self::Bearer(CachedTokenSource::new(
                token_source_from_config(bearer)?,
            ))),
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "auth.api_key and auth.bearer are mutually exclusive".into(),
            )),
            (None, None) => Err(ConfigError::Missing("auth.api_key or auth.bearer".into())),
        }
    }

    /// Header `(name, value)` for one attempt. Bearer mode may refresh.
    pub async fn header(&self) -> Result<(&'static str, String)> {
        match self {
            Self::ApiKey(key) => Ok((API_KEY_HEADER, key.clone())),
            Self::Bearer(source) => {
                let token = source.bearer().await?;
                Ok(("Authorization", format!("Bearer {token}")))
            }
        }
    }
}

fn token_source_from_config(bearer: &BearerConfig) -> Result<Box<dyn TokenSource>, ConfigError> {
    if let Some(command) = &bearer.command {
        Ok(Box::new(CommandTokenSource::new(command.clone())))
    } else if let Some(token) = &bearer.token {
        Ok(Box::new(StaticTokenSource::new(
            token.clone(),
            bearer.expires_on,
        )))
    } else {
        Err(ConfigError::Invalid(
            "auth.bearer needs a token or a command".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        fetches: AtomicUsize,
        expires_on: Option<i64>,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self) -> Result<BearerToken> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(BearerToken {
                token: format!("tok-{n}"),
                expires_on: self.expires_on,
            })
        }
    }

    #[tokio::test]
    async fn fresh_token_is_cached() {
        let far_future = Utc::now().timestamp() + 3600;
        let cache = CachedTokenSource::new(Box::new(CountingSource {
            fetches: AtomicUsize::new(0),
            expires_on: Some(far_future),
        }));
        assert_eq!(cache.bearer().await.unwrap(), "tok-1");
        assert_eq!(cache.bearer().await.unwrap(), "tok-1");
    }

    #[tokio::test]
    async fn token_inside_skew_window_is_refreshed() {
        // Expires in 30s: inside the 60s skew window, so every call refreshes.
        let soon = Utc::now().timestamp() + 30;
        let cache = CachedTokenSource::new(Box::new(CountingSource {
            fetches: AtomicUsize::new(0),
            expires_on: Some(soon),
        }));
        assert_eq!(cache.bearer().await.unwrap(), "tok-1");
        assert_eq!(cache.bearer().await.unwrap(), "tok-2");
    }

    #[tokio::test]
    async fn token_without_expiry_is_refreshed_every_call() {
        let cache = CachedTokenSource::new(Box::new(CountingSource {
            fetches: AtomicUsize::new(0),
            expires_on: None,
        }));
        assert_eq!(cache.bearer().await.unwrap(), "tok-1");
        assert_eq!(cache.bearer().await.unwrap(), "tok-2");
    }

    #[tokio::test]
    async fn api_key_mode_builds_header() {
        let mode = AuthMode::ApiKey("secret".into());
        let (name, value) = mode.header().await.unwrap();
        assert_eq!(name, "api-key");
        assert_eq!(value, "secret");
    }

    #[tokio::test]
    async fn bearer_mode_builds_header() {
        let mode = AuthMode::Bearer(CachedTokenSource::new(Box::new(StaticTokenSource::new(
            "tok".into(),
            None,
        ))));
        let (name, value) = mode.header().await.unwrap();
        assert_eq!(name, "Authorization");
        assert_eq!(value, "Bearer tok");
    }

    #[test]
    fn from_config_rejects_both_and_neither() {
        let both = AuthConfig {
            api_key: Some("k".into()),
            bearer: Some(BearerConfig {
                token: Some("t".into()),
                ..BearerConfig::default()
            }),
        };
        assert!(AuthMode::from_config(&both).is_err());

        let neither = AuthConfig::default();
        assert!(AuthMode::from_config(&neither).is_err());
    }
}
