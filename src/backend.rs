use crate::config::BackendConfig;
use crate::error::{PhoneError, Result};
use crate::token::{Credential, TokenSupplier};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use url::Url;

/// Backend-mediated call control, keyed by the CallSid of the call.
///
/// `Ok` carries the backend's optional message, `Err(PhoneError::Rejected)`
/// its error string verbatim.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn set_mute(&self, correlation_id: &str, muted: bool) -> Result<Option<String>>;
    async fn transfer(&self, correlation_id: &str, target: &str) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    identity: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct MuteForm<'a> {
    #[serde(rename = "CallSid")]
    call_sid: &'a str,
    #[serde(rename = "Mute")]
    mute: bool,
}

#[derive(Serialize)]
struct TransferForm<'a> {
    #[serde(rename = "CallSid")]
    call_sid: &'a str,
    #[serde(rename = "TargetAgent")]
    target_agent: &'a str,
}

#[derive(Debug, Deserialize)]
struct ControlResponse {
    #[serde(default)]
    success: bool,
    message: Option<String>,
    error: Option<String>,
}

/// Token endpoint and call control endpoints of the web backend.
pub struct HttpBackend {
    client: reqwest::Client,
    token_url: Url,
    mute_url: Url,
    transfer_url: Url,
    identity: String,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| PhoneError::UserInput(format!("invalid backend url {}: {}", base, e)))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| PhoneError::UserInput(format!("invalid backend path {}: {}", path, e)))
        };

        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(5000));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(crate::version::get_useragent())
            .build()?;

        Ok(Self {
            client,
            token_url: join(&config.token_path)?,
            mute_url: join(&config.mute_path)?,
            transfer_url: join(&config.transfer_path)?,
            identity: config.identity.clone(),
        })
    }

    async fn post_control<T: Serialize + ?Sized>(
        &self,
        url: &Url,
        form: &T,
    ) -> Result<Option<String>> {
        let start_time = Instant::now();
        let response = self.client.post(url.clone()).form(form).send().await?;
        let status = response.status();
        let text = response.text().await?;
        info!(
            url = %url,
            status = %status,
            elapsed = start_time.elapsed().as_millis(),
            "call control request"
        );
        match serde_json::from_str::<ControlResponse>(&text) {
            Ok(body) if body.success && status.is_success() => Ok(body.message),
            Ok(body) => Err(PhoneError::Rejected(
                body.error
                    .or(body.message)
                    .unwrap_or_else(|| format!("request failed with {}", status)),
            )),
            Err(_) => {
                warn!(url = %url, status = %status, "unexpected call control response");
                Err(PhoneError::Backend(status.to_string()))
            }
        }
    }
}

#[async_trait]
impl TokenSupplier for HttpBackend {
    async fn fetch_token(&self) -> Result<Credential> {
        let response = self
            .client
            .get(self.token_url.clone())
            .query(&[("client", self.identity.as_str())])
            .send()
            .await
            .map_err(|e| PhoneError::Token(e.to_string()))?;
        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PhoneError::Token(format!("{}: {}", status, e)))?;
        match body.token {
            Some(token) if status.is_success() => Ok(Credential::new(token, body.identity)),
            _ => Err(PhoneError::Token(
                body.error.unwrap_or_else(|| status.to_string()),
            )),
        }
    }
}

#[async_trait]
impl CallControl for HttpBackend {
    async fn set_mute(&self, correlation_id: &str, muted: bool) -> Result<Option<String>> {
        let form = MuteForm {
            call_sid: correlation_id,
            mute: muted,
        };
        self.post_control(&self.mute_url, &form).await
    }

    async fn transfer(&self, correlation_id: &str, target: &str) -> Result<Option<String>> {
        let form = TransferForm {
            call_sid: correlation_id,
            target_agent: target,
        };
        self.post_control(&self.transfer_url, &form).await
    }
}
