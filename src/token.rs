use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Access token handed to the signaling service. Its expiry is announced
/// by the signaling layer, not tracked here.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub identity: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            token: token.into(),
            identity,
            fetched_at: Utc::now(),
        }
    }
}

// the token itself never reaches the logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &format_args!("<{} bytes>", self.token.len()))
            .field("identity", &self.identity)
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    async fn fetch_token(&self) -> Result<Credential>;
}
