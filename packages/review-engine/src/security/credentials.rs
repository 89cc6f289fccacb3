//! Credentials held with `secrecy` so API keys never reach logs.

use secrecy::{ExposeSecret, SecretBox};
use std::fmt;

use crate::error::{Result, ReviewError};

/// A secret string that won't be logged or displayed.
pub struct SecretString(SecretBox<str>);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretBox::new(Box::from(value.into().as_str())))
    }

    /// Expose the secret value. Only call this when building a request.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose().is_empty()
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self::new(self.expose())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Connection details for a language model provider.
#[derive(Clone, Debug)]
pub struct ModelCredentials {
    pub api_key: SecretString,
    pub model: String,

    /// API base URL. `None` uses the provider default.
    pub base_url: Option<String>,
}

impl ModelCredentials {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::new(api_key),
            model: model.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Reject obviously unusable credentials before the first call.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(ReviewError::Config("API key is empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(ReviewError::Config("model name is empty".into()));
        }
        Ok(())
    }
}
