//! Rate-limited language model wrapper.
//!
//! Wraps any [`LanguageModel`] with a `governor` quota so a burst of
//! evaluation tasks stays within the provider's requests-per-second limit.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::error::{Result, ReviewError};
use crate::traits::model::{CompletionRequest, LanguageModel};

type DefaultRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// A language model wrapper that enforces a request rate.
///
/// Waiting for a permit counts against the caller's call timeout, so a
/// saturated quota shows up as timeouts rather than unbounded queueing.
pub struct RateLimitedModel<M: LanguageModel> {
    inner: M,
    limiter: Arc<DefaultRateLimiter>,
}

impl<M: LanguageModel> RateLimitedModel<M> {
    /// Create a new rate-limited model.
    ///
    /// # Arguments
    /// * `model` - The underlying model to wrap
    /// * `requests_per_second` - Maximum requests per second
    pub fn new(model: M, requests_per_second: u32) -> Result<Self> {
        let rps = non_zero(requests_per_second, "requests_per_second")?;
        Ok(Self::with_quota(model, Quota::per_second(rps)))
    }

    /// Create with a custom quota.
    pub fn with_quota(model: M, quota: Quota) -> Self {
        Self {
            inner: model,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Create with burst support.
    pub fn with_burst(model: M, requests_per_second: u32, burst: u32) -> Result<Self> {
        let quota = Quota::per_second(non_zero(requests_per_second, "requests_per_second")?)
            .allow_burst(non_zero(burst, "burst")?);
        Ok(Self::with_quota(model, quota))
    }

    /// The wrapped model.
    pub fn inner(&self) -> &M {
        &self.inner
    }
}

fn non_zero(value: u32, name: &str) -> Result<NonZeroU32> {
    NonZeroU32::new(value).ok_or_else(|| ReviewError::Config(format!("{name} must be > 0")))
}

#[async_trait]
impl<M: LanguageModel> LanguageModel for RateLimitedModel<M> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.limiter.until_ready().await;
        self.inner.complete(request).await
    }
}

/// Builder for [`RateLimitedModel`].
pub struct RateLimitedModelBuilder<M: LanguageModel> {
    model: M,
    requests_per_second: u32,
    burst: Option<u32>,
}

impl<M: LanguageModel> RateLimitedModelBuilder<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            requests_per_second: 1,
            burst: None,
        }
    }

    /// Set requests per second.
    pub fn requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = rps;
        self
    }

    /// Set burst size.
    pub fn burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn build(self) -> Result<RateLimitedModel<M>> {
        match self.burst {
            Some(burst) => RateLimitedModel::with_burst(self.model, self.requests_per_second, burst),
            None => RateLimitedModel::new(self.model, self.requests_per_second),
        }
    }
}
