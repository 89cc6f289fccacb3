use anyhow::{Context, Result};
use dotenvy::dotenv;
use review_engine::security::ModelCredentials;
use review_engine::ReviewConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// CLI configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub credentials: ModelCredentials,

    /// Client-side cap on model calls. `None` leaves calls unthrottled.
    pub requests_per_second: Option<u32>,

    pub review: ReviewConfig,
}

impl CliConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;
        let model = var("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string());
        let mut credentials = ModelCredentials::new(api_key, model);
        if let Some(url) = var("OPENAI_BASE_URL") {
            credentials = credentials.with_base_url(url);
        }

        let mut review = ReviewConfig::default();
        if let Some(workers) = parsed(&var, "REVIEW_EVALUATION_WORKERS")? {
            review = review.with_evaluation_workers(workers);
        }
        if let Some(workers) = parsed(&var, "REVIEW_VERIFICATION_WORKERS")? {
            review = review.with_verification_workers(workers);
        }
        if let Some(ms) = parsed(&var, "REVIEW_DEADLINE_MS")? {
            review = review.with_default_deadline(Duration::from_millis(ms));
        }
        if let Some(ms) = parsed(&var, "REVIEW_TASK_TIMEOUT_MS")? {
            review = review.with_task_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = parsed(&var, "REVIEW_LLM_TIMEOUT_MS")? {
            review = review.with_llm_timeout(Duration::from_millis(ms));
        }
        if let Some(threshold) = parsed(&var, "REVIEW_CLASSIFICATION_THRESHOLD")? {
            review = review.with_classification_threshold(threshold);
        }
        if let Some(jurisdiction) = var("REVIEW_JURISDICTION") {
            review = review.with_jurisdiction(jurisdiction);
        }
        review.validate().context("invalid review configuration")?;

        Ok(Self {
            credentials,
            requests_per_second: parsed(&var, "OPENAI_REQUESTS_PER_SECOND")?,
            review,
        })
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("{key} must be a valid number"))
        })
        .transpose()
}
