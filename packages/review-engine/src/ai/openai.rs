//! OpenAI implementation of [`LanguageModel`].
//!
//! # Example
//!
//! ```rust,ignore
//! use review_engine::ai::OpenAiModel;
//! use review_engine::security::ModelCredentials;
//!
//! let model = OpenAiModel::new(ModelCredentials::new("sk-...", "gpt-4o"))?;
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ReviewError};
use crate::security::ModelCredentials;
use crate::traits::model::{CompletionRequest, LanguageModel};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat completions with `json_schema` structured output.
#[derive(Clone)]
pub struct OpenAiModel {
    client: Client,
    credentials: ModelCredentials,
    base_url: String,
    temperature: f32,
}

impl OpenAiModel {
    pub fn new(credentials: ModelCredentials) -> Result<Self> {
        credentials.validate()?;
        let base_url = credentials
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            client: Client::new(),
            credentials,
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature: 0.0,
        })
    }

    /// Create from `OPENAI_API_KEY` and `OPENAI_MODEL` (default: gpt-4o).
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ReviewError::Config("OPENAI_API_KEY not set".into()))?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        Self::new(ModelCredentials::new(api_key, model))
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn model(&self) -> &str {
        &self.credentials.model
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat<'a>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a str,
    schema: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiModel {
    fn chat_request<'a>(&'a self, request: &'a CompletionRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.credentials.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: self.temperature,
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: &request.schema_name,
                    schema: &request.schema,
                },
            },
        }
    }
}

fn first_content(chat: ChatResponse) -> Result<String> {
    chat.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ReviewError::Model("No response from OpenAI".into()))
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = self.chat_request(request);

        debug!(model = %self.credentials.model, schema = %request.schema_name, "chat completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.credentials.api_key.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| ReviewError::Model(e.into()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ReviewError::Model(
                format!("OpenAI error {}: {}", status, error_text).into(),
            ));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::Model(e.into()))?;
        first_content(chat)
    }
}
