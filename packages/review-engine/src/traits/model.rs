//! Language model trait.
//!
//! The engine treats the model as a black box that turns a prompt plus a
//! JSON schema into raw text. Schema validation happens in the engine (see
//! `pipeline::parse`), so a malformed answer is an ordinary outcome rather
//! than a transport error.

use async_trait::async_trait;
use schemars::JsonSchema;
use std::sync::Arc;

use crate::error::Result;

/// A structured-output completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,

    /// Name of the expected output type (e.g. `structured_verdict`).
    pub schema_name: String,

    /// JSON schema the output must satisfy.
    pub schema: serde_json::Value,
}

impl CompletionRequest {
    /// Build a request whose schema is generated from `T`.
    pub fn for_type<T: JsonSchema>(
        schema_name: impl Into<String>,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
        Self {
            system: system.into(),
            prompt: prompt.into(),
            schema_name: schema_name.into(),
            schema,
        }
    }
}

/// Language model trait.
///
/// Implementations wrap specific providers (OpenAI, Anthropic, etc.).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one completion and return the raw output text.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

#[async_trait]
impl<M: LanguageModel + ?Sized> LanguageModel for Arc<M> {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        (**self).complete(request).await
    }
}
