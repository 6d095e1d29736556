//! HTTP backend speaking the OpenAI-compatible and Anthropic chat APIs

use super::{
    ApiFormat, Message, ModelBackend, ProviderError, ProviderReply, ProviderRequest, Role,
    TokenUsage,
};
use crate::catalog::Model;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Connection details for one HTTP provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    /// Provider name, matching `Model::provider` in the catalog
    pub name: String,
    pub format: ApiFormat,
    pub base_url: String,
    /// API key (can also come from the environment, see `Config::with_env_overrides`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Generic HTTP backend that can serve any provider with a known wire format
pub struct HttpBackend {
    endpoint: ProviderEndpoint,
    client: Client,
}

impl HttpBackend {
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }

    fn api_key(&self) -> &str {
        self.endpoint.api_key.as_deref().unwrap_or_default()
    }

    fn build_anthropic_request(&self, model: &Model, request: &ProviderRequest) -> Value {
        let mut system = Vec::new();
        let mut messages = Vec::new();

        for msg in request.payload.to_messages() {
            match msg.role {
                Role::System => system.push(msg.content),
                Role::User | Role::Assistant => messages.push(json!({
                    "role": msg.role.as_str(),
                    "content": msg.content
                })),
            }
        }

        let mut body = json!({
            "model": model.id,
            "messages": messages,
            "max_tokens": request.max_output_tokens,
        });

        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }

        if let Some(temp) = self.endpoint.temperature {
            body["temperature"] = json!(temp);
        }

        body
    }

    fn build_openai_request(&self, model: &Model, request: &ProviderRequest) -> Value {
        let messages: Vec<Value> = request
            .payload
            .to_messages()
            .iter()
            .map(|m: &Message| {
                json!({
                    "role": m.role.as_str(),
                    "content": m.content
                })
            })
            .collect();

        let mut body = json!({
            "model": model.id,
            "messages": messages,
            "max_tokens": request.max_output_tokens,
        });

        if let Some(temp) = self.endpoint.temperature {
            body["temperature"] = json!(temp);
        }

        body
    }

    fn parse_anthropic_response(&self, response: Value) -> Result<ProviderReply, ProviderError> {
        let content = response["content"][0]["text"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("missing content[0].text".into()))?
            .to_string();

        let usage = TokenUsage::new(
            token_count(&response["usage"]["input_tokens"]),
            token_count(&response["usage"]["output_tokens"]),
        );

        Ok(ProviderReply {
            content,
            usage: Some(usage),
            model: response["model"].as_str().unwrap_or("").to_string(),
            truncated: response["stop_reason"].as_str() == Some("max_tokens"),
        })
    }

    fn parse_openai_response(&self, response: Value) -> Result<ProviderReply, ProviderError> {
        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message.content".into()))?
            .to_string();

        let usage = response.get("usage").map(|u| {
            TokenUsage::new(
                token_count(&u["prompt_tokens"]),
                token_count(&u["completion_tokens"]),
            )
        });

        Ok(ProviderReply {
            content,
            usage,
            model: response["model"].as_str().unwrap_or("").to_string(),
            truncated: response["choices"][0]["finish_reason"].as_str() == Some("length"),
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.endpoint.format {
            ApiFormat::Anthropic => builder
                .header("x-api-key", self.api_key())
                .header("anthropic-version", "2023-06-01"),
            ApiFormat::OpenAI => {
                builder.header("Authorization", format!("Bearer {}", self.api_key()))
            }
        }
    }
}

/// Token count from a usage field; missing means zero, oversized saturates
fn token_count(value: &Value) -> u32 {
    value.as_u64().map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn invoke(
        &self,
        model: &Model,
        request: &ProviderRequest,
    ) -> Result<ProviderReply, ProviderError> {
        let base = self.endpoint.base_url.trim_end_matches('/');
        let (url, body) = match self.endpoint.format {
            ApiFormat::Anthropic => (
                format!("{}/messages", base),
                self.build_anthropic_request(model, request),
            ),
            ApiFormat::OpenAI => (
                format!("{}/chat/completions", base),
                self.build_openai_request(model, request),
            ),
        };

        let response = self
            .authorize(self.client.post(&url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status().is_success() {
            let json: Value = response.json().await?;
            match self.endpoint.format {
                ApiFormat::Anthropic => self.parse_anthropic_response(json),
                ApiFormat::OpenAI => self.parse_openai_response(json),
            }
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(ProviderError::Status { status, body })
        }
    }

    async fn health_check(&self, _model: &Model) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.endpoint.base_url.trim_end_matches('/'));
        let response = self.authorize(self.client.get(&url)).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProviderError::Status {
                status: response.status().as_u16(),
                body: String::new(),
            })
        }
    }

    fn provider(&self) -> &str {
        &self.endpoint.name
    }
}
