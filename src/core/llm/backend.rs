use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{ChatMessage, Completion, ModelClient};
use crate::core::budget::Tier;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// How the daemon reaches a model. One variant per supported backend.
#[derive(Debug, Clone)]
pub enum ModelBackend {
    /// Hosted Anthropic API with an `x-api-key`.
    ApiKey { api_key: String, base_url: String },
    /// Subscription OAuth bearer token against the Anthropic API.
    OAuth { token: String, base_url: String },
    /// OpenAI-compatible local server (llama.cpp, ollama, vLLM...).
    Local {
        base_url: String,
        api_key: Option<String>,
    },
}

impl ModelBackend {
    pub fn provider(&self) -> &'static str {
        match self {
            ModelBackend::ApiKey { .. } | ModelBackend::OAuth { .. } => "anthropic",
            ModelBackend::Local { .. } => "local",
        }
    }
}

// ── Anthropic messages API ──

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<AnthropicBlock>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

// ── OpenAI-compatible chat completions ──

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessageOwned,
}

#[derive(Deserialize)]
struct OpenAiMessageOwned {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// HTTP client for a configured backend. The model id is chosen per tier.
pub struct BackendClient {
    backend: ModelBackend,
    default_model: String,
    tier_models: HashMap<Tier, String>,
    max_tokens: u32,
    client: Client,
}

impl BackendClient {
    pub fn new(
        backend: ModelBackend,
        default_model: String,
        tier_models: HashMap<Tier, String>,
        max_tokens: u32,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(300)).build()?;
        Ok(Self {
            backend,
            default_model,
            tier_models,
            max_tokens,
            client,
        })
    }

    pub fn model_for(&self, tier: Tier) -> &str {
        self.tier_models
            .get(&tier)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    async fn complete_anthropic(
        &self,
        model_id: &str,
        system: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion> {
        let req = AnthropicRequest {
            model: model_id,
            max_tokens: self.max_tokens,
            system: (!system.is_empty()).then_some(system),
            messages: messages
                .iter()
                .filter(|m| m.role != "system")
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
        };

        let (base_url, request) = match &self.backend {
            ModelBackend::ApiKey { api_key, base_url } => (
                base_url,
                self.client
                    .post(format!("{}/v1/messages", base_url.trim_end_matches('/')))
                    .header("x-api-key", api_key),
            ),
            ModelBackend::OAuth { token, base_url } => (
                base_url,
                self.client
                    .post(format!("{}/v1/messages", base_url.trim_end_matches('/')))
                    .header("Authorization", format!("Bearer {}", token))
                    .header("anthropic-beta", OAUTH_BETA),
            ),
            ModelBackend::Local { .. } => {
                return Err(anyhow!("local backend does not speak the messages API"));
            }
        };

        let res = request
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(anyhow!(
                "Anthropic API error {} at {}: {}",
                status,
                base_url,
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: AnthropicResponse = res.json().await?;
        let text = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");
        Ok(Completion {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            model: parsed.model.unwrap_or_else(|| model_id.to_string()),
            provider: self.backend.provider().to_string(),
        })
    }

    async fn complete_openai(
        &self,
        model_id: &str,
        system: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion> {
        let ModelBackend::Local { base_url, api_key } = &self.backend else {
            return Err(anyhow!("hosted backends do not speak chat completions"));
        };
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            wire.push(WireMessage {
                role: "system",
                content: system,
            });
        }
        wire.extend(messages.iter().map(|m| WireMessage {
            role: &m.role,
            content: &m.content,
        }));
        let req = OpenAiRequest {
            model: model_id,
            max_tokens: self.max_tokens,
            messages: wire,
        };

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", base_url.trim_end_matches('/')))
            .json(&req);
        if let Some(key) = api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(anyhow!(
                "Local model error {} at {}: {}",
                status,
                base_url,
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: OpenAiResponse = res.json().await?;
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        Ok(Completion {
            text: parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default(),
            input_tokens,
            output_tokens,
            model: parsed.model.unwrap_or_else(|| model_id.to_string()),
            provider: self.backend.provider().to_string(),
        })
    }
}

#[async_trait]
impl ModelClient for BackendClient {
    async fn complete(
        &self,
        tier: Tier,
        system: &str,
        messages: &[ChatMessage],
    ) -> Result<Completion> {
        let model_id = self.model_for(tier).to_string();
        match self.backend {
            ModelBackend::ApiKey { .. } | ModelBackend::OAuth { .. } => {
                self.complete_anthropic(&model_id, system, messages).await
            }
            ModelBackend::Local { .. } => self.complete_openai(&model_id, system, messages).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_override_wins_over_default_model() {
        let mut tiers = HashMap::new();
        tiers.insert(Tier::Background, "claude-3-5-haiku".to_string());
        let client = BackendClient::new(
            ModelBackend::Local {
                base_url: "http://127.0.0.1:8080".to_string(),
                api_key: None,
            },
            "claude-sonnet-4".to_string(),
            tiers,
            1024,
        )
        .unwrap();
        assert_eq!(client.model_for(Tier::Background), "claude-3-5-haiku");
        assert_eq!(client.model_for(Tier::Coding), "claude-sonnet-4");
    }

    #[test]
    fn provider_names_follow_backend() {
        let hosted = ModelBackend::OAuth {
            token: "t".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
        };
        assert_eq!(hosted.provider(), "anthropic");
        let local = ModelBackend::Local {
            base_url: "http://localhost".to_string(),
            api_key: None,
        };
        assert_eq!(local.provider(), "local");
    }

    #[test]
    fn anthropic_response_joins_text_blocks() {
        let raw = r#"{"model":"claude-sonnet-4-20250514","content":[{"type":"text","text":"a"},{"type":"tool_use"},{"type":"text","text":"b"}],"usage":{"input_tokens":12,"output_tokens":3}}"#;
        let parsed: AnthropicResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect();
        assert_eq!(text, "ab");
        assert_eq!(parsed.usage.input_tokens, 12);
    }
}
