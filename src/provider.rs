use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::ValueEnum;
use serde::Deserialize;
use serde_json::json;

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::error::ModelError;
use crate::model::{ChatMessage, ChatModel};

/// Sampling temperature for every agent and formatter call.
pub const DETERMINISTIC_TEMPERATURE: f32 = 0.0;

/// Client for any endpoint that speaks the OpenAI chat-completions protocol.
pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl OpenAiCompatibleModel {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for model provider")?;
        Ok(Self {
            client,
            endpoint: completions_endpoint(base_url),
            api_key,
            model: model.into(),
            temperature: DETERMINISTIC_TEMPERATURE,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

pub fn completions_endpoint(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
        });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let message = if status.as_u16() == 401 || status.as_u16() == 403 {
                format!("authentication failed (HTTP {})", status.as_u16())
            } else {
                response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("<body read error: {e}>"))
            };
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed = response
            .json::<CompletionResponse>()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(ModelError::Empty)
    }
}

struct ProviderDefaults {
    base_url: String,
    api_key_env: Option<&'static str>,
    default_model: &'static str,
}

fn provider_defaults(provider: Provider) -> ProviderDefaults {
    match provider {
        Provider::Openai => ProviderDefaults {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: Some("OPENAI_API_KEY"),
            default_model: "gpt-4o-mini",
        },
        Provider::Deepseek => ProviderDefaults {
            base_url: "https://api.deepseek.com/v1".to_string(),
            api_key_env: Some("DEEPSEEK_API_KEY"),
            default_model: "deepseek-chat",
        },
        Provider::Groq => ProviderDefaults {
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: Some("GROQ_API_KEY"),
            default_model: "llama-3.3-70b-versatile",
        },
        Provider::Ollama | Provider::Auto => {
            let host = std::env::var("OLLAMA_HOST")
                .unwrap_or_else(|_| "http://localhost:11434".to_string());
            ProviderDefaults {
                base_url: format!("{}/v1", host.trim_end_matches('/')),
                api_key_env: None,
                default_model: "llama3.1",
            }
        }
    }
}

pub fn validate_model_for_provider(provider: Provider, model_name: &str) -> Result<()> {
    let is_valid = match provider {
        Provider::Openai => {
            model_name.starts_with("gpt-")
                || model_name.starts_with("o1")
                || model_name.starts_with("o3")
                || model_name.starts_with("o4")
        }
        Provider::Deepseek => model_name.starts_with("deepseek"),
        Provider::Groq | Provider::Ollama => !model_name.trim().is_empty(),
        Provider::Auto => true,
    };

    if is_valid {
        return Ok(());
    }

    Err(anyhow::anyhow!(
        "model '{}' is not compatible with provider '{:?}'",
        model_name,
        provider
    ))
}

/// Agent model plus a separate instance for format-correction calls.
pub struct ResolvedModels {
    pub provider: Provider,
    pub agent: Arc<dyn ChatModel>,
    pub formatter: Arc<dyn ChatModel>,
}

pub fn resolve_models(cfg: &RuntimeConfig) -> Result<ResolvedModels> {
    let provider = match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set one of OPENAI_API_KEY, DEEPSEEK_API_KEY, \
             GROQ_API_KEY, OLLAMA_HOST, or use --provider ollama",
        )?,
        p => p,
    };

    let defaults = provider_defaults(provider);
    let api_key = match defaults.api_key_env {
        Some(var) => Some(std::env::var(var).with_context(|| {
            format!("{var} is required for provider '{}'", provider_label(provider))
        })?),
        None => None,
    };
    let base_url = cfg.base_url.clone().unwrap_or(defaults.base_url);
    let timeout = Duration::from_secs(cfg.request_timeout_secs);

    let model_name = cfg
        .model
        .clone()
        .unwrap_or_else(|| defaults.default_model.to_string());
    validate_model_for_provider(provider, &model_name)?;
    let formatter_name = cfg
        .formatter_model
        .clone()
        .unwrap_or_else(|| model_name.clone());
    validate_model_for_provider(provider, &formatter_name)?;

    let agent = OpenAiCompatibleModel::new(&base_url, api_key.clone(), model_name, timeout)?;
    let formatter = OpenAiCompatibleModel::new(&base_url, api_key, formatter_name, timeout)?;
    Ok(ResolvedModels {
        provider,
        agent: Arc::new(agent),
        formatter: Arc::new(formatter),
    })
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("DEEPSEEK_API_KEY") {
        return Some(Provider::Deepseek);
    }
    if env_present("GROQ_API_KEY") {
        return Some(Provider::Groq);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

pub fn provider_label(provider: Provider) -> &'static str {
    match provider {
        Provider::Auto => "auto",
        Provider::Openai => "openai",
        Provider::Deepseek => "deepseek",
        Provider::Groq => "groq",
        Provider::Ollama => "ollama",
    }
}

pub fn parse_provider_name(value: &str) -> Result<Provider> {
    Provider::from_str(value, true).map_err(|_| {
        anyhow::anyhow!(
            "invalid provider '{}'. Supported values: auto, openai, deepseek, groq, ollama",
            value
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_appended_once() {
        assert_eq!(
            completions_endpoint("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            completions_endpoint("http://proxy.local/v1/chat/completions"),
            "http://proxy.local/v1/chat/completions"
        );
    }

    #[test]
    fn model_names_are_checked_per_provider() {
        assert!(validate_model_for_provider(Provider::Openai, "gpt-4o-mini").is_ok());
        assert!(validate_model_for_provider(Provider::Openai, "deepseek-chat").is_err());
        assert!(validate_model_for_provider(Provider::Deepseek, "deepseek-chat").is_ok());
        assert!(validate_model_for_provider(Provider::Ollama, " ").is_err());
    }

    #[test]
    fn provider_names_parse_case_insensitively() {
        assert_eq!(parse_provider_name("OpenAI").unwrap(), Provider::Openai);
        assert!(parse_provider_name("gemini").is_err());
    }
}
