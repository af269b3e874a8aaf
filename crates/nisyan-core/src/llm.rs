use crate::config::LlmConfig;
use crate::error::{NisyanError, Result};

/// Short-completion LLM client backing the importance/stability classifier.
/// Requests are tiny (a summary plus the scoring prompt) and responses are
/// expected to be a handful of tokens, so generation is pinned to
/// temperature 0 with a small token cap.
pub struct LlmClient {
    provider: Provider,
    config: LlmConfig,
    http: reqwest::Client,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.provider)
            .field("model", &self.config.model)
            .finish()
    }
}

#[derive(Debug)]
enum Provider {
    Ollama,
    OpenAi,
    Anthropic,
}

impl LlmClient {
    /// Create a client from configuration. Providers that need an API key
    /// fail here, at construction, rather than on the first request.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let provider = match config.provider.as_str() {
            "ollama" => Provider::Ollama,
            "openai" => Provider::OpenAi,
            "anthropic" | "claude" => Provider::Anthropic,
            other => {
                return Err(NisyanError::Config(format!(
                    "unknown LLM provider: '{other}' (expected 'ollama', 'openai', or 'anthropic')"
                )));
            }
        };

        match &provider {
            Provider::OpenAi => {
                resolve_api_key(config, "OPENAI_API_KEY")?;
            }
            Provider::Anthropic => {
                resolve_api_key(config, "ANTHROPIC_API_KEY")?;
            }
            Provider::Ollama => {}
        }

        Ok(Self {
            provider,
            config: config.clone(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .map_err(|e| NisyanError::Config(format!("failed to build HTTP client: {e}")))?,
        })
    }

    /// Run one completion: system message plus user prompt, returns the
    /// raw response text.
    pub async fn complete(&self, prompt: &str, system: &str) -> Result<String> {
        match &self.provider {
            Provider::Ollama => self.complete_ollama(prompt, system).await,
            Provider::OpenAi => self.complete_openai(prompt, system).await,
            Provider::Anthropic => self.complete_anthropic(prompt, system).await,
        }
    }

    /// Ollama: POST {base_url}/api/generate
    async fn complete_ollama(&self, prompt: &str, system: &str) -> Result<String> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("http://localhost:11434");
        let url = format!("{}/api/generate", base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.config.model,
            "prompt": prompt,
            "system": system,
            "stream": false,
            "options": {
                "num_predict": self.config.max_tokens,
                "temperature": 0.0,
            }
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NisyanError::Classification(format!("Ollama request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(NisyanError::Upstream {
                service: "Ollama",
                status,
                message,
            });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| NisyanError::Classification(format!("Ollama response parse error: {e}")))?;

        json["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                NisyanError::Classification("Ollama response missing 'response' field".into())
            })
    }

    /// OpenAI: POST {base_url}/v1/chat/completions
    async fn complete_openai(&self, prompt: &str, system: &str) -> Result<String> {
        let api_key = resolve_api_key(&self.config, "OPENAI_API_KEY")?;
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com");
        let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.config.max_tokens,
            "temperature": 0.0,
        });

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NisyanError::Classification(format!("OpenAI request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(NisyanError::Upstream {
                service: "OpenAI",
                status,
                message,
            });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| NisyanError::Classification(format!("OpenAI response parse error: {e}")))?;

        json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| NisyanError::Classification("OpenAI response missing content".into()))
    }

    /// Anthropic: POST {base_url}/v1/messages
    async fn complete_anthropic(&self, prompt: &str, system: &str) -> Result<String> {
        let api_key = resolve_api_key(&self.config, "ANTHROPIC_API_KEY")?;
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com");
        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.0,
        });

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NisyanError::Classification(format!("Anthropic request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(NisyanError::Upstream {
                service: "Anthropic",
                status,
                message,
            });
        }

        let json: serde_json::Value = resp.json().await.map_err(|e| {
            NisyanError::Classification(format!("Anthropic response parse error: {e}"))
        })?;

        // Anthropic response: {"content": [{"type": "text", "text": "..."}]}
        json["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                NisyanError::Classification("Anthropic response missing text content".into())
            })
    }
}

/// Resolve an API key from config, a custom env var, or a default env var.
fn resolve_api_key(config: &LlmConfig, default_env_var: &str) -> Result<String> {
    if let Some(ref key) = config.api_key {
        if !key.is_empty() {
            return Ok(key.clone());
        }
    }

    let env_var_name = config.env_var.as_deref().unwrap_or(default_env_var);

    std::env::var(env_var_name).map_err(|_| {
        NisyanError::Config(format!(
            "{} LLM provider requires an API key (set llm.api_key or {})",
            config.provider, env_var_name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_ollama() {
        let config = LlmConfig {
            enabled: true,
            provider: "ollama".into(),
            model: "llama3.2".into(),
            ..Default::default()
        };
        assert!(LlmClient::from_config(&config).is_ok());
    }

    #[test]
    fn test_from_config_unknown_provider() {
        let config = LlmConfig {
            provider: "banana".into(),
            ..Default::default()
        };
        let result = LlmClient::from_config(&config);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("unknown LLM provider"));
    }

    #[test]
    fn test_from_config_openai_with_key() {
        let config = LlmConfig {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key: Some("sk-test".into()),
            ..Default::default()
        };
        assert!(LlmClient::from_config(&config).is_ok());
    }

    #[test]
    fn test_from_config_anthropic_claude_alias() {
        let config = LlmConfig {
            provider: "claude".into(),
            model: "claude-sonnet-4-5-20250929".into(),
            api_key: Some("sk-ant-test".into()),
            ..Default::default()
        };
        assert!(LlmClient::from_config(&config).is_ok());
    }

    #[test]
    fn test_resolve_api_key_from_config() {
        let config = LlmConfig {
            provider: "openai".into(),
            api_key: Some("config-key".into()),
            ..Default::default()
        };
        let key = resolve_api_key(&config, "OPENAI_API_KEY").unwrap();
        assert_eq!(key, "config-key");
    }

    #[test]
    fn test_resolve_api_key_custom_env_var() {
        std::env::set_var("NISYAN_TEST_LLM_KEY", "env-llm-key");
        let config = LlmConfig {
            provider: "openai".into(),
            api_key: None,
            env_var: Some("NISYAN_TEST_LLM_KEY".into()),
            ..Default::default()
        };
        let key = resolve_api_key(&config, "OPENAI_API_KEY").unwrap();
        assert_eq!(key, "env-llm-key");
        std::env::remove_var("NISYAN_TEST_LLM_KEY");
    }

    #[test]
    fn test_resolve_api_key_missing_errors() {
        let config = LlmConfig {
            provider: "openai".into(),
            api_key: None,
            env_var: Some("NISYAN_TEST_MISSING_KEY".into()),
            ..Default::default()
        };
        let result = resolve_api_key(&config, "OPENAI_API_KEY");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key"));
    }
}
