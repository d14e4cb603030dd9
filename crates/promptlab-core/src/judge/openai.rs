//! Judge backed by an OpenAI-compatible chat completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{JudgeError, ModelJudge};
use crate::domain::VersionedDocument;

const SYSTEM_PROMPT: &str = "You are a strict reviewer of LLM prompt specifications. \
Answer exactly in the format requested.";

/// Connection settings for [`OpenAiJudge`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiJudgeConfig {
    /// Base URL up to and including the API version, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    /// Bearer token. Never serialised.
    #[serde(skip)]
    pub api_key: Option<String>,
    pub temperature: f32,
    pub request_timeout_ms: u64,
}

impl Default for OpenAiJudgeConfig {
    fn default() -> Self {
        OpenAiJudgeConfig {
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            temperature: 0.0,
            request_timeout_ms: 60_000,
        }
    }
}

impl OpenAiJudgeConfig {
    pub fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiJudge {
    config: OpenAiJudgeConfig,
    http_client: reqwest::Client,
}

impl OpenAiJudge {
    pub fn new(config: OpenAiJudgeConfig) -> Result<Self, JudgeError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("promptlab/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| JudgeError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(OpenAiJudge {
            config,
            http_client,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ModelJudge for OpenAiJudge {
    async fn judge(
        &self,
        instruction: &str,
        context: &VersionedDocument,
    ) -> Result<String, JudgeError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| JudgeError::Unavailable("OPENAI_API_KEY is not set".to_string()))?;
        let body = context
            .render_yaml()
            .map_err(|e| JudgeError::Unavailable(format!("cannot render document: {e}")))?;
        let user = format!("{instruction}\n\n--- PROMPT ({}) ---\n{body}", context.file_name());

        let request = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
        };

        debug!(model = %self.config.model, document = %context.file_name(), "calling judge");
        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.config.request_timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            return Err(JudgeError::Unavailable(format!(
                "judge endpoint returned HTTP {status}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, self.config.request_timeout_ms))?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

fn map_transport_error(err: reqwest::Error, timeout_ms: u64) -> JudgeError {
    if err.is_timeout() {
        JudgeError::Timeout(timeout_ms)
    } else {
        JudgeError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Category, Stage, DEFAULT_VERSION};

    #[tokio::test]
    async fn test_missing_api_key_is_unavailable() {
        let config = OpenAiJudgeConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            model: "test".to_string(),
            api_key: None,
            temperature: 0.0,
            request_timeout_ms: 100,
        };
        let judge = OpenAiJudge::new(config).expect("client");
        let doc = VersionedDocument::from_yaml(
            "t",
            Category::Raw,
            Stage::Raw,
            DEFAULT_VERSION,
            "role: r\n",
        )
        .expect("doc");
        let err = judge.judge("q", &doc).await.expect_err("no key");
        assert!(matches!(err, JudgeError::Unavailable(_)));
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let config = OpenAiJudgeConfig {
            base_url: "http://localhost:8080/v1/".to_string(),
            ..OpenAiJudgeConfig::default()
        };
        let judge = OpenAiJudge::new(config).expect("client");
        assert_eq!(judge.endpoint(), "http://localhost:8080/v1/chat/completions");
    }

    #[test]
    fn test_api_key_not_serialized() {
        let config = OpenAiJudgeConfig::default().with_api_key("sk-secret");
        let json = serde_json::to_string(&config).expect("serialize");
        assert!(!json.contains("sk-secret"));
    }
}
