//! OpenAI 互換の chat-completions エンドポイントで役名を正規化するクライアント。

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pipeline::canonicalize::{CanonicalizeError, CanonicalizeRequest, NameCanonicalizer};
use crate::util::error::{classify_error, classify_status};

const MAX_ERROR_MESSAGE_LENGTH: usize = 500;

const SYSTEM_PROMPT: &str = "You clean up character names from TV cast lists. \
You are given several spellings of the character one actor played in a series. \
Answer with the single best canonical character name and nothing else. \
When the variants disagree on rank or title, prefer the formal title. \
Prefer the more complete variant over a bare abbreviation. \
Return one of the supplied variants verbatim unless none of them is adequate.";

/// エラーボディが巨大な場合に先頭だけ残す。
pub(crate) fn truncate_error_message(msg: &str) -> String {
    let char_count = msg.chars().count();
    if char_count <= MAX_ERROR_MESSAGE_LENGTH {
        return msg.to_string();
    }
    let truncated: String = msg.chars().take(MAX_ERROR_MESSAGE_LENGTH).collect();
    format!("{truncated}... (truncated, {char_count} chars)")
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

fn user_prompt(request: &CanonicalizeRequest) -> String {
    let mut prompt = format!(
        "Actor: {}\nSeries: {}\nVariants:\n",
        request.actor_name, request.series_id
    );
    for variant in &request.variants {
        let _ = writeln!(prompt, "- {variant}");
    }
    prompt.push_str("Canonical name:");
    prompt
}

#[derive(Debug, Clone)]
pub struct ChatCompletionsClient {
    client: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl ChatCompletionsClient {
    /// # Errors
    /// HTTP クライアントの構築に失敗した場合、またはベース URL が不正な場合。
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build chat-completions client")?;

        Ok(Self {
            client,
            base_url: parse_base_url(&base_url.into())?,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: parse_base_url(&base_url.into()).expect("valid test URL"),
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
        }
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CanonicalizeRequest) -> Result<String, CanonicalizeError> {
        let url = self
            .base_url
            .join("chat/completions")
            .map_err(|err| CanonicalizeError::Fatal(format!("invalid completions URL: {err}")))?;

        let prompt = user_prompt(request);
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: 32,
        };

        debug!(
            actor = %request.actor_name,
            series_id = %request.series_id,
            variants = request.variants.len(),
            model = %self.model,
            "sending normalization request"
        );

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("chat-completions request failed")
            .map_err(|err| CanonicalizeError::from_kind(classify_error(&err), format!("{err:#}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let truncated_body = truncate_error_message(&body);
            return Err(CanonicalizeError::from_kind(
                classify_status(status),
                format!("chat-completions endpoint returned error status {status}: {truncated_body}"),
            ));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("failed to deserialize chat-completions response")
            .map_err(|err| CanonicalizeError::InvalidResponse(format!("{err:#}")))?;

        extract_content(parsed).map_err(|err| CanonicalizeError::InvalidResponse(err.to_string()))
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    // Url::join は末尾スラッシュがないと最後のセグメントを置き換える
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).context("invalid chat-completions base URL")
}

fn extract_content(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("response contained no choices"))?
        .message
        .content
        .ok_or_else(|| anyhow!("first choice has no message content"))
}

#[async_trait]
impl NameCanonicalizer for ChatCompletionsClient {
    async fn canonicalize(
        &self,
        request: &CanonicalizeRequest,
    ) -> Result<String, CanonicalizeError> {
        self.complete(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CanonicalizeRequest {
        CanonicalizeRequest {
            actor_name: "Neil Dudgeon".to_string(),
            series_id: "tt0118401".to_string(),
            variants: vec!["Nick Barnaby".to_string(), "Nicholas Barnaby".to_string()],
        }
    }

    async fn server_with(status: u16, body: serde_json::Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn canonicalize_returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(serde_json::json!({
                "model": "test-model",
                "temperature": 0.0,
                "max_tokens": 32
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [
                    {"message": {"role": "assistant", "content": "DCI John Barnaby"}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = ChatCompletionsClient::new_for_test(server.uri());
        let answer = client
            .canonicalize(&request())
            .await
            .expect("canonicalize succeeds");

        assert_eq!(answer, "DCI John Barnaby");
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = server_with(503, serde_json::json!({"error": "overloaded"})).await;
        let client = ChatCompletionsClient::new_for_test(server.uri());

        let error = client.canonicalize(&request()).await.expect_err("should fail");

        assert!(matches!(error, CanonicalizeError::Transient(_)));
        assert!(error.to_string().contains("503"));
    }

    #[tokio::test]
    async fn auth_failures_are_fatal() {
        let server = server_with(401, serde_json::json!({"error": "bad key"})).await;
        let client = ChatCompletionsClient::new_for_test(server.uri());

        let error = client.canonicalize(&request()).await.expect_err("should fail");

        assert!(matches!(error, CanonicalizeError::Fatal(_)));
    }

    #[tokio::test]
    async fn bad_requests_are_rejected_without_retry() {
        let server = server_with(400, serde_json::json!({"error": "context too long"})).await;
        let client = ChatCompletionsClient::new_for_test(server.uri());

        let error = client.canonicalize(&request()).await.expect_err("should fail");

        assert!(matches!(error, CanonicalizeError::Rejected(_)));
    }

    #[tokio::test]
    async fn empty_choices_are_invalid_responses() {
        let server = server_with(200, serde_json::json!({"choices": []})).await;
        let client = ChatCompletionsClient::new_for_test(server.uri());

        let error = client.canonicalize(&request()).await.expect_err("should fail");

        assert!(matches!(error, CanonicalizeError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn large_error_bodies_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(2000)))
            .mount(&server)
            .await;
        let client = ChatCompletionsClient::new_for_test(server.uri());

        let error = client.canonicalize(&request()).await.expect_err("should fail");
        let message = error.to_string();

        assert!(message.contains("truncated, 2000 chars"));
        assert!(message.len() < 1000);
    }

    #[test]
    fn prompt_lists_every_variant() {
        let prompt = user_prompt(&request());
        assert!(prompt.contains("Actor: Neil Dudgeon"));
        assert!(prompt.contains("- Nick Barnaby\n- Nicholas Barnaby\n"));
    }

    #[test]
    fn base_url_without_trailing_slash_keeps_path() {
        let url = parse_base_url("https://api.example.com/v1").expect("valid url");
        assert_eq!(
            url.join("chat/completions").expect("join").as_str(),
            "https://api.example.com/v1/chat/completions"
        );
    }
}
