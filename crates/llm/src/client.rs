//! Streaming chat client with model fallback.
//!
//! Speaks either the OpenAI-compatible SSE protocol (`data: {...}` lines
//! carrying `choices[0].delta.content`, terminated by a `finish_reason` or a
//! `[DONE]` sentinel) or the legacy Ollama protocol (one JSON object per line
//! with `message.content` and `done`). A primary timeout or connect error
//! triggers exactly one retry on the fallback model, surfaced to consumers as
//! a [`TokenEvent::Fallback`] in the stream; callers never orchestrate
//! fallback themselves.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use lagrum_core::{GenerationConfig, LanguageModel, Message, Result, StreamStats, TokenEvent};

use crate::LlmError;

/// Wire format of the chat endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// OpenAI-compatible `/v1/chat/completions` SSE.
    #[default]
    OpenAi,
    /// Legacy Ollama `/api/chat` line protocol.
    Ollama,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String,
    pub format: WireFormat,
    pub primary_model: String,
    pub fallback_model: String,
    /// Full-request timeout for non-streaming use; streaming requests are
    /// bounded per-connection and per-idle-read instead.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            format: WireFormat::OpenAi,
            primary_model: "ministral-3:14b".to_string(),
            fallback_model: "qwen2.5:7b-instruct".to_string(),
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    temperature: f32,
    top_p: f32,
    max_tokens: usize,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    top_p: f32,
    num_predict: usize,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed line of a token stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LineEvent {
    Content(String),
    Finished,
    Ignored,
}

pub(crate) fn parse_openai_line(line: &str) -> LineEvent {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data: ") else {
        return LineEvent::Ignored;
    };
    if payload.trim() == "[DONE]" {
        return LineEvent::Finished;
    }
    let Ok(chunk) = serde_json::from_str::<OpenAiChunk>(payload) else {
        return LineEvent::Ignored;
    };
    let Some(choice) = chunk.choices.into_iter().next() else {
        return LineEvent::Ignored;
    };
    if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
        return LineEvent::Content(content);
    }
    if choice.finish_reason.is_some() {
        return LineEvent::Finished;
    }
    LineEvent::Ignored
}

pub(crate) fn parse_ollama_line(line: &str) -> LineEvent {
    let line = line.trim();
    if line.is_empty() {
        return LineEvent::Ignored;
    }
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return LineEvent::Ignored;
    };
    if value.get("done").and_then(Value::as_bool).unwrap_or(false) {
        return LineEvent::Finished;
    }
    if let Some(content) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
    {
        return LineEvent::Content(content.to_string());
    }
    LineEvent::Ignored
}

/// Streaming chat client.
pub struct LlmClient {
    client: Client,
    config: LlmClientConfig,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig) -> std::result::Result<Self, LlmError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| LlmError::Configuration(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn primary_model(&self) -> &str {
        &self.config.primary_model
    }

    pub fn fallback_model(&self) -> &str {
        &self.config.fallback_model
    }

    fn chat_endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.format {
            WireFormat::OpenAi => {
                if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                }
            }
            WireFormat::Ollama => format!("{base}/api/chat"),
        }
    }

    /// Stream a completion from one specific model, sending tokens on `tx`.
    /// `tokens_sent` counts emitted tokens so the caller can tell a
    /// first-byte failure (safe to retry) from a mid-stream one (not).
    async fn stream_model(
        &self,
        model: &str,
        messages: &[Message],
        gen: GenerationConfig,
        tx: &mpsc::Sender<TokenEvent>,
        tokens_sent: &std::sync::atomic::AtomicUsize,
    ) -> std::result::Result<StreamStats, LlmError> {
        let endpoint = self.chat_endpoint();
        tracing::info!(model, endpoint = %endpoint, "Starting LLM chat stream");

        let request = match self.config.format {
            WireFormat::OpenAi => self
                .client
                .post(&endpoint)
                .json(&OpenAiRequest {
                    model,
                    messages,
                    stream: true,
                    temperature: gen.temperature,
                    top_p: gen.top_p,
                    max_tokens: gen.max_tokens,
                })
                .timeout(self.config.timeout),
            WireFormat::Ollama => self
                .client
                .post(&endpoint)
                .json(&OllamaRequest {
                    model,
                    messages,
                    stream: true,
                    options: OllamaOptions {
                        temperature: gen.temperature,
                        top_p: gen.top_p,
                        num_predict: gen.max_tokens,
                    },
                })
                .timeout(self.config.timeout),
        };

        let response = request.send().await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(LlmError::ModelNotFound(model.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {status}: {body}")));
        }

        let start = Instant::now();
        let mut stats = StreamStats { model_used: model.to_string(), ..Default::default() };
        let mut first_token_at: Option<Instant> = None;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(LlmError::from)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].to_string();
                buffer.drain(..=newline);

                let event = match self.config.format {
                    WireFormat::OpenAi => parse_openai_line(&line),
                    WireFormat::Ollama => parse_ollama_line(&line),
                };

                match event {
                    LineEvent::Content(content) => {
                        if first_token_at.is_none() {
                            first_token_at = Some(Instant::now());
                        }
                        stats.tokens_generated += 1;
                        tokens_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        if tx.send(TokenEvent::Token(content)).await.is_err() {
                            // Caller went away: stop reading, drop the
                            // upstream connection.
                            break 'outer;
                        }
                    }
                    LineEvent::Finished => break 'outer,
                    LineEvent::Ignored => {}
                }
            }
        }

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        stats.time_to_first_token_ms =
            first_token_at.map(|t| t.duration_since(start).as_millis() as u64);

        tracing::info!(
            model,
            tokens = stats.tokens_generated,
            duration_ms = stats.total_duration_ms,
            tok_per_s = stats.tokens_per_second(),
            "LLM chat complete"
        );

        Ok(stats)
    }

    /// Stream with automatic fallback. A timeout or connect error on the
    /// primary model before any token was emitted retries the same messages
    /// on the fallback model exactly once; a `Fallback` event precedes the
    /// retried stream. Mid-stream failures are not retried (the consumer
    /// already saw partial output).
    pub async fn chat_with_fallback(
        &self,
        messages: Vec<Message>,
        gen: GenerationConfig,
        tx: mpsc::Sender<TokenEvent>,
    ) -> std::result::Result<StreamStats, LlmError> {
        let tokens_sent = std::sync::atomic::AtomicUsize::new(0);

        match self
            .stream_model(&self.config.primary_model, &messages, gen, &tx, &tokens_sent)
            .await
        {
            Ok(stats) => {
                let _ = tx.send(TokenEvent::Done(stats.clone())).await;
                Ok(stats)
            }
            Err(err @ (LlmError::Timeout | LlmError::Network(_)))
                if tokens_sent.load(std::sync::atomic::Ordering::Relaxed) == 0 =>
            {
                tracing::warn!(
                    primary = %self.config.primary_model,
                    fallback = %self.config.fallback_model,
                    error = %err,
                    "Primary model failed, retrying on fallback"
                );
                let _ = tx
                    .send(TokenEvent::Fallback {
                        from: self.config.primary_model.clone(),
                        to: self.config.fallback_model.clone(),
                    })
                    .await;

                match self
                    .stream_model(&self.config.fallback_model, &messages, gen, &tx, &tokens_sent)
                    .await
                {
                    Ok(stats) => {
                        let _ = tx.send(TokenEvent::Done(stats.clone())).await;
                        Ok(stats)
                    }
                    Err(fallback_err) => {
                        tracing::error!(error = %fallback_err, "Fallback model also failed");
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn chat_stream(
        &self,
        messages: Vec<Message>,
        config: GenerationConfig,
    ) -> Result<mpsc::Receiver<TokenEvent>> {
        let (tx, rx) = mpsc::channel(100);

        // First-byte failures should surface as errors rather than an empty
        // stream, so the fallback chain runs inside a task and reports
        // through the channel; only channel setup can fail here.
        let client = LlmClient {
            client: self.client.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = client.chat_with_fallback(messages, config, tx).await {
                tracing::error!(error = %e, "LLM stream failed");
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_openai_content_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hej"},"finish_reason":null}]}"#;
        assert_eq!(parse_openai_line(line), LineEvent::Content("Hej".to_string()));
    }

    #[test]
    fn test_parse_openai_finish() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_openai_line(line), LineEvent::Finished);
    }

    #[test]
    fn test_parse_openai_done_sentinel() {
        assert_eq!(parse_openai_line("data: [DONE]"), LineEvent::Finished);
    }

    #[test]
    fn test_parse_openai_ignores_noise() {
        assert_eq!(parse_openai_line(""), LineEvent::Ignored);
        assert_eq!(parse_openai_line(": keepalive"), LineEvent::Ignored);
        assert_eq!(parse_openai_line("data: {not json"), LineEvent::Ignored);
    }

    #[test]
    fn test_parse_ollama_content_line() {
        let line = r#"{"message":{"content":"Hej"},"done":false}"#;
        assert_eq!(parse_ollama_line(line), LineEvent::Content("Hej".to_string()));
    }

    #[test]
    fn test_parse_ollama_done() {
        let line = r#"{"message":{"content":""},"done":true}"#;
        assert_eq!(parse_ollama_line(line), LineEvent::Finished);
    }

    #[test]
    fn test_openai_request_serialization() {
        let messages = vec![Message::system("sys"), Message::user("Fråga: test")];
        let request = OpenAiRequest {
            model: "ministral-3:14b",
            messages: &messages,
            stream: true,
            temperature: 0.2,
            top_p: 0.9,
            max_tokens: 1024,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "ministral-3:14b");
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["max_tokens"], 1024);
    }

    #[test]
    fn test_ollama_request_serialization() {
        let messages = vec![Message::user("hej")];
        let request = OllamaRequest {
            model: "qwen2.5:7b-instruct",
            messages: &messages,
            stream: true,
            options: OllamaOptions { temperature: 0.7, top_p: 0.9, num_predict: 512 },
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["options"]["num_predict"], 512);
    }

    #[test]
    fn test_chat_endpoint_formats() {
        let mut config = LlmClientConfig::default();
        config.base_url = "http://host:8080".to_string();
        let client = LlmClient::new(config.clone()).unwrap();
        assert_eq!(client.chat_endpoint(), "http://host:8080/v1/chat/completions");

        config.base_url = "http://host:8080/v1".to_string();
        let client = LlmClient::new(config.clone()).unwrap();
        assert_eq!(client.chat_endpoint(), "http://host:8080/v1/chat/completions");

        config.format = WireFormat::Ollama;
        config.base_url = "http://localhost:11434".to_string();
        let client = LlmClient::new(config).unwrap();
        assert_eq!(client.chat_endpoint(), "http://localhost:11434/api/chat");
    }
}
