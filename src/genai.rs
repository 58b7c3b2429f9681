//! Generative-AI provider boundary.
//!
//! Two call types, mirroring what the platform consumes: structured
//! analysis generation (prompt + optional inline binary content in, text
//! out) and streaming chat completion (system prompt + message history in,
//! incremental text out). [`HttpModel`] implements both against an
//! OpenAI-compatible API; the stream side parses SSE `data:` lines with
//! partial-line buffering and a `[DONE]` terminator.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use futures::stream::Stream;

use crate::error::{Error, Result};
use crate::models::{ChatMessage, ChatRole};

/// Optional inline binary content attached to a generation request
/// (image bytes analyzed without text extraction).
pub struct Attachment<'a> {
    pub media_type: &'a str,
    pub bytes: &'a [u8],
}

/// Incremental text chunks terminated by end-of-stream or an error item.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Settings for a single generation call.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

/// The generative model boundary consumed by the analyzer and chat
/// assembler. Production code talks to an HTTP provider; tests inject a
/// scripted fake.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// One-shot generation. The caller supplies the full prompt; inline
    /// binary content (images) rides along when present.
    async fn generate(
        &self,
        prompt: &str,
        attachment: Option<Attachment<'_>>,
        options: &GenerationOptions,
    ) -> Result<String>;

    /// Streaming chat completion over a system prompt and history.
    async fn stream_chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<TokenStream>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpModel {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl HttpModel {
    pub fn new(base_url: Option<String>, timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Validation("OPENAI_API_KEY environment variable not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::PermanentProvider(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            max_retries,
        })
    }

    fn request_body(
        &self,
        system: Option<&str>,
        messages: &[serde_json::Value],
        options: &GenerationOptions,
        stream: bool,
    ) -> serde_json::Value {
        let mut all_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            all_messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        all_messages.extend_from_slice(messages);

        let mut body = serde_json::json!({
            "model": options.model,
            "messages": all_messages,
            "temperature": options.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn post_checked(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::TransientProvider(format!(
                "chat API error {status}: {text}"
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::PermanentProvider(format!(
                "chat API error {status}: {text}"
            )));
        }
        Ok(response)
    }
}

fn user_message_with_attachment(prompt: &str, attachment: Option<Attachment<'_>>) -> serde_json::Value {
    match attachment {
        None => serde_json::json!({"role": "user", "content": prompt}),
        Some(att) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(att.bytes);
            let data_url = format!("data:{};base64,{}", att.media_type, encoded);
            serde_json::json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ],
            })
        }
    }
}

fn chat_history_json(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            serde_json::json!({"role": role, "content": m.content})
        })
        .collect()
}

#[async_trait]
impl GenerativeModel for HttpModel {
    async fn generate(
        &self,
        prompt: &str,
        attachment: Option<Attachment<'_>>,
        options: &GenerationOptions,
    ) -> Result<String> {
        let user = user_message_with_attachment(prompt, attachment);
        let body = self.request_body(None, std::slice::from_ref(&user), options, false);

        let mut last_err = None;
        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.post_checked(&body).await {
                Ok(response) => {
                    let json: serde_json::Value = response.json().await.map_err(|e| {
                        Error::PermanentProvider(format!("invalid chat response: {e}"))
                    })?;
                    let content = json
                        .get("choices")
                        .and_then(|c| c.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|choice| choice.pointer("/message/content"))
                        .and_then(|c| c.as_str())
                        .ok_or_else(|| {
                            Error::PermanentProvider(
                                "invalid chat response: missing choices[0].message.content".into(),
                            )
                        })?;
                    return Ok(content.to_string());
                }
                Err(e) if e.is_retryable() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::TransientProvider("generation failed after retries".into())))
    }

    async fn stream_chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<TokenStream> {
        let history = chat_history_json(messages);
        let body = self.request_body(Some(system), &history, options, true);

        let response = self.post_checked(&body).await?;
        let stream = SseTokenStream::new(response.bytes_stream());
        Ok(Box::pin(stream))
    }
}

// ============ SSE parsing ============

#[derive(Debug, serde::Deserialize)]
struct StreamChunkRaw {
    choices: Vec<StreamChoiceRaw>,
}

#[derive(Debug, serde::Deserialize)]
struct StreamChoiceRaw {
    delta: DeltaRaw,
}

#[derive(Debug, serde::Deserialize)]
struct DeltaRaw {
    #[serde(default)]
    content: Option<String>,
}

/// Adapter turning a raw SSE byte stream into text deltas. Buffers partial
/// lines across network chunks; the stream ends at `data: [DONE]`.
struct SseTokenStream<S> {
    inner: Pin<Box<S>>,
    buffer: String,
    done: bool,
}

impl<S> SseTokenStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    fn new(byte_stream: S) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseTokenStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.done {
                return Poll::Ready(None);
            }

            match parse_sse_line(&mut this.buffer) {
                SseEvent::Delta(text) => return Poll::Ready(Some(Ok(text))),
                SseEvent::Done => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                SseEvent::Error(e) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                SseEvent::NeedMore => {}
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => this.buffer.push_str(text),
                    Err(e) => {
                        this.done = true;
                        return Poll::Ready(Some(Err(Error::PermanentProvider(format!(
                            "invalid UTF-8 in stream: {e}"
                        )))));
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(Error::TransientProvider(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

enum SseEvent {
    Delta(String),
    Done,
    Error(Error),
    NeedMore,
}

/// Pull the next meaningful event out of the line buffer. Non-`data` SSE
/// fields and blank separator lines are skipped; empty deltas are folded
/// into the next read.
fn parse_sse_line(buffer: &mut String) -> SseEvent {
    loop {
        let Some(newline_pos) = buffer.find('\n') else {
            return SseEvent::NeedMore;
        };
        let line = buffer[..newline_pos].trim().to_string();
        buffer.drain(..=newline_pos);

        if line.is_empty() {
            continue;
        }

        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        let data = data.trim();

        if data == "[DONE]" {
            return SseEvent::Done;
        }

        match serde_json::from_str::<StreamChunkRaw>(data) {
            Ok(raw) => {
                let delta = raw
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .unwrap_or_default();
                if delta.is_empty() {
                    continue;
                }
                return SseEvent::Delta(delta);
            }
            Err(e) => {
                return SseEvent::Error(Error::PermanentProvider(format!(
                    "failed to parse stream chunk: {} (data: {})",
                    e,
                    &data[..data.len().min(200)]
                )));
            }
        }
    }
}
