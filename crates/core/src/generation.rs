use crate::config::OpenAiConfig;
use crate::error::ServiceError;
use crate::http::send_with_retry;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

/// Content fragments in generation order; ends when the service signals end of stream.
pub type TokenStream = BoxStream<'static, Result<String, ServiceError>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ServiceError>;

    async fn stream(&self, request: &ChatRequest) -> Result<TokenStream, ServiceError>;
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiChatModel {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiChatModel {
    pub fn new(config: OpenAiConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, ServiceError> {
        let url = self.config.endpoint("chat/completions");
        let body = CompletionBody {
            model: &self.config.chat_model,
            messages: &request.messages,
            temperature: request.temperature,
            stream,
        };
        debug!(model = %self.config.chat_model, stream, messages = request.messages.len(), "chat request");

        send_with_retry("chat", self.config.retry, || {
            let builder = self.client.post(&url).json(&body);
            match &self.config.api_key {
                Some(key) => builder.bearer_auth(key),
                None => builder,
            }
        })
        .await
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn complete(&self, request: &ChatRequest) -> Result<String, ServiceError> {
        let response = self.send(request, false).await?;
        let parsed: CompletionResponse = response.json().await?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::backend("chat", "completion without message content"))
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TokenStream, ServiceError> {
        let response = self.send(request, true).await?;
        let mut bytes = response.bytes_stream();

        let tokens = try_stream! {
            let mut decoder = SseDecoder::default();
            let mut done = false;
            'body: while let Some(chunk) = bytes.next().await {
                let chunk = chunk?;
                for event in decoder.push(&chunk) {
                    match event {
                        SseEvent::Data(payload) => {
                            if let Some(content) = parse_delta(&payload)? {
                                yield content;
                            }
                        }
                        SseEvent::Done => {
                            done = true;
                            break 'body;
                        }
                    }
                }
            }

            if !done {
                if let Some(SseEvent::Data(payload)) = decoder.finish() {
                    if let Some(content) = parse_delta(&payload)? {
                        yield content;
                    }
                }
            }
        };

        Ok(Box::pin(tokens))
    }
}

/// One `data:` line of a Server-Sent Events body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental line splitter for an SSE body arriving in arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    let payload = line.strip_prefix("data:")?.trim_start();

    if payload == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(payload.to_string()))
    }
}

/// Extracts `choices[0].delta.content`; empty fragments are dropped.
fn parse_delta(payload: &str) -> Result<Option<String>, ServiceError> {
    let chunk: StreamChunk = serde_json::from_str(payload)?;
    if let Some(error) = chunk.error {
        return Err(ServiceError::backend("chat", error.to_string()));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta)
        .and_then(|delta| delta.content)
        .filter(|content| !content.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::http::canned::{serve, Canned};

    fn model_at(base: &str) -> OpenAiChatModel {
        OpenAiChatModel::new(OpenAiConfig {
            api_base: format!("{base}/v1"),
            retry: RetryPolicy::none(),
            ..OpenAiConfig::default()
        })
    }

    fn question() -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user("When are refunds issued?")],
            temperature: 0.2,
        }
    }

    async fn collect(stream: TokenStream) -> Result<String, ServiceError> {
        let pieces: Vec<String> = stream.collect::<Vec<_>>().await.into_iter().collect::<Result<_, _>>()?;
        Ok(pieces.concat())
    }

    #[tokio::test]
    async fn chunked_event_stream_ending_in_done_yields_all_content() -> Result<(), Box<dyn std::error::Error>> {
        let (base, seen, _server) = serve(vec![Canned::event_stream(&[
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Refunds take \"}}]}\n\ndata: {\"choices\":[{\"del",
            "ta\":{\"content\":\"14 days.\"}}]}\n\n",
            "data: [DONE]\n\n",
        ])])
        .await?;

        let text = collect(model_at(&base).stream(&question()).await?).await?;

        assert_eq!(text, "Refunds take 14 days.");
        assert_eq!(
            seen.lock().map(|seen| seen.clone()).unwrap_or_default(),
            vec!["POST /v1/chat/completions".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn event_stream_closed_without_done_still_yields_all_content() -> Result<(), Box<dyn std::error::Error>> {
        let (base, _seen, _server) = serve(vec![Canned::event_stream(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Classes run \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"on Tuesdays.\"}}]}",
        ])])
        .await?;

        let text = collect(model_at(&base).stream(&question()).await?).await?;

        assert_eq!(text, "Classes run on Tuesdays.");
        Ok(())
    }

    #[tokio::test]
    async fn rejected_stream_request_fails_before_any_token() -> Result<(), Box<dyn std::error::Error>> {
        let (base, _seen, _server) = serve(vec![Canned::json(
            "401 Unauthorized",
            r#"{"error":{"message":"invalid api key"}}"#,
        )])
        .await?;

        let result = model_at(&base).stream(&question()).await;

        assert!(matches!(result, Err(ServiceError::BackendResponse { .. })));
        Ok(())
    }

    #[test]
    fn data_lines_split_across_chunks_are_reassembled() {
        let mut decoder = SseDecoder::default();

        let first = decoder.push(b"data: {\"choices\":[{\"delta\":{\"con");
        assert!(first.is_empty());

        let second = decoder.push(b"tent\":\"Hi\"}}]}\r\n\r\n: keep-alive\nevent: message\ndata: [DONE]\n");
        assert_eq!(
            second,
            vec![
                SseEvent::Data(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#.to_string()),
                SseEvent::Done
            ]
        );
    }

    #[test]
    fn multibyte_characters_survive_chunk_boundaries() {
        let mut decoder = SseDecoder::default();
        let line = "data: café\n".as_bytes();
        let split = line.len() - 2;

        assert!(decoder.push(&line[..split]).is_empty());
        assert_eq!(decoder.push(&line[split..]), vec![SseEvent::Data("café".to_string())]);
    }

    #[test]
    fn unterminated_last_line_is_flushed() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some(SseEvent::Done));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn deltas_yield_content_and_skip_role_only_chunks() -> Result<(), ServiceError> {
        assert_eq!(
            parse_delta(r#"{"choices":[{"delta":{"content":"{\"answer"}}]}"#)?,
            Some("{\"answer".to_string())
        );
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#)?, None);
        assert_eq!(parse_delta(r#"{"choices":[{"delta":{"content":""}}]}"#)?, None);
        assert_eq!(parse_delta(r#"{"choices":[],"usage":{"total_tokens":3}}"#)?, None);
        Ok(())
    }

    #[test]
    fn error_payloads_in_the_stream_fail() {
        let result = parse_delta(r#"{"error":{"message":"rate limited"}}"#);
        assert!(matches!(result, Err(ServiceError::BackendResponse { .. })));
    }

    #[test]
    fn request_body_omits_stream_flag_when_blocking() -> Result<(), serde_json::Error> {
        let messages = vec![ChatMessage::system("rules"), ChatMessage::user("question")];
        let blocking = serde_json::to_value(CompletionBody {
            model: "gpt-4.1-mini",
            messages: &messages,
            temperature: 0.25,
            stream: false,
        })?;
        assert_eq!(
            blocking,
            serde_json::json!({
                "model": "gpt-4.1-mini",
                "messages": [
                    { "role": "system", "content": "rules" },
                    { "role": "user", "content": "question" }
                ],
                "temperature": 0.25
            })
        );

        let streaming = serde_json::to_value(CompletionBody {
            model: "gpt-4.1-mini",
            messages: &messages,
            temperature: 0.25,
            stream: true,
        })?;
        assert_eq!(streaming["stream"], true);
        Ok(())
    }
}
