//! Streaming client for OpenAI-compatible chat completion endpoints.
//!
//! Posts `{model, messages, stream: true}` to `{base_url}/v1/chat/completions`
//! and reads the server-sent-event body line by line. Each `data:` payload is
//! a JSON chunk whose `choices[0].delta.content` is the next token; a
//! `data: [DONE]` line ends the stream.
//!
//! Status mapping:
//!
//! | Response | Error | Counts against health |
//! |---|---|---|
//! | 429 | `ProviderRateLimited` (with `Retry-After` seconds) | yes |
//! | 5xx | `ProviderServerError` | yes |
//! | client timeout | `ProviderTimeout` | yes |
//! | connection failure | `Http` | yes |
//! | other 4xx | `Api` | no |

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, stream};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::traits::ModelProvider;
use crate::config::ProviderConfig;
use crate::types::TokenStream;
use crate::{Result, SwitchboardError};

/// Default connect timeout for provider connections.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for one OpenAI-compatible endpoint.
#[derive(Clone)]
pub struct HttpProvider {
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
    http: Client,
    connect_timeout: Duration,
}

impl HttpProvider {
    /// Create a provider for `model` served at `base_url`.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SwitchboardError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            http,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Build from a `[[providers]]` config entry.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let provider = Self::new(&config.name, &config.base_url, &config.model)?;
        Ok(match config.api_key() {
            Some(key) => provider.with_api_key(key),
            None => provider,
        })
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> SwitchboardError {
        if err.is_timeout() {
            SwitchboardError::ProviderTimeout {
                provider: self.name.clone(),
                elapsed: self.connect_timeout,
            }
        } else {
            SwitchboardError::Http(err.to_string())
        }
    }

    /// Check response status and map to the provider error taxonomy.
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status.as_u16() {
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(SwitchboardError::ProviderRateLimited {
                    provider: self.name.clone(),
                    retry_after,
                })
            }
            code if status.is_server_error() => Err(SwitchboardError::ProviderServerError {
                provider: self.name.clone(),
                status: code,
                message: response.text().await.unwrap_or_default(),
            }),
            code => Err(SwitchboardError::Api {
                status: code,
                message: response
                    .text()
                    .await
                    .unwrap_or_else(|_| status.to_string()),
            }),
        }
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, prompt: &str, cancel: &CancellationToken) -> Result<TokenStream> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: true,
        };

        let request = self.authorized(self.http.post(&url)).json(&body).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(SwitchboardError::RequestCancelled),
            response = request => response.map_err(|e| self.map_send_error(e))?,
        };
        let response = self.check_status(response).await?;

        let tokens = sse_tokens(Box::pin(response.bytes_stream()))
            .take_until(cancel.clone().cancelled_owned());
        Ok(Box::pin(tokens))
    }

    async fn probe(&self) -> Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .authorized(self.http.get(&url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.check_status(response).await.map(|_| ())
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// SSE decoding
// ============================================================================

/// What one SSE line contributed.
#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        // Comments, `event:` and blank separator lines.
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: ChatChunk = serde_json::from_str(data)?;
    let token = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();
    Ok(if token.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Token(token)
    })
}

struct SseState<S> {
    body: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

/// Decode an SSE byte stream into content tokens.
fn sse_tokens<S>(body: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin,
{
    let state = SseState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                        let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                        match parse_sse_line(&line) {
                            Ok(SseLine::Token(token)) => state.pending.push_back(Ok(token)),
                            Ok(SseLine::Done) => {
                                state.finished = true;
                                break;
                            }
                            Ok(SseLine::Skip) => {}
                            Err(e) => {
                                state.pending.push_back(Err(SwitchboardError::Stream(format!(
                                    "malformed chunk: {e}"
                                ))));
                                state.finished = true;
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .pending
                        .push_back(Err(SwitchboardError::Stream(e.to_string())));
                }
                None => {
                    state.finished = true;
                    // Body closed without [DONE]; a trailing unterminated line may still hold data.
                    if !state.buffer.is_empty() {
                        let line = String::from_utf8_lossy(&state.buffer).into_owned();
                        state.buffer.clear();
                        if let Ok(SseLine::Token(token)) = parse_sse_line(&line) {
                            state.pending.push_back(Ok(token));
                        }
                    }
                }
            }
        }
    })
}
