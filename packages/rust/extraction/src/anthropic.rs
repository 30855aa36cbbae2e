//! Anthropic Messages API client.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use chatkb_shared::{ChatKbError, ExtractionSettings, Result};

use crate::service::{Completion, CompletionRequest, ExtractionService};

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// User-Agent string for extraction requests.
const USER_AGENT: &str = concat!("chatkb/", env!("CARGO_PKG_VERSION"));

/// HTTP 529: the API is temporarily overloaded.
const STATUS_OVERLOADED: u16 = 529;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: [Message<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Extraction service backed by `POST {base_url}/v1/messages`.
pub struct AnthropicService {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicService {
    /// Build a client. The key comes from the caller, never from the environment.
    pub fn new(settings: &ExtractionSettings, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ChatKbError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: messages_endpoint(&settings.base_url)?,
            api_key: api_key.into(),
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
        })
    }
}

fn messages_endpoint(base: &Url) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("v1/messages")
        .map_err(|e| ChatKbError::config(format!("invalid extraction endpoint: {e}")))
}

fn classify_status(status: StatusCode, body: &str) -> ChatKbError {
    let snippet: String = body.chars().take(200).collect();
    let message = format!("HTTP {status}: {snippet}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || status.as_u16() == STATUS_OVERLOADED
    {
        ChatKbError::ServiceTransient(message)
    } else {
        ChatKbError::ServicePermanent(message)
    }
}

impl ExtractionService for AnthropicService {
    #[instrument(skip_all, fields(model = %self.model, prompt_chars = request.prompt.len()))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: &request.system,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatKbError::ServiceTransient(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ChatKbError::ServiceTransient(format!("body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }

        let parsed: MessagesResponse = serde_json::from_str(&text)
            .map_err(|e| ChatKbError::MalformedResponse(format!("invalid response envelope: {e}")))?;

        let reply: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");

        if reply.trim().is_empty() {
            return Err(ChatKbError::MalformedResponse("response has no text content".into()));
        }

        let (tokens_in, tokens_out) = parsed
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or_default();
        debug!(tokens_in, tokens_out, reply_chars = reply.len(), "extraction reply received");

        Ok(Completion {
            text: reply,
            tokens_in,
            tokens_out,
        })
    }
}
