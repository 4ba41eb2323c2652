//! HTTP Chat Backend
//!
//! Plain request/response backend: bot availability via `GET /isReady`
//! polling and one-shot chat turns via `POST /chat`. A chat response is
//! either a single JSON document or, when the backend streams, a
//! chunked sequence of JSON fragments (detected via the
//! `Transfer-Encoding: chunked` header).

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::BackendError;

/// One bot's availability entry from `GET /isReady`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BotStatus {
    /// Bot name advertised by the backend.
    #[serde(rename = "BotName")]
    pub bot_name: String,
    /// Whether the bot can answer right now.
    #[serde(rename = "Ready")]
    pub ready: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    #[serde(rename = "Query")]
    query: &'a str,
    #[serde(rename = "UserId")]
    user_id: &'a str,
    #[serde(rename = "BotName", skip_serializing_if = "Option::is_none")]
    bot_name: Option<&'a str>,
}

/// Metadata block of a chat response fragment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct FragmentMetadata {
    /// Identifier the backend assigned to this turn.
    #[serde(rename = "QueryId", default)]
    pub query_id: String,
}

/// Response block of a chat response fragment.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct FragmentResponse {
    /// Bot text, cleaned of markup.
    #[serde(rename = "CleanedText", default)]
    pub cleaned_text: String,
}

/// One JSON document (or chunked fragment) of a chat response.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ChatFragment {
    /// Turn metadata.
    #[serde(rename = "Metadata", default)]
    pub metadata: FragmentMetadata,
    /// Turn payload.
    #[serde(rename = "Response", default)]
    pub response: FragmentResponse,
}

/// Outcome of a chat request.
pub enum ChatReply {
    /// The whole answer arrived as one JSON document.
    Single(ChatFragment),
    /// The answer streams in as chunked JSON fragments.
    Chunked(BoxStream<'static, Result<ChatFragment, BackendError>>),
    /// The backend answered with a non-200 status.
    Rejected {
        /// The HTTP status code.
        status: u16,
    },
}

/// The HTTP chat backend as tasks see it.
#[async_trait]
pub trait HttpChat: Send + Sync {
    /// Fetch the availability list.
    async fn ready_bots(&self) -> Result<Vec<BotStatus>, BackendError>;

    /// Submit one chat turn.
    async fn chat(
        &self,
        user_id: &str,
        query: &str,
        bot_name: Option<&str>,
    ) -> Result<ChatReply, BackendError>;
}

/// Production [`HttpChat`] over `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpChatClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpChatClient {
    /// Create a client for the backend at `base_url`.
    #[must_use]
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }
}

fn from_reqwest(err: reqwest::Error) -> BackendError {
    if err.is_connect() || err.is_timeout() {
        BackendError::Transient(err.to_string())
    } else {
        BackendError::Failed(err.to_string())
    }
}

#[async_trait]
impl HttpChat for HttpChatClient {
    async fn ready_bots(&self) -> Result<Vec<BotStatus>, BackendError> {
        let url = format!("{}/isReady", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(from_reqwest)?
            .error_for_status()
            .map_err(from_reqwest)?;
        response.json().await.map_err(from_reqwest)
    }

    async fn chat(
        &self,
        user_id: &str,
        query: &str,
        bot_name: Option<&str>,
    ) -> Result<ChatReply, BackendError> {
        let url = format!("{}/chat", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&ChatRequestBody {
                query,
                user_id,
                bot_name,
            })
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Ok(ChatReply::Rejected {
                status: status.as_u16(),
            });
        }

        let chunked = response
            .headers()
            .get(reqwest::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("chunked"));

        if chunked {
            let fragments = response
                .bytes_stream()
                .map(|chunk| {
                    let chunk = chunk.map_err(from_reqwest)?;
                    serde_json::from_slice::<ChatFragment>(&chunk)
                        .map_err(|e| BackendError::Failed(format!("bad chat fragment: {e}")))
                })
                .boxed();
            Ok(ChatReply::Chunked(fragments))
        } else {
            let fragment = response.json().await.map_err(from_reqwest)?;
            Ok(ChatReply::Single(fragment))
        }
    }
}
