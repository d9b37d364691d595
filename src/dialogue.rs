//! Client for the hosted dialogue runtime (Voiceflow) and the dispatcher that turns its reply
//! events into transcript entries.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::config::DialogueConfig;
use crate::constants::UNEXPECTED_FORMAT_NOTICE;
use crate::session::SessionContext;
use crate::transcript::{ChatMessage, ChoiceOption};

#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("dialogue runtime answered {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("dialogue runtime sent a body that is not JSON: {0}")]
    Body(#[source] reqwest::Error),
}

/// Structures matching the runtime's `/interact` endpoint.
#[derive(Debug, Serialize)]
struct InteractRequest<'a> {
    action: Action<'a>,
}

#[derive(Debug, Serialize)]
struct Action<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: &'a str,
}

/// Sends one user turn to the dialogue service and returns the raw response body.
#[async_trait]
pub trait DialogueClient: Send + Sync {
    async fn interact(&self, session: &SessionContext, text: &str) -> Result<Value, DialogueError>;
}

pub struct VoiceflowClient {
    http: Client,
    config: DialogueConfig,
}

impl VoiceflowClient {
    pub fn new(config: DialogueConfig) -> Result<Self, DialogueError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(DialogueError::Client)?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl DialogueClient for VoiceflowClient {
    #[instrument(skip(self, session, text), fields(session = %session))]
    async fn interact(&self, session: &SessionContext, text: &str) -> Result<Value, DialogueError> {
        let url = self.config.interact_url(session.id());
        let request = InteractRequest {
            action: Action {
                kind: "text",
                payload: text,
            },
        };

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, &self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|source| DialogueError::Transport {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %body, "Dialogue runtime request failed");
            return Err(DialogueError::Status { status, body });
        }

        let body = response.json::<Value>().await.map_err(DialogueError::Body)?;
        debug!(response = %body, "Dialogue runtime response");
        Ok(body)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Button {
    pub name: String,
}

/// Card descriptions arrive either as plain text or as a rich-text object with a `text` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CardDescription {
    Plain(String),
    Rich { text: String },
}

impl CardDescription {
    fn into_text(self) -> String {
        match self {
            CardDescription::Plain(text) | CardDescription::Rich { text } => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CardPayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<CardDescription>,
    #[serde(default, rename = "imageUrl")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub buttons: Option<Vec<Button>>,
}

#[derive(Debug, Deserialize)]
struct TextPayload {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoicePayload {
    #[serde(default)]
    buttons: Vec<Button>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// One discriminated unit of a dialogue reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    Text { message: String },
    Choice { buttons: Vec<Button> },
    Card(CardPayload),
    /// Anything this front end does not render (speak, visual, debug, path, end, ...).
    Unknown { kind: String },
}

impl ReplyEvent {
    pub fn from_value(value: &Value) -> Self {
        let raw = match RawEvent::deserialize(value) {
            Ok(raw) => raw,
            Err(_) => {
                return ReplyEvent::Unknown {
                    kind: String::new(),
                }
            }
        };

        let unknown = || ReplyEvent::Unknown {
            kind: raw.kind.clone(),
        };

        match raw.kind.as_str() {
            "text" => match TextPayload::deserialize(&raw.payload) {
                Ok(TextPayload {
                    message: Some(message),
                }) if !message.is_empty() => ReplyEvent::Text { message },
                _ => unknown(),
            },
            "choice" => match ChoicePayload::deserialize(&raw.payload) {
                Ok(ChoicePayload { buttons }) if !buttons.is_empty() => {
                    ReplyEvent::Choice { buttons }
                }
                _ => unknown(),
            },
            "cardV2" => match CardPayload::deserialize(&raw.payload) {
                Ok(card) if raw.payload.is_object() => ReplyEvent::Card(card),
                _ => unknown(),
            },
            _ => unknown(),
        }
    }

    /// The transcript entry for this event, or `None` if it is not rendered.
    pub fn into_message(self) -> Option<ChatMessage> {
        match self {
            ReplyEvent::Text { message } => Some(ChatMessage::BotText { text: message }),
            ReplyEvent::Choice { buttons } => Some(ChatMessage::ChoiceSet {
                options: into_options(buttons),
            }),
            ReplyEvent::Card(card) => Some(ChatMessage::Card {
                title: card.title.unwrap_or_default(),
                description: card
                    .description
                    .map(CardDescription::into_text)
                    .unwrap_or_default(),
                image_url: card.image_url.filter(|url| !url.is_empty()),
                options: into_options(card.buttons.unwrap_or_default()),
            }),
            ReplyEvent::Unknown { kind } => {
                debug!(%kind, "Dropping unrendered dialogue event");
                None
            }
        }
    }
}

fn into_options(buttons: Vec<Button>) -> Vec<ChoiceOption> {
    buttons
        .into_iter()
        .map(|button| ChoiceOption { label: button.name })
        .collect()
}

/// Maps a whole reply body to transcript entries, preserving event order.
pub fn dispatch_reply(body: &Value) -> Vec<ChatMessage> {
    let Some(events) = body.as_array() else {
        return vec![ChatMessage::bot(UNEXPECTED_FORMAT_NOTICE)];
    };

    events
        .iter()
        .map(ReplyEvent::from_value)
        .filter_map(ReplyEvent::into_message)
        .collect()
}
