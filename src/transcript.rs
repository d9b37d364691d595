use chrono::Local;
use serde::Serialize;

/// A clickable button under a choice set or card. Clicking sends `label` as a user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChoiceOption {
    pub label: String,
}

impl ChoiceOption {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

/// One rendered chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatMessage {
    UserText {
        text: String,
    },
    /// May carry Markdown.
    BotText {
        text: String,
    },
    ChoiceSet {
        options: Vec<ChoiceOption>,
    },
    Card {
        title: String,
        description: String,
        image_url: Option<String>,
        options: Vec<ChoiceOption>,
    },
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        ChatMessage::UserText { text: text.into() }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        ChatMessage::BotText { text: text.into() }
    }

    /// Buttons attached to this turn, if any.
    pub fn options(&self) -> &[ChoiceOption] {
        match self {
            ChatMessage::ChoiceSet { options } | ChatMessage::Card { options, .. } => options.as_slice(),
            ChatMessage::UserText { .. } | ChatMessage::BotText { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub message: ChatMessage,
}

/// Append-only list of chat turns for one session.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        let timestamp = Local::now().format("%H:%M:%S").to_string();
        self.entries.push(TranscriptEntry { timestamp, message });
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        for message in messages {
            self.push(message);
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Options of the most recent turn that offered buttons.
    pub fn latest_options(&self) -> &[ChoiceOption] {
        self.entries
            .iter()
            .rev()
            .map(|entry| entry.message.options())
            .find(|options| !options.is_empty())
            .unwrap_or(&[])
    }
}
