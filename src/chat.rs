// Chat widget: owns one session's transcript and drives turns against the dialogue client.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info};

use crate::constants::NETWORK_ERROR_NOTICE;
use crate::dialogue::{dispatch_reply, DialogueClient};
use crate::session::SessionContext;
use crate::transcript::{ChatMessage, Transcript, TranscriptEntry};

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Blank input; nothing was appended or sent.
    Ignored,
    Completed { replies: Vec<ChatMessage> },
}

#[derive(Debug, Default)]
struct ChatState {
    transcript: Transcript,
    in_flight: usize,
}

pub struct ChatWidget {
    session: SessionContext,
    client: Arc<dyn DialogueClient>,
    state: Mutex<ChatState>,
    // Dialogue calls go out one at a time so replies land in the order turns were issued.
    // tokio's mutex is fair, which gives FIFO among waiting turns.
    send_gate: tokio::sync::Mutex<()>,
}

impl ChatWidget {
    pub fn new(session: SessionContext, client: Arc<dyn DialogueClient>) -> Self {
        Self {
            session,
            client,
            state: Mutex::new(ChatState::default()),
            send_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Sends typed text or a clicked button label.
    ///
    /// The user turn is appended before the dialogue call is awaited; replies (or a single
    /// error notice) are appended when it resolves.
    pub async fn send_turn(&self, text: &str) -> TurnOutcome {
        if text.trim().is_empty() {
            return TurnOutcome::Ignored;
        }

        let _loading = self.begin_turn(text);
        let _order = self.send_gate.lock().await;

        let replies = match self.client.interact(&self.session, text).await {
            Ok(body) => dispatch_reply(&body),
            Err(e) => {
                error!(session = %self.session, "Dialogue call failed: {:?}", e);
                vec![ChatMessage::bot(NETWORK_ERROR_NOTICE)]
            }
        };

        info!(session = %self.session, replies = replies.len(), "Turn completed");
        self.lock_state().transcript.extend(replies.iter().cloned());
        TurnOutcome::Completed { replies }
    }

    /// True while any turn is waiting on the dialogue service.
    pub fn is_loading(&self) -> bool {
        self.lock_state().in_flight > 0
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.lock_state().transcript.entries().to_vec()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock_state().transcript.messages().cloned().collect()
    }

    /// Label behind button `index` (1-based) of the most recent choice set or card.
    pub fn option_label(&self, index: usize) -> Option<String> {
        let state = self.lock_state();
        index
            .checked_sub(1)
            .and_then(|i| state.transcript.latest_options().get(i))
            .map(|option| option.label.clone())
    }

    fn begin_turn(&self, text: &str) -> LoadingGuard<'_> {
        let mut state = self.lock_state();
        state.transcript.push(ChatMessage::user(text));
        state.in_flight += 1;
        LoadingGuard { widget: self }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChatState> {
        // State is only touched in short sections that cannot leave it half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Clears this turn's share of the loading flag however the turn ends, including when the
/// awaiting task is dropped.
struct LoadingGuard<'a> {
    widget: &'a ChatWidget,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.widget.lock_state();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::DialogueError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedClient {
        body: Value,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DialogueClient for CannedClient {
        async fn interact(&self, _session: &SessionContext, _text: &str) -> Result<Value, DialogueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    fn widget(body: Value) -> (ChatWidget, Arc<CannedClient>) {
        let client = Arc::new(CannedClient {
            body,
            calls: AtomicUsize::new(0),
        });
        (ChatWidget::new(SessionContext::new(), client.clone()), client)
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let (widget, client) = widget(json!([]));
        assert_eq!(widget.send_turn("").await, TurnOutcome::Ignored);
        assert_eq!(widget.send_turn("   \t\n").await, TurnOutcome::Ignored);
        assert!(widget.messages().is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_turn_appends_user_then_replies() {
        let (widget, _) = widget(json!([{"type": "text", "payload": {"message": "hi"}}]));
        let outcome = widget.send_turn("hello").await;

        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                replies: vec![ChatMessage::bot("hi")]
            }
        );
        assert_eq!(
            widget.messages(),
            vec![ChatMessage::user("hello"), ChatMessage::bot("hi")]
        );
        assert!(!widget.is_loading());
    }

    #[tokio::test]
    async fn test_option_label_uses_latest_buttons() {
        let (widget, _) = widget(json!([{
            "type": "choice",
            "payload": {"buttons": [{"name": "Yes"}, {"name": "No"}]}
        }]));
        widget.send_turn("start").await;

        assert_eq!(widget.option_label(1).as_deref(), Some("Yes"));
        assert_eq!(widget.option_label(2).as_deref(), Some("No"));
        assert_eq!(widget.option_label(0), None);
        assert_eq!(widget.option_label(3), None);
    }
}
