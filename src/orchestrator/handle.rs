use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::conversation::{ConversationId, Message, MessageId};
use crate::llm::BackendKind;

/// How a generation attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The stream finished and the text was classified.
    Completed { censored: bool },
    /// The adapter failed; the message now holds this error text.
    Failed(String),
    /// Stopped by the caller or superseded; partial text was kept.
    Cancelled,
}

/// Published by the orchestrator on its broadcast channel.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    /// A message was added or its contents changed (every streamed token).
    MessageUpdated {
        conversation_id: ConversationId,
        message: Message,
    },
    GenerationFinished {
        conversation_id: ConversationId,
        message_id: MessageId,
        outcome: GenerationOutcome,
    },
    /// Transient notification for the user.
    Notice {
        conversation_id: ConversationId,
        text: String,
    },
}

/// One in-flight streaming operation bound to an assistant message.
#[derive(Debug, Clone)]
pub struct GenerationHandle {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub backend: BackendKind,
    cancel: CancellationToken,
    done: watch::Receiver<Option<GenerationOutcome>>,
}

/// Task-side half of a handle: reports the outcome.
pub(crate) struct Completion(watch::Sender<Option<GenerationOutcome>>);

impl Completion {
    pub(crate) fn finish(self, outcome: GenerationOutcome) {
        let _ = self.0.send(Some(outcome));
    }
}

impl GenerationHandle {
    pub(crate) fn new(
        conversation_id: ConversationId,
        message_id: MessageId,
        backend: BackendKind,
    ) -> (Self, Completion) {
        let (tx, rx) = watch::channel(None);
        (
            Self {
                id: Uuid::new_v4(),
                conversation_id,
                message_id,
                backend,
                cancel: CancellationToken::new(),
                done: rx,
            },
            Completion(tx),
        )
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation.  In-flight work stops at its next yield point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }

    /// Wait until the attempt has been finalized and persisted.
    pub async fn finished(&self) -> GenerationOutcome {
        let mut rx = self.done.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(GenerationOutcome::Cancelled),
            Err(_) => GenerationOutcome::Cancelled,
        }
    }
}
