pub mod handle;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::censor;
use crate::config::Config;
use crate::conversation::{Conversation, ConversationId, Message, MessageId, Role, Source};
use crate::error::{ParleyError, Result};
use crate::llm::{BackendAdapter, BackendKind, Backends, GenerationRequest, SamplingParams};
use crate::search::{build_augmented_prompt, SearchClient, SourceAugmenter};
use crate::store::ConversationStore;

pub use handle::{ConversationEvent, GenerationHandle, GenerationOutcome};

use handle::Completion;

const EVENT_CAPACITY: usize = 256;

/// Orchestrator knobs derived from the config file.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub system_prompt: String,
    pub history_window: usize,
    pub sampling: SamplingParams,
    pub search_enabled: bool,
    pub search_max_results: usize,
    pub search_fetch_top: usize,
    pub local_enabled: bool,
    pub handshake_enabled: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            history_window: config.history_window,
            sampling: config.sampling.clone().into(),
            search_enabled: config.search.enabled,
            search_max_results: config.search.max_results,
            search_fetch_top: config.search.fetch_top,
            local_enabled: config.local.enabled,
            handshake_enabled: config.handshake.enabled,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// -- Per-conversation state -------------------------------------------------

/// A refused turn, kept so a regeneration can replay it.
#[derive(Debug, Clone)]
struct CensoredTurn {
    prompt: String,
    sources: Vec<Source>,
}

struct Live {
    handle_id: uuid::Uuid,
    message_id: MessageId,
    cancel: tokio_util::sync::CancellationToken,
}

struct SessionState {
    conversation: Conversation,
    live: Option<Live>,
    censored_turns: HashMap<MessageId, CensoredTurn>,
    /// Sources gathered by the running send, keyed by its handle id.
    current_sources: Option<(uuid::Uuid, Vec<Source>)>,
    revision: u64,
}

impl SessionState {
    /// Copy of the conversation for the store, stamped with a revision that
    /// grows with every snapshot taken under the lock.
    fn snapshot(&mut self) -> Snapshot {
        self.revision += 1;
        Snapshot {
            revision: self.revision,
            conversation: self.conversation.clone(),
        }
    }
}

struct Snapshot {
    revision: u64,
    conversation: Conversation,
}

/// The coordinating lock for one conversation.  Every mutation of its
/// messages happens while holding it.
struct Session {
    state: Mutex<SessionState>,
    /// Revision of the last snapshot handed to the store.
    saved: Mutex<u64>,
}

impl Session {
    fn new(conversation: Conversation) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                conversation,
                live: None,
                censored_turns: HashMap::new(),
                current_sources: None,
                revision: 0,
            }),
            saved: Mutex::new(0),
        })
    }
}

enum Streamed {
    Done(String),
    Cancelled,
}

#[derive(Clone, Copy)]
enum Attempt {
    Send,
    Regenerate,
}

struct Job {
    handle: GenerationHandle,
    completion: Completion,
    prompt: String,
    sources: Vec<Source>,
    history: Vec<Message>,
    attempt: Attempt,
}

// -- Orchestrator -----------------------------------------------------------

/// Owns per-conversation generation state, picks a backend for each turn,
/// drives the token stream into the live message and classifies the result.
#[derive(Clone)]
pub struct GenerationOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: OrchestratorSettings,
    backends: Backends,
    augmenter: Option<SourceAugmenter>,
    store: Arc<dyn ConversationStore>,
    sessions: Mutex<HashMap<ConversationId, Arc<Session>>>,
    events: broadcast::Sender<ConversationEvent>,
}

impl GenerationOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        backends: Backends,
        search: Option<Arc<dyn SearchClient>>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        let augmenter = search.map(|client| {
            SourceAugmenter::new(client, settings.search_max_results, settings.search_fetch_top)
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            backends = ?backends.list(),
            search = settings.search_enabled && augmenter.is_some(),
            local_enabled = settings.local_enabled,
            handshake_enabled = settings.handshake_enabled,
            "generation orchestrator ready"
        );

        Self {
            inner: Arc::new(Inner {
                settings,
                backends,
                augmenter,
                store,
                sessions: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn backends(&self) -> &Backends {
        &self.inner.backends
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    // -- Conversation management --

    pub async fn create_conversation(&self, title: &str) -> ConversationId {
        self.open_conversation(Conversation::new(title)).await
    }

    /// Adopt an existing conversation.  Replaces any open copy with the same id.
    pub async fn open_conversation(&self, conversation: Conversation) -> ConversationId {
        let id = conversation.id;
        self.inner.persist(&conversation).await;
        self.inner.sessions.lock().await.insert(id, Session::new(conversation));
        debug!(conversation = %id, "conversation opened");
        id
    }

    pub async fn load_conversation(&self, id: ConversationId) -> Result<ConversationId> {
        if self.inner.session(id).await.is_some() {
            return Ok(id);
        }
        let conversation = self
            .inner
            .store
            .load(id)
            .await?
            .ok_or(ParleyError::ConversationNotFound(id))?;
        self.inner
            .sessions
            .lock()
            .await
            .insert(id, Session::new(conversation));
        info!(conversation = %id, "conversation loaded from store");
        Ok(id)
    }

    /// Snapshot of the conversation.
    pub async fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        let session = self.inner.session(id).await?;
        let state = session.state.lock().await;
        Some(state.conversation.clone())
    }

    pub async fn is_generating(&self, id: ConversationId) -> bool {
        match self.inner.session(id).await {
            Some(session) => session.state.lock().await.live.is_some(),
            None => false,
        }
    }

    // -- Generation --

    /// Start answering `prompt`.  Returns `None` without touching the
    /// conversation when the prompt is blank or a generation is already live.
    pub async fn send(&self, id: ConversationId, prompt: &str) -> Option<GenerationHandle> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return None;
        }
        let Some(session) = self.inner.session(id).await else {
            warn!(conversation = %id, "send to unknown conversation");
            return None;
        };

        let backend = self.inner.select_backend();

        let (job, user, assistant, snapshot) = {
            let mut state = session.state.lock().await;
            if state.live.is_some() {
                debug!(conversation = %id, "generation already in flight, ignoring send");
                return None;
            }

            let history = state.conversation.recent(self.inner.settings.history_window);
            let user = Message::user(prompt);
            let assistant = Message::assistant("");
            state.conversation.push(user.clone());
            state.conversation.push(assistant.clone());

            let (handle, completion) = GenerationHandle::new(id, assistant.id, backend);
            state.live = Some(Live {
                handle_id: handle.id,
                message_id: assistant.id,
                cancel: handle.token().clone(),
            });

            let job = Job {
                handle,
                completion,
                prompt: prompt.to_string(),
                sources: Vec::new(),
                history,
                attempt: Attempt::Send,
            };
            (job, user, assistant, state.snapshot())
        };

        self.inner.publish_message(id, user);
        self.inner.publish_message(id, assistant);
        self.inner.persist_snapshot(&session, snapshot).await;

        info!(conversation = %id, backend = %backend, prompt_len = prompt.len(), "generation started");

        let handle = job.handle.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(session, job).await });
        Some(handle)
    }

    /// Signal the live generation to stop.  Returns whether one existed.
    pub async fn cancel(&self, id: ConversationId) -> bool {
        let Some(session) = self.inner.session(id).await else {
            return false;
        };
        let mut state = session.state.lock().await;
        match state.live.take() {
            Some(live) => {
                live.cancel.cancel();
                info!(conversation = %id, message = %live.message_id, "generation cancelled");
                true
            }
            None => false,
        }
    }

    /// Replace an assistant turn with a reply from `backend`, superseding
    /// any live generation.
    pub async fn regenerate(
        &self,
        id: ConversationId,
        message_id: MessageId,
        backend: BackendKind,
    ) -> Result<GenerationHandle> {
        let session = self
            .inner
            .session(id)
            .await
            .ok_or(ParleyError::ConversationNotFound(id))?;

        let (job, cleared) = {
            let mut state = session.state.lock().await;
            let index = state
                .conversation
                .assistant_position(message_id)
                .ok_or(ParleyError::TargetNotFound(message_id))?;

            if let Some(previous) = state.live.take() {
                previous.cancel.cancel();
                debug!(conversation = %id, message = %previous.message_id, "superseding live generation");
            }

            let (prompt, sources) = match state.censored_turns.get(&message_id) {
                Some(turn) => (turn.prompt.clone(), turn.sources.clone()),
                None => (
                    state
                        .conversation
                        .prompt_before(index)
                        .map(|m| m.text.clone())
                        .unwrap_or_default(),
                    Vec::new(),
                ),
            };
            let history = history_before(
                &state.conversation.messages[..index],
                self.inner.settings.history_window,
            );

            let message = &mut state.conversation.messages[index];
            message.text.clear();
            message.sources.clear();
            message.censored = Some(true);
            let cleared = message.clone();

            let (handle, completion) = GenerationHandle::new(id, message_id, backend);
            state.live = Some(Live {
                handle_id: handle.id,
                message_id,
                cancel: handle.token().clone(),
            });

            (
                Job {
                    handle,
                    completion,
                    prompt,
                    sources,
                    history,
                    attempt: Attempt::Regenerate,
                },
                cleared,
            )
        };

        self.inner.publish_message(id, cleared);
        info!(conversation = %id, message = %message_id, backend = %backend, "regeneration started");

        let handle = job.handle.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(session, job).await });
        Ok(handle)
    }

    /// Drop a failed or unanswered last turn and send its prompt again.
    pub async fn retry_last(&self, id: ConversationId) -> Option<GenerationHandle> {
        let session = self.inner.session(id).await?;

        let (prompt, snapshot) = {
            let mut state = session.state.lock().await;
            if state.live.is_some() {
                return None;
            }
            let messages = &mut state.conversation.messages;
            if messages.last().is_some_and(Message::is_error) {
                messages.pop();
            }
            match messages.last() {
                Some(m) if m.role == Role::User => {}
                _ => return None,
            }
            let prompt = messages.pop().map(|m| m.text)?;
            (prompt, state.snapshot())
        };

        self.inner.persist_snapshot(&session, snapshot).await;
        debug!(conversation = %id, "retrying last prompt");
        self.send(id, &prompt).await
    }
}

/// Last `n` non-empty turns before the prompt being answered.
fn history_before(messages: &[Message], n: usize) -> Vec<Message> {
    let end = match messages.last() {
        Some(m) if m.role == Role::User => messages.len() - 1,
        _ => messages.len(),
    };
    let filled: Vec<&Message> = messages[..end]
        .iter()
        .filter(|m| !m.text.trim().is_empty())
        .collect();
    let skip = filled.len().saturating_sub(n);
    filled.into_iter().skip(skip).cloned().collect()
}

impl Inner {
    async fn session(&self, id: ConversationId) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(&id).cloned()
    }

    /// First enabled and available backend in priority order.
    fn select_backend(&self) -> BackendKind {
        let ready = |kind: BackendKind| self.backends.get(kind).is_some_and(|a| a.is_available());

        if self.settings.local_enabled && ready(BackendKind::LocalRuntime) {
            BackendKind::LocalRuntime
        } else if self.settings.handshake_enabled && ready(BackendKind::CloudHandshake) {
            BackendKind::CloudHandshake
        } else {
            BackendKind::OnDevice
        }
    }

    fn publish(&self, event: ConversationEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn publish_message(&self, conversation_id: ConversationId, message: Message) {
        self.publish(ConversationEvent::MessageUpdated {
            conversation_id,
            message,
        });
    }

    async fn persist(&self, conversation: &Conversation) {
        if let Err(e) = self.store.save(conversation).await {
            warn!(conversation = %conversation.id, error = %e, "failed to persist conversation");
        }
    }

    /// Save a session snapshot unless a newer one already reached the store.
    async fn persist_snapshot(&self, session: &Session, snapshot: Snapshot) {
        let mut saved = session.saved.lock().await;
        if snapshot.revision <= *saved {
            debug!(
                conversation = %snapshot.conversation.id,
                revision = snapshot.revision,
                saved = *saved,
                "skipping stale snapshot"
            );
            return;
        }
        self.persist(&snapshot.conversation).await;
        *saved = snapshot.revision;
    }

    async fn run(&self, session: Arc<Session>, job: Job) {
        let input = match job.attempt {
            Attempt::Send => {
                let (input, sources) = self.augment(&job.prompt, job.handle.token()).await;
                let mut state = session.state.lock().await;
                if state.live.as_ref().is_some_and(|l| l.handle_id == job.handle.id) {
                    state.current_sources = Some((job.handle.id, sources));
                }
                input
            }
            Attempt::Regenerate if job.sources.is_empty() => job.prompt.clone(),
            Attempt::Regenerate => {
                build_augmented_prompt(&job.prompt, &job.sources, &HashMap::new())
            }
        };

        let result = self.stream_into(&session, &job, input).await;
        self.finish(&session, job, result).await;
    }

    /// Search augmentation; any failure leaves the prompt unchanged.
    async fn augment(
        &self,
        prompt: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> (String, Vec<Source>) {
        let Some(augmenter) = self.augmenter.as_ref() else {
            return (prompt.to_string(), Vec::new());
        };
        if !self.settings.search_enabled || !augmenter.is_configured() || cancel.is_cancelled() {
            return (prompt.to_string(), Vec::new());
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return (prompt.to_string(), Vec::new()),
            r = augmenter.augment(prompt) => r,
        };
        match result {
            Ok(a) => (a.prompt, a.sources),
            Err(e) => {
                warn!(error = %e, "search augmentation failed, using plain prompt");
                (prompt.to_string(), Vec::new())
            }
        }
    }

    /// Drive the adapter's stream into the target message.
    async fn stream_into(&self, session: &Session, job: &Job, input: String) -> Result<Streamed> {
        let handle = &job.handle;
        let cancel = handle.token();
        if cancel.is_cancelled() {
            return Ok(Streamed::Cancelled);
        }

        let adapter: Arc<dyn BackendAdapter> = self.backends.get(handle.backend).ok_or_else(|| {
            ParleyError::BackendUnavailable(format!("{} backend is not configured", handle.backend))
        })?;

        let request = GenerationRequest {
            conversation_snapshot: job.history.clone(),
            user_input: input,
            system_prompt: self.settings.system_prompt.clone(),
            backend: handle.backend,
            sampling: self.settings.sampling,
        };

        debug!(backend = adapter.name(), history = request.conversation_snapshot.len(), "invoking backend");

        let mut stream = adapter.generate(&request, cancel).await?;
        let mut text = String::new();
        let mut tokens = 0usize;

        while let Some(item) = stream.next().await {
            let token = item?;
            let mut state = session.state.lock().await;
            if cancel.is_cancelled() {
                return Ok(Streamed::Cancelled);
            }
            let Some(message) = state.conversation.message_mut(handle.message_id) else {
                return Ok(Streamed::Cancelled);
            };
            message.text.push_str(&token);
            text.push_str(&token);
            tokens += 1;
            let snapshot = message.clone();
            drop(state);
            self.publish_message(handle.conversation_id, snapshot);
        }

        if cancel.is_cancelled() {
            return Ok(Streamed::Cancelled);
        }
        if text.trim().is_empty() {
            return Err(ParleyError::EmptyResponse);
        }
        debug!(backend = adapter.name(), tokens, text_len = text.len(), "stream complete");
        Ok(Streamed::Done(text))
    }

    /// Classify, commit and persist the attempt, then release the live slot.
    async fn finish(&self, session: &Session, job: Job, result: Result<Streamed>) {
        let Job {
            handle,
            completion,
            prompt,
            sources,
            attempt,
            ..
        } = job;
        let conversation_id = handle.conversation_id;
        let mut notice = None;

        let (outcome, message, snapshot) = {
            let mut state = session.state.lock().await;
            if state.live.as_ref().is_some_and(|l| l.handle_id == handle.id) {
                state.live = None;
            }
            let sources = match attempt {
                Attempt::Send => state
                    .current_sources
                    .take_if(|(owner, _)| *owner == handle.id)
                    .map(|(_, sources)| sources)
                    .unwrap_or_default(),
                Attempt::Regenerate => sources,
            };

            // Nothing may change once the token has fired.
            let result = if handle.is_cancelled() {
                Ok(Streamed::Cancelled)
            } else {
                result
            };

            let outcome = match result {
                Ok(Streamed::Cancelled) => GenerationOutcome::Cancelled,
                Ok(Streamed::Done(text)) => {
                    let censored = match attempt {
                        Attempt::Send => censor::is_censored(&text),
                        Attempt::Regenerate => false,
                    };
                    if censored {
                        state.censored_turns.insert(
                            handle.message_id,
                            CensoredTurn {
                                prompt: prompt.clone(),
                                sources: sources.clone(),
                            },
                        );
                    } else {
                        state.censored_turns.remove(&handle.message_id);
                    }
                    if let Some(message) = state.conversation.message_mut(handle.message_id) {
                        message.censored = Some(censored);
                        if !censored {
                            message.sources = sources;
                        }
                    }
                    state.conversation.touch();
                    GenerationOutcome::Completed { censored }
                }
                Err(e) => {
                    warn!(
                        conversation = %conversation_id,
                        backend = %handle.backend,
                        error = %e,
                        "generation failed"
                    );
                    if let ParleyError::Timeout(detail) = &e {
                        notice = Some(detail.clone());
                    }
                    let text = e.display_text();
                    if let Some(message) = state.conversation.message_mut(handle.message_id) {
                        message.text = text.clone();
                    }
                    GenerationOutcome::Failed(text)
                }
            };

            let message = state.conversation.message(handle.message_id).cloned();
            (outcome, message, state.snapshot())
        };

        if let Some(message) = message {
            if outcome != GenerationOutcome::Cancelled {
                self.publish_message(conversation_id, message);
            }
        }
        if let Some(text) = notice {
            self.publish(ConversationEvent::Notice {
                conversation_id,
                text,
            });
        }

        self.persist_snapshot(session, snapshot).await;

        info!(
            conversation = %conversation_id,
            message = %handle.message_id,
            backend = %handle.backend,
            outcome = ?outcome,
            "generation finished"
        );

        self.publish(ConversationEvent::GenerationFinished {
            conversation_id,
            message_id: handle.message_id,
            outcome: outcome.clone(),
        });
        completion.finish(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TokenStream;
    use crate::store::SqliteStore;
    use async_stream::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    enum Reply {
        Tokens(Vec<&'static str>),
        Fail(ParleyError),
    }

    /// Adapter that plays back queued replies and records every request.
    struct Stub {
        kind: BackendKind,
        available: bool,
        replies: StdMutex<VecDeque<Reply>>,
        seen: StdMutex<Vec<GenerationRequest>>,
        gate: Option<Arc<Notify>>,
    }

    impl Stub {
        fn new(kind: BackendKind, replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: true,
                replies: StdMutex::new(replies.into()),
                seen: StdMutex::new(Vec::new()),
                gate: None,
            })
        }

        /// Holds every token after the first until the gate is notified.
        fn gated(kind: BackendKind, tokens: Vec<&'static str>, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: true,
                replies: StdMutex::new(vec![Reply::Tokens(tokens)].into()),
                seen: StdMutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        fn unavailable(kind: BackendKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available: false,
                replies: StdMutex::new(VecDeque::new()),
                seen: StdMutex::new(Vec::new()),
                gate: None,
            })
        }

        fn inputs(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|r| r.user_input.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl BackendAdapter for Stub {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn name(&self) -> &str {
            "stub"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn generate(
            &self,
            request: &GenerationRequest,
            _cancel: &CancellationToken,
        ) -> Result<TokenStream> {
            if !self.available {
                return Err(ParleyError::BackendUnavailable("stub offline".into()));
            }
            self.seen.lock().unwrap().push(request.clone());
            let reply = self.replies.lock().unwrap().pop_front();
            let tokens = match reply {
                Some(Reply::Tokens(tokens)) => tokens,
                Some(Reply::Fail(e)) => return Err(e),
                None => Vec::new(),
            };
            let gate = self.gate.clone();
            Ok(Box::pin(stream! {
                for (i, token) in tokens.into_iter().enumerate() {
                    if i == 1 {
                        if let Some(gate) = &gate {
                            gate.notified().await;
                        }
                    }
                    let item: Result<String> = Ok(token.to_string());
                    yield item;
                }
            }))
        }
    }

    struct SearchStub {
        fail: bool,
    }

    #[async_trait::async_trait]
    impl SearchClient for SearchStub {
        async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<Source>> {
            if self.fail {
                return Err(ParleyError::ServerError(503));
            }
            Ok(vec![Source::new(
                "Weather",
                "https://example.com/weather",
                Some("Sunny all week".into()),
            )])
        }

        async fn fetch_page_text(&self, _url: &str) -> Result<String> {
            Err(ParleyError::Timeout("page".into()))
        }

        fn has_api_key(&self) -> bool {
            true
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            system_prompt: "Be brief.".into(),
            ..OrchestratorSettings::default()
        }
    }

    fn build(
        settings: OrchestratorSettings,
        backends: Backends,
        search: Option<Arc<dyn SearchClient>>,
    ) -> (GenerationOrchestrator, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let orch = GenerationOrchestrator::new(settings, backends, search, store.clone());
        (orch, store)
    }

    async fn wait_for_text(rx: &mut broadcast::Receiver<ConversationEvent>, text: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(ConversationEvent::MessageUpdated { message, .. }) = rx.recv().await {
                    if message.text == text {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap();
    }

    const REFUSAL: &str = "I'm sorry, but I cannot assist with that request.";

    #[tokio::test]
    async fn hello_streams_into_assistant_turn() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["Hi", " there"])]);
        let (orch, store) = build(settings(), Backends::new().with(device.clone()), None);
        let id = orch.create_conversation("Greetings").await;

        let handle = orch.send(id, "hello").await.unwrap();
        assert_eq!(handle.backend, BackendKind::OnDevice);
        assert_eq!(handle.finished().await, GenerationOutcome::Completed { censored: false });

        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages.len(), 2);
        assert_eq!(c.messages[0].text, "hello");
        assert_eq!(c.messages[1].text, "Hi there");
        assert_eq!(c.messages[1].censored, Some(false));
        assert_eq!(device.inputs(), vec!["hello"]);
        assert!(!orch.is_generating(id).await);

        let stored = store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.messages[1].text, "Hi there");
    }

    #[tokio::test]
    async fn every_token_is_published_in_order() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["a", "b", "c"])]);
        let (orch, _) = build(settings(), Backends::new().with(device), None);
        let id = orch.create_conversation("").await;
        let mut rx = orch.subscribe();

        let handle = orch.send(id, "go").await.unwrap();
        handle.finished().await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ConversationEvent::MessageUpdated { message, .. } = event {
                if message.id == handle.message_id {
                    seen.push(message.text);
                }
            }
        }
        // empty placeholder, one per token, final classified copy
        assert_eq!(seen, vec!["", "a", "ab", "abc", "abc"]);
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected() {
        let device = Stub::new(BackendKind::OnDevice, vec![]);
        let (orch, _) = build(settings(), Backends::new().with(device), None);
        let id = orch.create_conversation("").await;
        assert!(orch.send(id, "   \n").await.is_none());
        assert!(orch.conversation(id).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn refusal_then_regenerate_with_remote() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec![REFUSAL])]);
        let remote = Stub::new(
            BackendKind::RemoteApi,
            vec![Reply::Tokens(vec!["Sure, ", "here's ", "an ", "answer."])],
        );
        let backends = Backends::new().with(device).with(remote.clone());
        let (orch, _) = build(settings(), backends, None);
        let id = orch.create_conversation("").await;

        let handle = orch.send(id, "restricted").await.unwrap();
        assert_eq!(handle.finished().await, GenerationOutcome::Completed { censored: true });
        let c = orch.conversation(id).await.unwrap();
        assert!(c.messages[1].is_censored());

        let regen = orch
            .regenerate(id, handle.message_id, BackendKind::RemoteApi)
            .await
            .unwrap();
        assert_eq!(regen.message_id, handle.message_id);
        assert_eq!(regen.finished().await, GenerationOutcome::Completed { censored: false });

        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages.len(), 2);
        assert_eq!(c.messages[1].text, "Sure, here's an answer.");
        assert_eq!(c.messages[1].censored, Some(false));
        assert_eq!(remote.inputs(), vec!["restricted"]);
    }

    #[tokio::test]
    async fn regenerate_unknown_message_changes_nothing() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["fine"])]);
        let (orch, _) = build(settings(), Backends::new().with(device), None);
        let id = orch.create_conversation("").await;
        let handle = orch.send(id, "q").await.unwrap();
        handle.finished().await;
        let before = orch.conversation(id).await.unwrap();

        let missing = MessageId::new();
        let err = orch
            .regenerate(id, missing, BackendKind::RemoteApi)
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::TargetNotFound(m) if m == missing));

        // user turns are not valid targets either
        let user_id = before.messages[0].id;
        assert!(orch.regenerate(id, user_id, BackendKind::RemoteApi).await.is_err());

        assert_eq!(orch.conversation(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn send_while_live_is_a_no_op() {
        let gate = Arc::new(Notify::new());
        let device = Stub::gated(BackendKind::OnDevice, vec!["partial", " rest"], gate.clone());
        let (orch, _) = build(settings(), Backends::new().with(device), None);
        let id = orch.create_conversation("").await;
        let mut rx = orch.subscribe();

        let handle = orch.send(id, "first").await.unwrap();
        wait_for_text(&mut rx, "partial").await;
        assert!(orch.is_generating(id).await);

        assert!(orch.send(id, "second").await.is_none());
        assert_eq!(orch.conversation(id).await.unwrap().messages.len(), 2);

        gate.notify_one();
        assert_eq!(handle.finished().await, GenerationOutcome::Completed { censored: false });
        assert_eq!(orch.conversation(id).await.unwrap().messages[1].text, "partial rest");
    }

    #[tokio::test]
    async fn cancel_keeps_partial_text_and_drops_late_tokens() {
        let gate = Arc::new(Notify::new());
        let device = Stub::gated(BackendKind::OnDevice, vec!["partial", " late"], gate.clone());
        let (orch, store) = build(settings(), Backends::new().with(device), None);
        let id = orch.create_conversation("").await;
        let mut rx = orch.subscribe();

        let handle = orch.send(id, "go").await.unwrap();
        wait_for_text(&mut rx, "partial").await;

        assert!(orch.cancel(id).await);
        assert!(!orch.cancel(id).await);
        assert!(handle.is_cancelled());
        gate.notify_one();

        assert_eq!(handle.finished().await, GenerationOutcome::Cancelled);
        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages[1].text, "partial");
        assert_eq!(c.messages[1].censored, None);
        assert_eq!(store.load(id).await.unwrap().unwrap().messages[1].text, "partial");
    }

    #[tokio::test]
    async fn regenerate_supersedes_live_generation() {
        let gate = Arc::new(Notify::new());
        let device = Stub::gated(BackendKind::OnDevice, vec!["slow", " tail"], gate.clone());
        let remote = Stub::new(BackendKind::RemoteApi, vec![Reply::Tokens(vec!["fast"])]);
        let (orch, _) = build(settings(), Backends::new().with(device).with(remote), None);
        let id = orch.create_conversation("").await;
        let mut rx = orch.subscribe();

        let first = orch.send(id, "q").await.unwrap();
        wait_for_text(&mut rx, "slow").await;

        let regen = orch
            .regenerate(id, first.message_id, BackendKind::RemoteApi)
            .await
            .unwrap();
        assert!(first.is_cancelled());
        assert_eq!(regen.finished().await, GenerationOutcome::Completed { censored: false });

        gate.notify_one();
        assert_eq!(first.finished().await, GenerationOutcome::Cancelled);
        assert_eq!(orch.conversation(id).await.unwrap().messages[1].text, "fast");
    }

    #[tokio::test]
    async fn adapter_failure_becomes_error_text() {
        let device = Stub::unavailable(BackendKind::OnDevice);
        let (orch, store) = build(settings(), Backends::new().with(device), None);
        let id = orch.create_conversation("").await;

        let handle = orch.send(id, "hello").await.unwrap();
        let outcome = handle.finished().await;
        assert!(matches!(outcome, GenerationOutcome::Failed(ref t) if t.starts_with("Error: ")));

        let c = orch.conversation(id).await.unwrap();
        assert!(c.messages[1].is_error());
        assert_eq!(c.messages[1].censored, None);
        assert!(store.load(id).await.unwrap().unwrap().messages[1].is_error());
    }

    #[tokio::test]
    async fn missing_adapter_becomes_error_text() {
        let (orch, _) = build(settings(), Backends::new(), None);
        let id = orch.create_conversation("").await;
        let handle = orch.send(id, "hello").await.unwrap();
        assert!(matches!(handle.finished().await, GenerationOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn empty_stream_is_empty_response() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["  "])]);
        let (orch, _) = build(settings(), Backends::new().with(device), None);
        let id = orch.create_conversation("").await;
        let handle = orch.send(id, "hello").await.unwrap();
        handle.finished().await;
        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages[1].text, ParleyError::EmptyResponse.display_text());
    }

    #[tokio::test]
    async fn failed_regeneration_keeps_censored_flag() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec![REFUSAL])]);
        let remote = Stub::new(
            BackendKind::RemoteApi,
            vec![Reply::Fail(ParleyError::GenerationFailed("quota".into()))],
        );
        let (orch, _) = build(settings(), Backends::new().with(device).with(remote), None);
        let id = orch.create_conversation("").await;
        let handle = orch.send(id, "restricted").await.unwrap();
        handle.finished().await;

        let regen = orch
            .regenerate(id, handle.message_id, BackendKind::RemoteApi)
            .await
            .unwrap();
        regen.finished().await;
        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages[1].text, "Error: quota");
        assert!(c.messages[1].is_censored());
    }

    #[tokio::test]
    async fn timeout_publishes_notice() {
        let handshake = Stub::new(
            BackendKind::CloudHandshake,
            vec![Reply::Fail(ParleyError::Timeout(
                crate::handshake::NOT_RUNNING.into(),
            ))],
        );
        let device = Stub::new(BackendKind::OnDevice, vec![]);
        let settings = OrchestratorSettings {
            handshake_enabled: true,
            ..settings()
        };
        let (orch, _) = build(settings, Backends::new().with(handshake).with(device), None);
        let id = orch.create_conversation("").await;
        let mut rx = orch.subscribe();

        let handle = orch.send(id, "hello").await.unwrap();
        assert_eq!(handle.backend, BackendKind::CloudHandshake);
        handle.finished().await;

        let mut notices = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ConversationEvent::Notice { text, .. } = event {
                notices.push(text);
            }
        }
        assert_eq!(notices, vec![crate::handshake::NOT_RUNNING.to_string()]);
        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages[1].text, "Error: shortcut not installed or not running");
    }

    #[tokio::test]
    async fn retry_last_resends_failed_prompt() {
        let device = Stub::new(
            BackendKind::OnDevice,
            vec![
                Reply::Fail(ParleyError::GenerationFailed("flaky".into())),
                Reply::Tokens(vec!["ok"]),
            ],
        );
        let (orch, _) = build(settings(), Backends::new().with(device.clone()), None);
        let id = orch.create_conversation("").await;

        orch.send(id, "try me").await.unwrap().finished().await;
        assert!(orch.conversation(id).await.unwrap().messages[1].is_error());

        let retry = orch.retry_last(id).await.unwrap();
        assert_eq!(retry.finished().await, GenerationOutcome::Completed { censored: false });

        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages.len(), 2);
        assert_eq!(c.messages[0].text, "try me");
        assert_eq!(c.messages[1].text, "ok");
        assert_eq!(device.inputs(), vec!["try me", "try me"]);

        // nothing left to retry
        assert!(orch.retry_last(id).await.is_none());
    }

    #[tokio::test]
    async fn history_window_limits_snapshot() {
        let device = Stub::new(
            BackendKind::OnDevice,
            vec![
                Reply::Tokens(vec!["one"]),
                Reply::Tokens(vec!["two"]),
                Reply::Tokens(vec!["three"]),
            ],
        );
        let settings = OrchestratorSettings {
            history_window: 2,
            ..settings()
        };
        let (orch, _) = build(settings, Backends::new().with(device.clone()), None);
        let id = orch.create_conversation("").await;
        for prompt in ["a", "b", "c"] {
            orch.send(id, prompt).await.unwrap().finished().await;
        }

        let seen = device.seen.lock().unwrap();
        assert!(seen[0].conversation_snapshot.is_empty());
        let last: Vec<&str> = seen[2]
            .conversation_snapshot
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(last, vec!["b", "two"]);
        assert_eq!(seen[2].system_prompt, "Be brief.");
    }

    #[tokio::test]
    async fn search_augments_prompt_and_attaches_sources() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["Sunny."])]);
        let settings = OrchestratorSettings {
            search_enabled: true,
            ..settings()
        };
        let search: Arc<dyn SearchClient> = Arc::new(SearchStub { fail: false });
        let (orch, _) = build(settings, Backends::new().with(device.clone()), Some(search));
        let id = orch.create_conversation("").await;

        orch.send(id, "weather?").await.unwrap().finished().await;

        let input = &device.inputs()[0];
        assert!(input.starts_with("weather?"));
        assert!(input.contains("CONTEXT FROM WEB SEARCH"));
        assert!(input.contains("Snippet: Sunny all week"));

        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages[0].text, "weather?");
        assert_eq!(c.messages[1].sources.len(), 1);
        assert_eq!(c.messages[1].sources[0].url, "https://example.com/weather");
    }

    #[tokio::test]
    async fn cancelled_send_leaves_next_sends_sources_alone() {
        let gate = Arc::new(Notify::new());
        let device = Stub::gated(BackendKind::OnDevice, vec!["Part", "Rest"], gate.clone());
        device
            .replies
            .lock()
            .unwrap()
            .push_back(Reply::Tokens(vec!["sunny", " all week"]));
        let settings = OrchestratorSettings {
            search_enabled: true,
            ..settings()
        };
        let search: Arc<dyn SearchClient> = Arc::new(SearchStub { fail: false });
        let (orch, _) = build(settings, Backends::new().with(device), Some(search));
        let id = orch.create_conversation("").await;
        let mut rx = orch.subscribe();

        let first = orch.send(id, "weather?").await.unwrap();
        wait_for_text(&mut rx, "Part").await;
        assert!(orch.cancel(id).await);

        let second = orch.send(id, "weather again?").await.unwrap();
        wait_for_text(&mut rx, "sunny").await;

        // The cancelled send wraps up while the second one is still streaming.
        gate.notify_one();
        let outcome = tokio::time::timeout(Duration::from_secs(5), first.finished())
            .await
            .unwrap();
        assert_eq!(outcome, GenerationOutcome::Cancelled);

        gate.notify_one();
        assert_eq!(second.finished().await, GenerationOutcome::Completed { censored: false });

        let c = orch.conversation(id).await.unwrap();
        assert!(c.messages[1].sources.is_empty());
        assert_eq!(c.messages[3].text, "sunny all week");
        assert_eq!(c.messages[3].sources.len(), 1);

        let session = orch.inner.session(id).await.unwrap();
        assert!(session.state.lock().await.current_sources.is_none());
    }

    #[tokio::test]
    async fn stale_snapshot_never_overwrites_newer_save() {
        let (orch, store) = build(settings(), Backends::new(), None);
        let id = orch.create_conversation("").await;
        let session = orch.inner.session(id).await.unwrap();

        let (older, newer) = {
            let mut state = session.state.lock().await;
            state.conversation.push(Message::user("first"));
            let older = state.snapshot();
            state.conversation.push(Message::assistant("second"));
            (older, state.snapshot())
        };
        orch.inner.persist_snapshot(&session, newer).await;
        orch.inner.persist_snapshot(&session, older).await;

        let stored = store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(stored.messages[1].text, "second");
    }

    #[tokio::test]
    async fn search_failure_is_swallowed() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["fine"])]);
        let settings = OrchestratorSettings {
            search_enabled: true,
            ..settings()
        };
        let search: Arc<dyn SearchClient> = Arc::new(SearchStub { fail: true });
        let (orch, _) = build(settings, Backends::new().with(device.clone()), Some(search));
        let id = orch.create_conversation("").await;

        let handle = orch.send(id, "hello").await.unwrap();
        assert_eq!(handle.finished().await, GenerationOutcome::Completed { censored: false });
        assert_eq!(device.inputs(), vec!["hello"]);
        assert!(orch.conversation(id).await.unwrap().messages[1].sources.is_empty());
    }

    #[tokio::test]
    async fn censored_turn_keeps_sources_for_regeneration() {
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec![REFUSAL])]);
        let remote = Stub::new(BackendKind::RemoteApi, vec![Reply::Tokens(vec!["Sunny."])]);
        let settings = OrchestratorSettings {
            search_enabled: true,
            ..settings()
        };
        let search: Arc<dyn SearchClient> = Arc::new(SearchStub { fail: false });
        let backends = Backends::new().with(device).with(remote.clone());
        let (orch, _) = build(settings, backends, Some(search));
        let id = orch.create_conversation("").await;

        let handle = orch.send(id, "weather?").await.unwrap();
        handle.finished().await;
        let c = orch.conversation(id).await.unwrap();
        assert!(c.messages[1].is_censored());
        assert!(c.messages[1].sources.is_empty());

        orch.regenerate(id, handle.message_id, BackendKind::RemoteApi)
            .await
            .unwrap()
            .finished()
            .await;

        let input = &remote.inputs()[0];
        assert!(input.starts_with("weather?"));
        assert!(input.contains("https://example.com/weather"));
        let c = orch.conversation(id).await.unwrap();
        assert_eq!(c.messages[1].sources.len(), 1);
        assert_eq!(c.messages[1].censored, Some(false));
    }

    #[tokio::test]
    async fn selection_prefers_enabled_local_then_handshake() {
        let local = Stub::new(BackendKind::LocalRuntime, vec![Reply::Tokens(vec!["l"])]);
        let shortcut = Stub::new(BackendKind::CloudHandshake, vec![Reply::Tokens(vec!["s"])]);
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["d"])]);
        let backends = Backends::new()
            .with(local)
            .with(shortcut)
            .with(device);

        // nothing enabled: on-device even though others are available
        let (orch, _) = build(settings(), backends.clone(), None);
        let id = orch.create_conversation("").await;
        assert_eq!(orch.send(id, "x").await.unwrap().backend, BackendKind::OnDevice);

        let (orch, _) = build(
            OrchestratorSettings {
                handshake_enabled: true,
                ..settings()
            },
            backends.clone(),
            None,
        );
        let id = orch.create_conversation("").await;
        assert_eq!(orch.send(id, "x").await.unwrap().backend, BackendKind::CloudHandshake);

        let (orch, _) = build(
            OrchestratorSettings {
                handshake_enabled: true,
                local_enabled: true,
                ..settings()
            },
            backends,
            None,
        );
        let id = orch.create_conversation("").await;
        assert_eq!(orch.send(id, "x").await.unwrap().backend, BackendKind::LocalRuntime);
    }

    #[tokio::test]
    async fn unavailable_local_falls_through() {
        let local = Stub::unavailable(BackendKind::LocalRuntime);
        let device = Stub::new(BackendKind::OnDevice, vec![Reply::Tokens(vec!["d"])]);
        let settings = OrchestratorSettings {
            local_enabled: true,
            ..settings()
        };
        let (orch, _) = build(settings, Backends::new().with(local).with(device), None);
        let id = orch.create_conversation("").await;
        assert_eq!(orch.send(id, "x").await.unwrap().backend, BackendKind::OnDevice);
    }

    #[tokio::test]
    async fn load_conversation_from_store() {
        let device = Stub::new(BackendKind::OnDevice, vec![]);
        let (orch, store) = build(settings(), Backends::new().with(device), None);

        let mut saved = Conversation::new("Earlier");
        saved.push(Message::user("hi"));
        store.save(&saved).await.unwrap();

        assert_eq!(orch.load_conversation(saved.id).await.unwrap(), saved.id);
        assert_eq!(orch.conversation(saved.id).await.unwrap().messages.len(), 1);

        let unknown = ConversationId::new();
        let err = orch.load_conversation(unknown).await.unwrap_err();
        assert!(matches!(err, ParleyError::ConversationNotFound(c) if c == unknown));
        assert!(orch.send(unknown, "hi").await.is_none());
    }
}
