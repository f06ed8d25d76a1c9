use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LocalConfig;
use crate::error::{ParleyError, Result};
use crate::llm::{prompts, until_cancelled, BackendAdapter, BackendKind, GenerationRequest, TokenStream};

// -- Runtime contract -------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Gemma3_1bQ4,
    Qwen4bQ4,
}

impl ModelType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemma3-1b-q4" | "gemma" => Some(ModelType::Gemma3_1bQ4),
            "qwen-4b-q4" | "qwen" => Some(ModelType::Qwen4bQ4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Gemma3_1bQ4 => "gemma3-1b-q4",
            ModelType::Qwen4bQ4 => "qwen-4b-q4",
        }
    }
}

/// What to load into the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub model_type: ModelType,
    pub path: PathBuf,
    pub context_size: u32,
}

impl ModelSpec {
    pub fn from_config(config: &LocalConfig) -> Result<Self> {
        let model_type = ModelType::parse(&config.model_type).ok_or_else(|| {
            ParleyError::Config(format!("unknown local model type \"{}\"", config.model_type))
        })?;
        if config.model_path.is_empty() {
            return Err(ParleyError::Config("local.model_path is empty".into()));
        }
        Ok(Self {
            model_type,
            path: PathBuf::from(&config.model_path),
            context_size: if config.context_size > 0 { config.context_size } else { 2048 },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
}

/// An embedded inference runtime.  Loading and generation are synchronous
/// and CPU/GPU bound; callers run them on the blocking pool.
pub trait InferenceRuntime: Send + Sync {
    fn init(&self, spec: &ModelSpec, progress: &mut dyn FnMut(f32)) -> Result<Box<dyn LoadedModel>>;
}

/// A model resident in the runtime.  Dropping it frees the model.
pub trait LoadedModel: Send {
    /// Run one completion over an OpenAI-style message array, invoking
    /// `on_token` for every generated fragment.  Cannot be interrupted.
    fn generate(
        &mut self,
        messages_json: &str,
        options: &InferenceOptions,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<()>;
}

// -- Adapter ----------------------------------------------------------------

struct Resident {
    spec: ModelSpec,
    model: Box<dyn LoadedModel>,
}

/// Adapter over the embedded runtime.
///
/// The loaded model is a single process-wide resource: the slot mutex is
/// held for the whole of a generation, so calls are serialized globally.
/// With an on-demand spec the first generation loads the model into the
/// empty slot.
pub struct LocalRuntimeAdapter {
    runtime: Arc<dyn InferenceRuntime>,
    slot: Arc<Mutex<Option<Resident>>>,
    ready: AtomicBool,
    on_demand: Option<ModelSpec>,
    stop_sequences: Vec<String>,
}

impl LocalRuntimeAdapter {
    pub fn new(runtime: Arc<dyn InferenceRuntime>) -> Self {
        Self {
            runtime,
            slot: Arc::new(Mutex::new(None)),
            ready: AtomicBool::new(false),
            on_demand: None,
            stop_sequences: Vec::new(),
        }
    }

    /// Load `spec` on the first generation if nothing is resident by then.
    pub fn with_on_demand(mut self, spec: ModelSpec) -> Self {
        self.on_demand = Some(spec);
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = stop;
        self
    }

    /// Load a model, releasing the current one first.
    pub async fn load_model<F>(&self, spec: ModelSpec, progress: F) -> Result<()>
    where
        F: FnMut(f32) + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        self.ready.store(false, Ordering::SeqCst);
        if let Some(previous) = slot.take() {
            info!(model = %previous.spec.path.display(), "releasing local model");
            drop(previous);
        }

        info!(
            model = %spec.path.display(),
            model_type = spec.model_type.as_str(),
            context_size = spec.context_size,
            "loading local model"
        );

        let model = self.init_blocking(spec.clone(), progress).await?;
        *slot = Some(Resident { spec, model });
        self.ready.store(true, Ordering::SeqCst);
        info!("local model loaded");
        Ok(())
    }

    async fn init_blocking<F>(&self, spec: ModelSpec, mut progress: F) -> Result<Box<dyn LoadedModel>>
    where
        F: FnMut(f32) + Send + 'static,
    {
        let runtime = Arc::clone(&self.runtime);
        tokio::task::spawn_blocking(move || runtime.init(&spec, &mut progress))
            .await
            .map_err(|e| ParleyError::GenerationFailed(format!("blocking task join error: {e}")))?
    }

    /// Free the resident model, if any.
    pub async fn unload(&self) {
        let mut slot = self.slot.lock().await;
        self.ready.store(false, Ordering::SeqCst);
        if let Some(previous) = slot.take() {
            info!(model = %previous.spec.path.display(), "local model unloaded");
        }
    }

    pub async fn loaded_spec(&self) -> Option<ModelSpec> {
        self.slot.lock().await.as_ref().map(|r| r.spec.clone())
    }
}

#[async_trait::async_trait]
impl BackendAdapter for LocalRuntimeAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalRuntime
    }

    fn name(&self) -> &str {
        "local runtime"
    }

    fn is_available(&self) -> bool {
        self.ready.load(Ordering::SeqCst) || self.on_demand.is_some()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream> {
        if !self.is_available() {
            return Err(ParleyError::BackendUnavailable("no local model loaded".into()));
        }

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Box::pin(futures::stream::empty())),
            guard = Arc::clone(&self.slot).lock_owned() => guard,
        };
        if guard.is_none() {
            let Some(spec) = self.on_demand.clone() else {
                return Err(ParleyError::BackendUnavailable("no local model loaded".into()));
            };
            info!(
                model = %spec.path.display(),
                model_type = spec.model_type.as_str(),
                "loading local model on demand"
            );
            let model = self
                .init_blocking(spec.clone(), |p| debug!(progress = p, "loading local model"))
                .await
                .map_err(|e| ParleyError::GenerationFailed(format!("failed to load local model: {e}")))?;
            *guard = Some(Resident { spec, model });
            self.ready.store(true, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Ok(Box::pin(futures::stream::empty()));
            }
        }

        let messages = prompts::chat_messages(request).to_string();
        let options = InferenceOptions {
            temperature: request.sampling.temperature,
            top_p: request.sampling.top_p,
            top_k: request.sampling.top_k,
            max_tokens: request.sampling.max_tokens,
            stop_sequences: self.stop_sequences.clone(),
        };

        debug!(messages_len = messages.len(), "starting local generation");

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<String>>();
        let stop = cancel.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = guard;
            let Some(resident) = guard.as_mut() else {
                let _ = tx.send(Err(ParleyError::BackendUnavailable("no local model loaded".into())));
                return;
            };

            let mut discarded = 0usize;
            let result = resident.model.generate(&messages, &options, &mut |token: &str| {
                if stop.is_cancelled() {
                    discarded += 1;
                    return;
                }
                let _ = tx.send(Ok(token.to_string()));
            });

            if discarded > 0 {
                debug!(discarded, "dropped tokens produced after cancellation");
            }
            if let Err(e) = result {
                warn!(error = %e, "local inference failed");
                let _ = tx.send(Err(ParleyError::GenerationFailed(format!(
                    "local inference failed: {e}"
                ))));
            }
        });

        Ok(until_cancelled(
            Box::pin(UnboundedReceiverStream::new(rx)),
            cancel.clone(),
        ))
    }
}
