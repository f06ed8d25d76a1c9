pub mod context;
pub mod prompts;
pub mod typing;

mod gemini;
mod local;
mod ollama;
mod on_device;
mod shortcut;
#[cfg(feature = "local")]
mod gguf;

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

pub use context::{GenerationRequest, SamplingParams};
pub use gemini::GeminiAdapter;
#[cfg(feature = "local")]
pub use gguf::GgufRuntime;
pub use local::{InferenceOptions, InferenceRuntime, LoadedModel, LocalRuntimeAdapter, ModelSpec, ModelType};
pub use ollama::OllamaSession;
pub use on_device::{LanguageModelSession, OnDeviceAdapter};
pub use shortcut::ShortcutAdapter;

/// Lazy, finite sequence of generated text fragments.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

// -- Backend kinds ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Embedded quantized-model runtime.
    LocalRuntime,
    /// External automation tool reached through the file handshake.
    CloudHandshake,
    /// Platform language-model session.
    OnDevice,
    /// Remote cloud API.
    RemoteApi,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::LocalRuntime,
        BackendKind::CloudHandshake,
        BackendKind::OnDevice,
        BackendKind::RemoteApi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LocalRuntime => "local",
            BackendKind::CloudHandshake => "shortcut",
            BackendKind::OnDevice => "on-device",
            BackendKind::RemoteApi => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "local-runtime" => Some(BackendKind::LocalRuntime),
            "shortcut" | "handshake" | "cloud-handshake" => Some(BackendKind::CloudHandshake),
            "on-device" | "ondevice" | "device" => Some(BackendKind::OnDevice),
            "remote" | "remote-api" | "gemini" => Some(BackendKind::RemoteApi),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -- Adapter trait ----------------------------------------------------------

/// Uniform streaming-generate contract over one inference path.
///
/// Implementations must check prerequisites before any I/O and report
/// `BackendUnavailable`, surface downstream failures as `GenerationFailed`,
/// and end the stream quietly (no error) once `cancel` fires.
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Human-readable name (e.g. "Gemini API").
    fn name(&self) -> &str;

    /// Cheap capability query used during backend selection.
    fn is_available(&self) -> bool;

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream>;
}

/// Stop forwarding items from `inner` as soon as `cancel` fires.  Items that
/// arrive after the signal are dropped.
pub fn until_cancelled(inner: TokenStream, cancel: CancellationToken) -> TokenStream {
    Box::pin(stream! {
        let mut inner = inner;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = inner.next() => item,
            };
            match next {
                Some(item) if !cancel.is_cancelled() => {
                    yield item;
                }
                _ => break,
            }
        }
    })
}

// -- Registry ---------------------------------------------------------------

/// One adapter per backend kind, built once at startup and injected into the
/// orchestrator.
#[derive(Clone, Default)]
pub struct Backends {
    adapters: HashMap<BackendKind, Arc<dyn BackendAdapter>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        info!(backend = %adapter.kind(), name = adapter.name(), "backend registered");
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn BackendAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Registered kinds in priority order.
    pub fn list(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|k| self.adapters.contains_key(k))
            .collect()
    }

    /// Registered kinds whose prerequisites are currently met.
    pub fn available(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .into_iter()
            .filter(|k| self.adapters.get(k).is_some_and(|a| a.is_available()))
            .collect()
    }
}
