use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ParleyError, Result};
use crate::llm::{until_cancelled, BackendAdapter, BackendKind, GenerationRequest, TokenStream};

/// A language-model session provided by the host platform.
///
/// Token boundaries are whatever the session emits; the adapter forwards
/// them unchanged.
#[async_trait::async_trait]
pub trait LanguageModelSession: Send + Sync {
    /// Whether the platform capability is present right now.
    fn is_available(&self) -> bool;

    async fn stream_response(&self, request: &GenerationRequest) -> Result<TokenStream>;
}

/// Adapter over the platform's on-device model.  The default backend.
pub struct OnDeviceAdapter {
    session: Option<Arc<dyn LanguageModelSession>>,
}

impl OnDeviceAdapter {
    pub fn new(session: Option<Arc<dyn LanguageModelSession>>) -> Self {
        Self { session }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for OnDeviceAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::OnDevice
    }

    fn name(&self) -> &str {
        "on-device model"
    }

    fn is_available(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_available())
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream> {
        let session = match &self.session {
            Some(s) if s.is_available() => s,
            _ => {
                return Err(ParleyError::BackendUnavailable(
                    "on-device language model is not available on this system".into(),
                ));
            }
        };

        if cancel.is_cancelled() {
            return Ok(Box::pin(futures::stream::empty()));
        }

        debug!(prompt_len = request.user_input.len(), "starting on-device session");

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Box::pin(futures::stream::empty())),
            s = session.stream_response(request) => s?,
        };

        Ok(until_cancelled(stream, cancel.clone()))
    }
}
