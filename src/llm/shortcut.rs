use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ParleyError, Result};
use crate::handshake::HandshakeChannel;
use crate::llm::typing::typing_effect;
use crate::llm::{prompts, BackendAdapter, BackendKind, GenerationRequest, TokenStream};

/// Routes a prompt through the external automation tool and replays the
/// single reply with the typing effect.
pub struct ShortcutAdapter {
    channel: Arc<HandshakeChannel>,
    typing_delay: Duration,
}

impl ShortcutAdapter {
    pub fn new(channel: Arc<HandshakeChannel>, typing_delay: Duration) -> Self {
        Self {
            channel,
            typing_delay,
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for ShortcutAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudHandshake
    }

    fn name(&self) -> &str {
        "shortcut handshake"
    }

    fn is_available(&self) -> bool {
        self.channel.is_enabled()
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenStream> {
        if !self.channel.is_enabled() {
            return Err(ParleyError::BackendUnavailable("shortcut handshake is disabled".into()));
        }

        let prompt = prompts::history_prefixed(request);
        debug!(prompt_len = prompt.len(), "sending prompt through handshake");

        match self.channel.run(&prompt, cancel).await? {
            Some(text) => Ok(typing_effect(text, self.typing_delay, cancel.clone())),
            None => Ok(Box::pin(futures::stream::empty())),
        }
    }
}
