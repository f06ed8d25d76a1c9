use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HandshakeConfig;
use crate::error::{ParleyError, Result};

/// Notifications for the external watcher that services handshake requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeSignal {
    /// A prompt is waiting in `input`; the reply is expected in `output`.
    Requested {
        id: Uuid,
        shortcut: String,
        input: PathBuf,
        output: PathBuf,
    },
    /// Nobody answered request `id` within the budget.
    TimedOut { id: Uuid },
}

/// File-based request/response rendezvous with an external automation tool.
///
/// The prompt is written to `request-<id>.txt` in the shared directory and
/// the reply is polled for in `response-<id>.txt`.  Without a usable shared
/// directory the tool's command-line runner is invoked directly.
pub struct HandshakeChannel {
    enabled: bool,
    shared_dir: Option<PathBuf>,
    shortcut: String,
    cli_bin: String,
    poll_interval: Duration,
    budget: Duration,
    signals: mpsc::UnboundedSender<HandshakeSignal>,
}

pub const NOT_RUNNING: &str = "shortcut not installed or not running";

impl HandshakeChannel {
    pub fn new(config: &HandshakeConfig) -> (Self, mpsc::UnboundedReceiver<HandshakeSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared_dir = if config.shared_dir.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(config.shared_dir.trim()))
        };

        info!(
            enabled = config.enabled,
            shared_dir = ?shared_dir,
            shortcut = %config.shortcut_name,
            timeout_secs = config.timeout_secs,
            "handshake channel initialized"
        );

        (
            Self {
                enabled: config.enabled,
                shared_dir,
                shortcut: config.shortcut_name.clone(),
                cli_bin: config.cli_bin.clone(),
                poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
                budget: Duration::from_secs(config.timeout_secs.max(1)),
                signals: tx,
            },
            rx,
        )
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Deliver `prompt` and wait for the reply.  `Ok(None)` means the call
    /// was cancelled; every file created for the request is removed.
    pub async fn run(&self, prompt: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        match self.rendezvous_dir().await {
            Some(dir) => self.run_files(&dir, prompt, cancel).await,
            None => self.run_cli(prompt, cancel).await,
        }
    }

    async fn rendezvous_dir(&self) -> Option<PathBuf> {
        let dir = self.shared_dir.as_ref()?;
        match tokio::fs::create_dir_all(dir).await {
            Ok(()) => Some(dir.clone()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "shared directory unusable, using CLI runner");
                None
            }
        }
    }

    async fn run_files(
        &self,
        dir: &Path,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let id = Uuid::new_v4();
        let input = dir.join(format!("request-{id}.txt"));
        let output = dir.join(format!("response-{id}.txt"));

        tokio::fs::write(&input, prompt).await?;
        let _ = self.signals.send(HandshakeSignal::Requested {
            id,
            shortcut: self.shortcut.clone(),
            input: input.clone(),
            output: output.clone(),
        });
        debug!(%id, input = %input.display(), "handshake request written");

        let deadline = Instant::now() + self.budget;
        loop {
            if tokio::fs::try_exists(&output).await.unwrap_or(false) {
                let text = tokio::fs::read_to_string(&output).await;
                remove_quietly(&input).await;
                remove_quietly(&output).await;
                let text = text?.trim().to_string();
                if text.is_empty() {
                    return Err(ParleyError::EmptyResponse);
                }
                info!(%id, response_len = text.len(), "handshake response received");
                return Ok(Some(text));
            }

            if Instant::now() >= deadline {
                remove_quietly(&input).await;
                let _ = self.signals.send(HandshakeSignal::TimedOut { id });
                warn!(%id, budget_ms = self.budget.as_millis() as u64, "handshake timed out");
                return Err(ParleyError::Timeout(NOT_RUNNING.into()));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    remove_quietly(&input).await;
                    remove_quietly(&output).await;
                    debug!(%id, "handshake cancelled");
                    return Ok(None);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn run_cli(&self, prompt: &str, cancel: &CancellationToken) -> Result<Option<String>> {
        let id = Uuid::new_v4();
        let tmp = std::env::temp_dir();
        let input = tmp.join(format!("parley-request-{id}.txt"));
        let output = tmp.join(format!("parley-response-{id}.txt"));

        tokio::fs::write(&input, prompt).await?;

        let mut cmd = Command::new(&self.cli_bin);
        cmd.arg("run")
            .arg(&self.shortcut)
            .arg("--input-path")
            .arg(&input)
            .arg("--output-path")
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cli_bin = %self.cli_bin, shortcut = %self.shortcut, "invoking shortcut CLI");

        let result = self.wait_cli(cmd, &output, cancel).await;
        remove_quietly(&input).await;
        remove_quietly(&output).await;
        result
    }

    async fn wait_cli(
        &self,
        mut cmd: Command,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let child = cmd.spawn().map_err(|e| {
            ParleyError::GenerationFailed(format!(
                "failed to spawn shortcut CLI ({}): {e}",
                self.cli_bin
            ))
        })?;

        let finished = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("shortcut CLI cancelled");
                return Ok(None);
            }
            r = tokio::time::timeout(self.budget, child.wait_with_output()) => r,
        };

        let out = match finished {
            Ok(r) => r.map_err(|e| ParleyError::GenerationFailed(format!("shortcut CLI failed: {e}")))?,
            Err(_) => {
                warn!(budget_ms = self.budget.as_millis() as u64, "shortcut CLI timed out");
                return Err(ParleyError::Timeout(NOT_RUNNING.into()));
            }
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            warn!(exit_code = ?out.status.code(), stderr = %stderr, "shortcut CLI exited with error");
            return Err(ParleyError::GenerationFailed(stderr));
        }

        let text = match tokio::fs::read_to_string(output).await {
            Ok(t) => t.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if text.is_empty() {
            return Err(ParleyError::EmptyResponse);
        }
        info!(response_len = text.len(), "shortcut CLI response received");
        Ok(Some(text))
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove handshake file");
        }
    }
}
