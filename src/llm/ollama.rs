use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OnDeviceConfig;
use crate::error::{ParleyError, Result};
use crate::llm::on_device::LanguageModelSession;
use crate::llm::{prompts, GenerationRequest, TokenStream};

/// On-device session served by a local Ollama daemon.
///
/// Communicates via the streaming chat API (`POST /api/chat`, NDJSON).
/// Availability starts from the config flag and is refined by `probe()`.
pub struct OllamaSession {
    client: Client,
    base_url: String,
    model: String,
    available: AtomicBool,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: serde_json::Value,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    top_k: u32,
    top_p: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl OllamaSession {
    pub fn new(config: &OnDeviceConfig) -> Result<Self> {
        let base_url = config.host.trim_end_matches('/').to_string();

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ParleyError::Config(format!("failed to create HTTP client: {e}")))?;

        info!(
            model = %config.model,
            base_url = %base_url,
            enabled = config.enabled,
            "Ollama session initialized"
        );

        Ok(Self {
            client,
            base_url,
            model: config.model.clone(),
            available: AtomicBool::new(config.enabled && !config.host.is_empty()),
        })
    }

    /// Check that the daemon answers; updates `is_available()`.
    pub async fn probe(&self) -> bool {
        if !self.available.load(Ordering::Relaxed) {
            return false;
        }
        let url = format!("{}/api/tags", self.base_url);
        let ok = match self.client.get(&url).timeout(Duration::from_secs(3)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "Ollama daemon not reachable");
                false
            }
        };
        self.available.store(ok, Ordering::Relaxed);
        ok
    }
}

/// Accumulates raw body bytes and hands out complete `\n`-terminated lines.
/// Nothing is decoded until a line is complete, so a multibyte character
/// split across HTTP chunks survives intact.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        Some(self.pending.drain(..=end).collect())
    }
}

#[async_trait::async_trait]
impl LanguageModelSession for OllamaSession {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    async fn stream_response(&self, request: &GenerationRequest) -> Result<TokenStream> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: self.model.clone(),
            messages: prompts::chat_messages(request),
            stream: true,
            options: ChatOptions {
                temperature: request.sampling.temperature,
                top_k: request.sampling.top_k,
                top_p: request.sampling.top_p,
                num_predict: request.sampling.max_tokens,
            },
        };

        debug!(
            model = %self.model,
            prompt_len = request.user_input.len(),
            "invoking Ollama chat API"
        );

        let resp = self.client.post(&url).json(&body).send().await.map_err(|e| {
            ParleyError::GenerationFailed(format!("Ollama request failed: {e}"))
        })?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "Ollama API error");
            return Err(ParleyError::GenerationFailed(format!(
                "Ollama API returned {status}: {error_text}"
            )));
        }

        let model = self.model.clone();
        let mut bytes = resp.bytes_stream();

        Ok(Box::pin(stream! {
            let mut lines = LineBuffer::default();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(ParleyError::GenerationFailed(format!("Ollama stream broke: {e}")));
                        break;
                    }
                };
                lines.push(&chunk);

                while let Some(raw) = lines.next_line() {
                    let line = raw.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }

                    match serde_json::from_slice::<StreamChunk>(line) {
                        Ok(parsed) => {
                            if let Some(err) = parsed.error {
                                yield Err(ParleyError::GenerationFailed(format!("Ollama: {err}")));
                                break 'read;
                            }
                            if let Some(msg) = parsed.message {
                                if !msg.content.is_empty() {
                                    yield Ok(msg.content);
                                }
                            }
                            if parsed.done {
                                debug!(model = %model, eval_tokens = ?parsed.eval_count, "Ollama stream finished");
                                break 'read;
                            }
                        }
                        Err(e) => {
                            yield Err(ParleyError::GenerationFailed(format!(
                                "failed to parse Ollama stream: {e}"
                            )));
                            break 'read;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::BackendKind;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_for(server: &MockServer) -> OllamaSession {
        OllamaSession::new(&OnDeviceConfig {
            host: server.uri(),
            model: "tiny".into(),
            ..OnDeviceConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn streams_ndjson_chunks_in_order() {
        let server = MockServer::start().await;
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":" there"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true,"eval_count":2}"#, "\n",
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"model": "tiny", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let session = session_for(&server);
        let req = GenerationRequest::single("hello", BackendKind::OnDevice);
        let tokens: Vec<String> = session
            .stream_response(&req)
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["Hi", " there"]);
    }

    #[test]
    fn line_buffer_keeps_split_characters_intact() {
        let line = "{\"message\":{\"content\":\"café\"},\"done\":true}\n".as_bytes();
        let split = line.iter().position(|b| *b == 0xC3).unwrap() + 1;

        let mut lines = LineBuffer::default();
        lines.push(&line[..split]);
        assert!(lines.next_line().is_none());
        lines.push(&line[split..]);

        let raw = lines.next_line().unwrap();
        let parsed: StreamChunk = serde_json::from_slice(raw.trim_ascii()).unwrap();
        assert_eq!(parsed.message.unwrap().content, "café");
        assert!(lines.next_line().is_none());
    }

    #[tokio::test]
    async fn multibyte_text_split_across_http_chunks() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            // Read headers plus the JSON body before answering.
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let body = "{\"message\":{\"content\":\"café\"},\"done\":true}\n".as_bytes();
            let split = body.iter().position(|b| *b == 0xC3).unwrap() + 1;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            for part in [&body[..split], &body[split..]] {
                socket.write_all(format!("{:x}\r\n", part.len()).as_bytes()).await.unwrap();
                socket.write_all(part).await.unwrap();
                socket.write_all(b"\r\n").await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            socket.write_all(b"0\r\n\r\n").await.unwrap();
            socket.flush().await.unwrap();
        });

        let session = OllamaSession::new(&OnDeviceConfig {
            host: format!("http://{addr}"),
            model: "tiny".into(),
            ..OnDeviceConfig::default()
        })
        .unwrap();
        let req = GenerationRequest::single("hello", BackendKind::OnDevice);
        let text: String = session
            .stream_response(&req)
            .await
            .unwrap()
            .map(|t| t.unwrap())
            .collect::<Vec<_>>()
            .await
            .concat();
        assert_eq!(text, "café");
    }

    #[tokio::test]
    async fn http_error_surfaces_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(404).set_body_string("model 'tiny' not found"))
            .mount(&server)
            .await;

        let session = session_for(&server);
        let req = GenerationRequest::single("hello", BackendKind::OnDevice);
        let err = session.stream_response(&req).await.err().unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn probe_marks_unreachable_daemon_unavailable() {
        let session = OllamaSession::new(&OnDeviceConfig {
            host: "http://127.0.0.1:9".into(),
            ..OnDeviceConfig::default()
        })
        .unwrap();
        assert!(session.is_available());
        assert!(!session.probe().await);
        assert!(!session.is_available());
    }

    #[test]
    fn disabled_config_is_unavailable() {
        let session = OllamaSession::new(&OnDeviceConfig {
            enabled: false,
            ..OnDeviceConfig::default()
        })
        .unwrap();
        assert!(!session.is_available());
    }
}
