use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use parley::config::Config;
use parley::conversation::{ConversationId, MessageId, Role};
use parley::handshake::{HandshakeChannel, HandshakeSignal};
use parley::llm::{
    BackendAdapter, BackendKind, Backends, GeminiAdapter, ModelSpec, OllamaSession,
    OnDeviceAdapter, ShortcutAdapter,
};
use parley::orchestrator::{
    ConversationEvent, GenerationHandle, GenerationOrchestrator, GenerationOutcome,
    OrchestratorSettings,
};
use parley::search::{PerplexityClient, SearchClient};
use parley::store::{ConversationStore, SqliteStore};

#[tokio::main]
async fn main() {
    // Load .env file (if present) before anything reads env vars
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    if args.iter().any(|a| a == "--default-config") {
        print!("{}", Config::default_config_contents());
        return;
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let config = match Config::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load config: {e}");
            return;
        }
    };

    info!(
        history_window = config.history_window,
        search = config.search.enabled,
        local = config.local.enabled,
        handshake = config.handshake.enabled,
        "parley starting"
    );

    let db_path = Config::data_dir().join("parley.db");
    let store: Arc<dyn ConversationStore> = match SqliteStore::open(&db_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("failed to open database: {e}");
            return;
        }
    };

    let backends = match build_backends(&config).await {
        Ok(b) => b,
        Err(e) => {
            error!("failed to initialize backends: {e}");
            return;
        }
    };
    info!(available = ?backends.available(), "backends initialized");

    let search: Option<Arc<dyn SearchClient>> = if config.search.enabled {
        match PerplexityClient::new(&config.search) {
            Ok(c) => Some(Arc::new(c)),
            Err(e) => {
                warn!("search disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let orchestrator = GenerationOrchestrator::new(
        OrchestratorSettings::from_config(&config),
        backends,
        search,
        store,
    );

    let conversation = orchestrator.create_conversation("Terminal session").await;
    let printer = tokio::spawn(print_events(orchestrator.subscribe()));

    println!("parley ready. Type a prompt, /retry, /regen <backend>, or /quit.");
    run_repl(&orchestrator, conversation).await;

    printer.abort();
    info!("parley stopped");
}

/// Build every adapter once; selection happens per turn in the orchestrator.
async fn build_backends(config: &Config) -> parley::Result<Backends> {
    let typing_delay = Duration::from_millis(config.typing_delay_ms);
    let mut backends = Backends::new();

    let session = match OllamaSession::new(&config.on_device) {
        Ok(s) => {
            if config.on_device.enabled && !s.probe().await {
                warn!(host = %config.on_device.host, "on-device model daemon not reachable");
            }
            Some(Arc::new(s) as Arc<dyn parley::llm::LanguageModelSession>)
        }
        Err(e) => {
            warn!("on-device session unavailable: {e}");
            None
        }
    };
    backends.register(Arc::new(OnDeviceAdapter::new(session)));

    backends.register(Arc::new(GeminiAdapter::new(&config.remote, typing_delay)?));

    let (channel, signals) = HandshakeChannel::new(&config.handshake);
    tokio::spawn(log_handshake_signals(signals));
    backends.register(Arc::new(ShortcutAdapter::new(Arc::new(channel), typing_delay)));

    if let Some(local) = build_local_runtime(config).await {
        backends.register(local);
    }

    Ok(backends)
}

#[cfg(feature = "local")]
async fn build_local_runtime(config: &Config) -> Option<Arc<dyn BackendAdapter>> {
    use parley::llm::{GgufRuntime, LocalRuntimeAdapter};

    let runtime = GgufRuntime::new(config.sampling.clone().into(), config.system_prompt.clone());
    if !config.local.enabled {
        return Some(Arc::new(LocalRuntimeAdapter::new(Arc::new(runtime))));
    }

    let spec = match ModelSpec::from_config(&config.local) {
        Ok(s) => s,
        Err(e) => {
            warn!("local model not configured: {e}");
            return Some(Arc::new(LocalRuntimeAdapter::new(Arc::new(runtime))));
        }
    };
    let adapter = Arc::new(LocalRuntimeAdapter::new(Arc::new(runtime)).with_on_demand(spec.clone()));

    if config.local.load_on_start {
        if let Err(e) = adapter
            .load_model(spec, |p| debug!(progress = p, "loading local model"))
            .await
        {
            warn!("local model failed to load: {e}");
        }
    }
    Some(adapter)
}

#[cfg(not(feature = "local"))]
async fn build_local_runtime(config: &Config) -> Option<Arc<dyn BackendAdapter>> {
    if config.local.enabled {
        warn!(
            model_type = ?ModelSpec::from_config(&config.local).map(|s| s.model_type),
            "local runtime enabled but parley was built without the `local` feature"
        );
    }
    None
}

async fn log_handshake_signals(mut signals: tokio::sync::mpsc::UnboundedReceiver<HandshakeSignal>) {
    while let Some(signal) = signals.recv().await {
        match signal {
            HandshakeSignal::Requested {
                id,
                shortcut,
                input,
                output,
            } => info!(
                %id,
                shortcut = %shortcut,
                input = %input.display(),
                output = %output.display(),
                "handshake request waiting for automation tool"
            ),
            HandshakeSignal::TimedOut { id } => warn!(%id, "handshake request timed out"),
        }
    }
}

async fn run_repl(orchestrator: &GenerationOrchestrator, conversation: ConversationId) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("failed to read stdin: {e}");
                break;
            }
        };
        let line = line.trim();

        let handle = match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest.trim())) {
            ("/quit", _) | ("/exit", _) => break,
            ("", _) => continue,
            ("/retry", _) => orchestrator.retry_last(conversation).await,
            ("/regen", backend) => match regenerate_last(orchestrator, conversation, backend).await {
                Ok(h) => Some(h),
                Err(msg) => {
                    println!("{msg}");
                    continue;
                }
            },
            _ => orchestrator.send(conversation, line).await,
        };

        match handle {
            Some(h) => wait_or_interrupt(orchestrator, conversation, &h).await,
            None => println!("(nothing to do)"),
        }
    }
}

async fn regenerate_last(
    orchestrator: &GenerationOrchestrator,
    conversation: ConversationId,
    backend: &str,
) -> std::result::Result<GenerationHandle, String> {
    let kind = BackendKind::parse(if backend.is_empty() { "remote" } else { backend })
        .ok_or_else(|| format!("unknown backend \"{backend}\" (local, shortcut, on-device, remote)"))?;

    let target: Option<MessageId> = orchestrator.conversation(conversation).await.and_then(|c| {
        c.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.id)
    });
    let target = target.ok_or_else(|| "no assistant reply to regenerate".to_string())?;

    orchestrator
        .regenerate(conversation, target, kind)
        .await
        .map_err(|e| e.to_string())
}

/// Ctrl-C cancels the running generation instead of exiting.
async fn wait_or_interrupt(
    orchestrator: &GenerationOrchestrator,
    conversation: ConversationId,
    handle: &GenerationHandle,
) {
    tokio::select! {
        _ = handle.finished() => {}
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel(conversation).await;
            handle.finished().await;
        }
    }
}

/// Print assistant text as it streams.
async fn print_events(mut events: broadcast::Receiver<ConversationEvent>) {
    let mut printed: HashMap<MessageId, usize> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ConversationEvent::MessageUpdated { message, .. } if message.role == Role::Assistant => {
                let shown = printed.entry(message.id).or_insert(0);
                if message.text.len() < *shown || !message.text.is_char_boundary(*shown) {
                    println!();
                    *shown = 0;
                }
                print!("{}", &message.text[*shown..]);
                let _ = std::io::stdout().flush();
                *shown = message.text.len();
            }
            ConversationEvent::MessageUpdated { .. } => {}
            ConversationEvent::GenerationFinished {
                message_id,
                outcome,
                ..
            } => {
                printed.remove(&message_id);
                match outcome {
                    GenerationOutcome::Completed { censored: true } => println!(
                        "\n[this looks like a refusal; try /regen remote or /regen shortcut]"
                    ),
                    GenerationOutcome::Cancelled => println!("\n[cancelled]"),
                    _ => println!(),
                }
            }
            ConversationEvent::Notice { text, .. } => eprintln!("[{text}]"),
        }
    }
}

fn print_usage() {
    println!(
        "parley: conversational assistant with pluggable inference backends

USAGE:
    parley [OPTIONS]

OPTIONS:
    --config <PATH>     Path to config file (default: ~/.config/parley/config.toml)
    --default-config    Print default config to stdout and exit
    -h, --help          Print this help message

COMMANDS (on stdin):
    <text>              Send a prompt
    /retry              Re-send the last prompt if its reply failed
    /regen <backend>    Regenerate the last reply with local, shortcut, on-device or remote
    /quit               Exit

ENVIRONMENT:
    GEMINI_API_KEY        Remote API key
    PERPLEXITY_API_KEY    Web search API key
    OLLAMA_HOST           On-device model daemon address
    MODEL_PATH            Path to .gguf model file (local runtime, `local` feature)
    RUST_LOG              Log filter (default: info)"
    );
}
