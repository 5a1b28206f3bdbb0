mod logging;

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::{info, warn};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};
use tutor_contracts::directives::{DirectiveRegistry, DirectiveSelector};
use tutor_contracts::events::EventWriter;
use tutor_engine::config::DEFAULT_ROUTE;
use tutor_engine::generator::DEFAULT_OPENAI_MODEL;
use tutor_engine::{
    DryrunGenerator, Generator, OpenAiGenerator, PendingPolicy, ServiceContext, SessionConfig,
    TutorServer,
};

use crate::logging::{init_logging, LogFormat};

const DEFAULT_REPLY_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, Parser)]
#[command(name = "tutor-rs", version, about = "Image-grounded tutoring over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tutoring WebSocket server.
    Serve(ServeArgs),
    /// Upload an image, ask questions and print every reply as a JSON line.
    Ask(AskArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GeneratorKind {
    Dryrun,
    Openai,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:8000")]
    bind: String,
    #[arg(long, default_value = DEFAULT_ROUTE)]
    path: String,
    #[arg(long, value_enum, default_value = "dryrun")]
    generator: GeneratorKind,
    #[arg(long)]
    model: Option<String>,
    /// Default directive for clients that do not pick one.
    #[arg(long)]
    directive: Option<String>,
    /// Replaces the default directive's instruction text.
    #[arg(long)]
    directive_file: Option<PathBuf>,
    /// `reject` or `replace`; falls back to TUTOR_PENDING_POLICY.
    #[arg(long)]
    pending_policy: Option<PendingPolicy>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Parser)]
struct AskArgs {
    #[arg(long, default_value = "ws://127.0.0.1:8000/ask/")]
    url: String,
    #[arg(long)]
    image: PathBuf,
    #[arg(long = "question", required = true)]
    questions: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_REPLY_TIMEOUT_SECS)]
    timeout_secs: u64,
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tutor-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args),
        Command::Ask(args) => run_ask(args),
    }
}

fn run_serve(args: ServeArgs) -> Result<i32> {
    init_logging(&args.log_level, args.log_format);

    let mut config = SessionConfig::from_env();
    if let Some(policy) = args.pending_policy {
        config.pending_policy = policy;
    }
    let generator: Arc<dyn Generator> = match args.generator {
        GeneratorKind::Dryrun => Arc::new(DryrunGenerator),
        GeneratorKind::Openai => {
            let model = args.model.as_deref().unwrap_or(DEFAULT_OPENAI_MODEL);
            Arc::new(OpenAiGenerator::from_env(model, config.generation_timeout)?)
        }
    };
    let registry = build_registry(args.directive.as_deref(), args.directive_file.as_deref())?;
    info!(
        generator = generator.name(),
        directive = registry.default_name(),
        directives = ?registry.names(),
        pending_policy = %config.pending_policy,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        max_image_bytes = config.max_image_bytes,
        "service configured"
    );

    let mut context = ServiceContext::new(generator, config)
        .with_directives(DirectiveSelector::new(Some(registry)));
    if let Some(path) = args.events.as_ref() {
        let server_id = uuid::Uuid::new_v4().to_string();
        info!(events = %path.display(), server_id = %server_id, "writing session events");
        context = context.with_events(EventWriter::create(path, server_id)?);
    }

    let server = TutorServer::bind(&args.bind, context)?.with_route(args.path.clone());
    info!(addr = %server.local_addr()?, path = %args.path, "listening");
    server.serve_forever()?;
    Ok(0)
}

fn build_registry(
    default: Option<&str>,
    directive_file: Option<&Path>,
) -> Result<DirectiveRegistry> {
    let mut registry = DirectiveRegistry::default();
    if let Some(name) = default {
        if !registry.set_default(name) {
            bail!(
                "unknown directive '{}' (available: {})",
                name.trim(),
                registry.names().join(", ")
            );
        }
    }
    if let Some(path) = directive_file {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read directive file {}", path.display()))?;
        let text = text.trim();
        if text.is_empty() {
            bail!("directive file {} is empty", path.display());
        }
        let name = registry.default_name().to_string();
        registry.override_instruction(&name, text);
    }
    Ok(registry)
}

type ClientSocket = WebSocket<MaybeTlsStream<TcpStream>>;

fn run_ask(args: AskArgs) -> Result<i32> {
    init_logging(&args.log_level, LogFormat::Pretty);
    let bytes = fs::read(&args.image)
        .with_context(|| format!("failed to read image {}", args.image.display()))?;
    let reply_timeout = Duration::from_secs(args.timeout_secs.max(1));

    let (mut socket, _) = websocket_connect(args.url.as_str())
        .with_context(|| format!("failed to connect to {}", args.url))?;
    set_client_read_timeout(&mut socket, Some(Duration::from_millis(250)))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let replies = ask_session(&mut socket, &bytes, &args.questions, reply_timeout, &mut out)?;
    let _ = socket.close(None);
    let _ = socket.flush();

    let failed = replies.iter().any(|reply| reply.get("error").is_some());
    Ok(if failed { 2 } else { 0 })
}

/// Uploads the image, then asks each question only after the previous reply
/// arrived. Every reply is written to `out` as one JSON line. Stops early if
/// the image is rejected.
fn ask_session(
    socket: &mut ClientSocket,
    image_bytes: &[u8],
    questions: &[String],
    reply_timeout: Duration,
    out: &mut impl Write,
) -> Result<Vec<Value>> {
    let mut replies = Vec::new();

    send_json(socket, &image_frame(image_bytes))?;
    let stored = await_reply(socket, reply_timeout)?;
    writeln!(out, "{stored}")?;
    let rejected = stored.get("error").is_some();
    replies.push(stored);
    if rejected {
        warn!("image was rejected; not asking questions");
        return Ok(replies);
    }

    for question in questions {
        send_json(socket, &json!({ "question": question }))?;
        let reply = await_reply(socket, reply_timeout)?;
        writeln!(out, "{reply}")?;
        replies.push(reply);
    }
    Ok(replies)
}

fn image_frame(bytes: &[u8]) -> Value {
    json!({ "image": BASE64.encode(bytes) })
}

fn send_json(socket: &mut ClientSocket, value: &Value) -> Result<()> {
    socket
        .send(WsMessage::Text(value.to_string().into()))
        .context("failed to send frame")
}

fn await_reply(socket: &mut ClientSocket, timeout: Duration) -> Result<Value> {
    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() >= deadline {
            bail!("no reply within {}s", timeout.as_secs());
        }
        match socket.read() {
            Ok(WsMessage::Text(text)) => {
                return serde_json::from_str(text.as_str())
                    .with_context(|| format!("reply is not JSON: {}", text.as_str()));
            }
            Ok(WsMessage::Close(_)) => bail!("server closed the connection"),
            Ok(_) => continue,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue
            }
            Err(err) => return Err(err).context("failed to read reply"),
        }
    }
}

fn set_client_read_timeout(socket: &mut ClientSocket, timeout: Option<Duration>) -> Result<()> {
    match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout)?,
        MaybeTlsStream::Rustls(stream) => stream.get_mut().set_read_timeout(timeout)?,
        _ => {}
    }
    Ok(())
}
