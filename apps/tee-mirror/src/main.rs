use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::Mutex;
use tee_mirror::cli::Cli;
use tee_mirror::config::{MirrorConfig, TransportKind};
use tee_mirror::input::{HttpInputSender, InputSender, SocketInputSender};
use tee_mirror::normalize::{NormalizeMode, PlainTextView, is_clear_screen, process_carriage_returns};
use tee_mirror::scope::ScopeClient;
use tee_mirror::session::{OutputChunk, RegistrySnapshot, short_id};
use tee_mirror::store::{InMemoryLogStore, LogStore, SqliteLogStore};
use tee_mirror::telemetry::logging;
use tee_mirror::transport::{Connector, SseConnector, WebSocketConnector};
use tee_mirror::{Mirror, MirrorHandle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;

    let config = cli.resolve(MirrorConfig::from_env()?)?;
    let base_url = config.base_url()?;

    let scope = ScopeClient::new(base_url.clone())?
        .acquire(cli.token.as_deref())
        .await
        .context("failed to acquire a relay token")?;
    eprintln!("token: {}", scope.token);
    if let Some(hint) = &scope.command_hint {
        eprintln!("attach a session with: {hint}");
    }

    let store: Arc<dyn LogStore> = match &config.db_path {
        Some(path) => Arc::new(
            SqliteLogStore::open(path)
                .with_context(|| format!("failed to open transcript log {}", path.display()))?,
        ),
        None => Arc::new(InMemoryLogStore::new()),
    };

    let (connector, input): (Arc<dyn Connector>, Arc<dyn InputSender>) = match config.transport {
        TransportKind::Sse => (
            Arc::new(SseConnector::new(base_url.clone())?),
            Arc::new(HttpInputSender::new(&base_url)?),
        ),
        TransportKind::WebSocket => {
            let connector = WebSocketConnector::new(config.ws_base_url()?);
            let outbound = connector.outbound();
            (Arc::new(connector), Arc::new(SocketInputSender::new(outbound)))
        }
    };

    let mirror = Mirror::start(config, scope.token.clone(), store, connector, input).await;
    let mode = if cli.plain {
        NormalizeMode::PlainText
    } else {
        NormalizeMode::Passthrough
    };

    let printer = Arc::new(Mutex::new(Printer::new(mode, mirror.sessions())));
    print_history(&mirror, &printer, cli.session.as_deref()).await?;

    let sink = printer.clone();
    let _subscription = match cli.session.as_deref() {
        Some(session_id) => mirror.subscribe(session_id, move |chunk: &OutputChunk| sink.lock().print(chunk)),
        None => mirror.subscribe_all(move |chunk: &OutputChunk| sink.lock().print(chunk)),
    };
    let status_task = tokio::spawn(report_connectivity(mirror.sessions()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => forward_input(&mirror, cli.session.as_deref(), line).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    status_task.abort();
    let report = mirror.shutdown().await?;
    tracing::debug!(
        target: "mirror.flush",
        chunks = report.chunks_written,
        bytes = report.bytes_written,
        "final flush"
    );
    Ok(())
}

async fn print_history(
    mirror: &MirrorHandle,
    printer: &Arc<Mutex<Printer>>,
    only: Option<&str>,
) -> anyhow::Result<()> {
    let snapshot = mirror.sessions().borrow().clone();
    for session in &snapshot.sessions {
        if only.is_some_and(|id| id != session.id) {
            continue;
        }
        if let Some(transcript) = mirror.transcript(&session.id).await? {
            printer.lock().print_history(&session.id, &transcript);
        }
    }
    Ok(())
}

async fn forward_input(mirror: &MirrorHandle, only: Option<&str>, line: String) {
    let target = match only {
        Some(id) => id.to_string(),
        None => {
            let snapshot = mirror.sessions().borrow().clone();
            match snapshot.sessions.as_slice() {
                [single] => single.id.clone(),
                [] => {
                    eprintln!("no live session to send input to");
                    return;
                }
                _ => {
                    eprintln!("several sessions are live; pass --session to pick one");
                    return;
                }
            }
        }
    };
    if let Err(err) = mirror.send_input(&target, &format!("{line}\n")).await {
        eprintln!("input to {} failed: {err}", short_id(&target));
    }
}

async fn report_connectivity(mut sessions: watch::Receiver<RegistrySnapshot>) {
    let mut connected = sessions.borrow().connected;
    while sessions.changed().await.is_ok() {
        let snapshot = sessions.borrow().clone();
        if snapshot.connected != connected {
            connected = snapshot.connected;
            let state = if connected { "connected" } else { "reconnecting" };
            eprintln!("[{state}] {} session(s)", snapshot.sessions.len());
        }
    }
}

/// Writes chunks to stdout, labelling them when output switches sessions.
struct Printer {
    mode: NormalizeMode,
    sessions: watch::Receiver<RegistrySnapshot>,
    last_session: Option<String>,
}

impl Printer {
    fn new(mode: NormalizeMode, sessions: watch::Receiver<RegistrySnapshot>) -> Self {
        Self {
            mode,
            sessions,
            last_session: None,
        }
    }

    fn print_history(&mut self, session_id: &str, transcript: &str) {
        let text = match self.mode {
            NormalizeMode::PlainText => {
                process_carriage_returns(PlainTextView::from_transcript(transcript).text())
            }
            NormalizeMode::Passthrough => self.mode.apply(transcript),
        };
        self.write(session_id, &text);
    }

    fn print(&mut self, chunk: &OutputChunk) {
        let mut text = self.mode.apply(&chunk.content);
        if self.mode == NormalizeMode::PlainText && is_clear_screen(&chunk.content) {
            text.insert(0, '\n');
        }
        self.write(&chunk.session_id, &text);
    }

    fn write(&mut self, session_id: &str, text: &str) {
        let mut stdout = std::io::stdout().lock();
        if self.last_session.as_deref() != Some(session_id) {
            let label = self
                .sessions
                .borrow()
                .get(session_id)
                .map(|session| session.label())
                .unwrap_or_else(|| short_id(session_id).to_string());
            let _ = writeln!(stdout, "\n== {label} ==");
            self.last_session = Some(session_id.to_string());
        }
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}
