use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message as TtMessage;

pub const LOCAL_COLS: u16 = 80;
pub const LOCAL_ROWS: u16 = 20;
pub const REMOTE_COLS: u16 = 80;
pub const REMOTE_ROWS: u16 = 48;

/// Proxy-side keepalive toward the remote shell.
const REMOTE_PING_INTERVAL: Duration = Duration::from_secs(27);
/// Reads idle longer than this close the session; any inbound byte or ping
/// extends it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub mode: SessionMode,
    pub cols: u16,
    pub rows: u16,
    #[serde(rename = "startedAt")]
    pub started_at: String,
}

struct SessionEntry {
    info: SessionInfo,
    close: Arc<Notify>,
}

/// Live terminal sessions, listable and individually closable.
#[derive(Default)]
pub struct TerminalRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl TerminalRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, mode: SessionMode, cols: u16, rows: u16) -> (SessionInfo, Arc<Notify>) {
        let info = SessionInfo {
            id: uuid::Uuid::new_v4().as_simple().to_string(),
            mode,
            cols,
            rows,
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let close = Arc::new(Notify::new());
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.insert(
                info.id.clone(),
                SessionEntry {
                    info: info.clone(),
                    close: close.clone(),
                },
            );
        }
        (info, close)
    }

    fn unregister(&self, id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(id);
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .lock()
            .map(|s| s.values().map(|e| e.info.clone()).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    /// Request shutdown of one session; returns false for unknown ids.
    pub fn close(&self, id: &str) -> bool {
        if let Ok(sessions) = self.sessions.lock() {
            if let Some(entry) = sessions.get(id) {
                entry.close.notify_waiters();
                return true;
            }
        }
        false
    }
}

/// Client-side control frames. Anything that does not parse as one of these
/// is treated as terminal input.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlFrame {
    Resize { cols: u16, rows: u16 },
    Ping,
    Pong,
}

fn parse_control(text: &str) -> Option<ControlFrame> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Geometry is fixed at session open; only explicit resize frames change it.
pub fn geometry(mode: SessionMode, cols: Option<u16>, rows: Option<u16>) -> (u16, u16) {
    let (default_cols, default_rows) = match mode {
        SessionMode::Local => (LOCAL_COLS, LOCAL_ROWS),
        SessionMode::Remote => (REMOTE_COLS, REMOTE_ROWS),
    };
    (cols.unwrap_or(default_cols), rows.unwrap_or(default_rows))
}

// ---------------------------------------------------------------------------
// Local PTY sessions
// ---------------------------------------------------------------------------

struct LocalPty {
    master: Box<dyn portable_pty::MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    output_rx: mpsc::Receiver<Vec<u8>>,
}

fn open_local_pty(cwd: &std::path::Path, cols: u16, rows: u16) -> Result<LocalPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow::anyhow!("open pty: {e}"))?;

    let shell = default_shell();
    let mut cmd = CommandBuilder::new(&shell);
    cmd.cwd(cwd);
    #[cfg(not(windows))]
    cmd.args(["-i"]);

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| anyhow::anyhow!("spawn {shell}: {e}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow::anyhow!("pty writer: {e}"))?;
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow::anyhow!("pty reader: {e}"))?;

    // The PTY reader blocks; a dedicated thread feeds the async side.
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::Builder::new()
        .name("vibefoundry-pty-read".to_string())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        })
        .context("spawn pty reader thread")?;

    Ok(LocalPty {
        master: pair.master,
        writer,
        child,
        output_rx,
    })
}

fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Serve one browser terminal backed by a local shell in the project root.
/// Runs until the client disconnects, the shell exits, the idle timeout
/// fires, or the session is closed through the registry.
pub async fn run_local_session(
    socket: WebSocket,
    cwd: PathBuf,
    registry: Arc<TerminalRegistry>,
    cols: Option<u16>,
    rows: Option<u16>,
) {
    let (cols, rows) = geometry(SessionMode::Local, cols, rows);
    let (info, close_signal) = registry.register(SessionMode::Local, cols, rows);
    crate::logging::info_kv(
        "local terminal opened",
        &[("id", info.id.as_str()), ("cwd", &cwd.display().to_string())],
    );

    let reason = match open_local_pty(&cwd, cols, rows) {
        Ok(pty) => local_session_loop(socket, pty, &close_signal).await,
        Err(err) => {
            crate::logging::error(format!("local terminal failed to start: {err:#}"));
            let mut socket = socket;
            let _ = socket
                .send(close_message(1011, "failed to start shell"))
                .await;
            "pty start failed".to_string()
        }
    };

    registry.unregister(&info.id);
    crate::logging::info_kv(
        "local terminal closed",
        &[("id", info.id.as_str()), ("reason", reason.as_str())],
    );
}

async fn local_session_loop(
    socket: WebSocket,
    mut pty: LocalPty,
    close_signal: &Notify,
) -> String {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut last_activity = Instant::now();

    let reason = loop {
        tokio::select! {
            inbound = ws_rx.next() => {
                match inbound {
                    None | Some(Err(_)) => break "client disconnected".to_string(),
                    Some(Ok(WsMessage::Close(_))) => break "client closed".to_string(),
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        last_activity = Instant::now();
                        if pty.writer.write_all(&bytes).and_then(|_| pty.writer.flush()).is_err() {
                            break "shell exited".to_string();
                        }
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        last_activity = Instant::now();
                        match parse_control(&text) {
                            Some(ControlFrame::Resize { cols, rows }) => {
                                let _ = pty.master.resize(PtySize {
                                    rows,
                                    cols,
                                    pixel_width: 0,
                                    pixel_height: 0,
                                });
                            }
                            Some(ControlFrame::Ping) | Some(ControlFrame::Pong) => {}
                            None => {
                                if pty.writer.write_all(text.as_bytes()).and_then(|_| pty.writer.flush()).is_err() {
                                    break "shell exited".to_string();
                                }
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                }
            }
            output = pty.output_rx.recv() => {
                match output {
                    Some(bytes) => {
                        if ws_tx.send(WsMessage::Binary(bytes)).await.is_err() {
                            break "client disconnected".to_string();
                        }
                    }
                    None => break "shell exited".to_string(),
                }
            }
            _ = tokio::time::sleep_until(last_activity + IDLE_TIMEOUT) => {
                break "idle timeout".to_string();
            }
            _ = close_signal.notified() => {
                break "closed by request".to_string();
            }
        }
    };

    let _ = ws_tx.send(close_message(1000, &reason)).await;
    // Reap the shell: kill, then wait, then let the master drop (SIGHUP to
    // anything left in the session).
    let _ = pty.child.kill();
    let _ = pty.child.wait();
    reason
}

fn close_message(code: u16, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

// ---------------------------------------------------------------------------
// Remote proxy sessions
// ---------------------------------------------------------------------------

/// Derive the sandbox terminal WS endpoint from its HTTP base URL.
pub fn remote_terminal_url(codespace_url: &str) -> Result<String> {
    let mut parsed = url::Url::parse(codespace_url.trim())
        .with_context(|| format!("parse remote url {codespace_url}"))?;
    let scheme = match parsed.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    parsed
        .set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("unsupported remote url {codespace_url}"))?;
    parsed.set_path("/terminal");
    parsed.set_query(None);
    Ok(parsed.to_string())
}

/// Bridge one browser terminal to the sandbox's `/terminal` WS byte-for-byte.
/// Client `resize`/`ping` control frames are forwarded; `pong` replies from
/// the remote are filtered out; an independent keepalive pings the remote.
pub async fn run_remote_proxy(
    socket: WebSocket,
    codespace_url: String,
    registry: Arc<TerminalRegistry>,
    cols: Option<u16>,
    rows: Option<u16>,
) {
    let (cols, rows) = geometry(SessionMode::Remote, cols, rows);
    let (info, close_signal) = registry.register(SessionMode::Remote, cols, rows);

    let reason = match remote_terminal_url(&codespace_url) {
        Ok(ws_url) => match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((remote, _resp)) => {
                crate::logging::info_kv(
                    "remote terminal opened",
                    &[("id", info.id.as_str()), ("url", ws_url.as_str())],
                );
                proxy_loop(socket, remote, cols, rows, &close_signal).await
            }
            Err(err) => {
                crate::logging::error(format!("remote terminal connect failed: {err}"));
                let mut socket = socket;
                let _ = socket.send(close_message(1011, "connection lost")).await;
                "remote connect failed".to_string()
            }
        },
        Err(err) => {
            crate::logging::error(format!("remote terminal bad url: {err:#}"));
            let mut socket = socket;
            let _ = socket.send(close_message(1008, "invalid remote url")).await;
            "invalid remote url".to_string()
        }
    };

    registry.unregister(&info.id);
    crate::logging::info_kv(
        "remote terminal closed",
        &[("id", info.id.as_str()), ("reason", reason.as_str())],
    );
}

async fn proxy_loop(
    client: WebSocket,
    remote: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    cols: u16,
    rows: u16,
    close_signal: &Notify,
) -> String {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut remote_tx, mut remote_rx) = remote.split();
    let mut last_activity = Instant::now();
    let mut keepalive = tokio::time::interval(REMOTE_PING_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it.
    keepalive.tick().await;

    // Pin the agreed geometry on the remote before any user input.
    let initial_resize = serde_json::json!({"type": "resize", "cols": cols, "rows": rows});
    if remote_tx
        .send(TtMessage::Text(initial_resize.to_string()))
        .await
        .is_err()
    {
        let _ = client_tx.send(close_message(1011, "connection lost")).await;
        return "remote closed".to_string();
    }

    let (reason, close_client, close_remote) = loop {
        tokio::select! {
            inbound = client_rx.next() => {
                match inbound {
                    None | Some(Err(_)) => break ("client disconnected".to_string(), false, true),
                    Some(Ok(WsMessage::Close(_))) => break ("client closed".to_string(), false, true),
                    Some(Ok(msg)) => {
                        last_activity = Instant::now();
                        // resize and ping control frames travel verbatim,
                        // like every other byte.
                        if let Some(forward) = client_to_remote(msg) {
                            if remote_tx.send(forward).await.is_err() {
                                break ("connection lost".to_string(), true, false);
                            }
                        }
                    }
                }
            }
            inbound = remote_rx.next() => {
                match inbound {
                    None | Some(Err(_)) => break ("connection lost".to_string(), true, false),
                    Some(Ok(TtMessage::Close(_))) => break ("connection lost".to_string(), true, false),
                    Some(Ok(msg)) => {
                        last_activity = Instant::now();
                        if is_pong_frame(&msg) {
                            continue;
                        }
                        if let Some(forward) = remote_to_client(msg) {
                            if client_tx.send(forward).await.is_err() {
                                break ("client disconnected".to_string(), false, true);
                            }
                        }
                    }
                }
            }
            _ = keepalive.tick() => {
                let ping = serde_json::json!({"type": "ping"});
                if remote_tx.send(TtMessage::Text(ping.to_string())).await.is_err() {
                    break ("connection lost".to_string(), true, false);
                }
            }
            _ = tokio::time::sleep_until(last_activity + IDLE_TIMEOUT) => {
                break ("idle timeout".to_string(), true, true);
            }
            _ = close_signal.notified() => {
                break ("closed by request".to_string(), true, true);
            }
        }
    };

    if close_client {
        let _ = client_tx.send(close_message(1000, &reason)).await;
    }
    if close_remote {
        let _ = remote_tx
            .send(TtMessage::Close(Some(
                tokio_tungstenite::tungstenite::protocol::frame::CloseFrame {
                    code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                    reason: reason.clone().into(),
                },
            )))
            .await;
    }
    reason
}

fn client_to_remote(msg: WsMessage) -> Option<TtMessage> {
    match msg {
        WsMessage::Text(text) => Some(TtMessage::Text(text)),
        WsMessage::Binary(bytes) => Some(TtMessage::Binary(bytes)),
        WsMessage::Ping(data) => Some(TtMessage::Ping(data)),
        WsMessage::Pong(data) => Some(TtMessage::Pong(data)),
        WsMessage::Close(_) => None,
    }
}

fn remote_to_client(msg: TtMessage) -> Option<WsMessage> {
    match msg {
        TtMessage::Text(text) => Some(WsMessage::Text(text)),
        TtMessage::Binary(bytes) => Some(WsMessage::Binary(bytes)),
        TtMessage::Ping(data) => Some(WsMessage::Ping(data)),
        TtMessage::Pong(data) => Some(WsMessage::Pong(data)),
        TtMessage::Close(_) | TtMessage::Frame(_) => None,
    }
}

/// JSON `{type:"pong"}` keepalive replies never reach the browser.
fn is_pong_frame(msg: &TtMessage) -> bool {
    match msg {
        TtMessage::Text(text) => matches!(parse_control(text), Some(ControlFrame::Pong)),
        _ => false,
    }
}
