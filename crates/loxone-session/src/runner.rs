//! Per-Miniserver session runner: connect, authenticate, fetch structure,
//! subscribe, and apply incoming frames until the connection drops, then
//! retry with backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use loxone_common::config::MiniserverConfig;
use loxone_common::error::LoxoneError;
use loxone_protocol::frame::{decode_header, parse_text_states, parse_value_states, MessageType};
use loxone_protocol::handshake::{self, CommandChannel, HandshakeError};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::mirror::Mirror;
use crate::structure::{apply_structure, parse_structure};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEAD_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Per-Miniserver runtime state that survives across reconnect attempts
/// within a single process lifetime.
struct RunnerState {
    encrypted: bool,
    backoff: Duration,
}

impl RunnerState {
    fn new(use_encryption: bool) -> Self {
        Self {
            encrypted: use_encryption,
            backoff: INITIAL_BACKOFF,
        }
    }

    fn reset_backoff(&mut self) {
        self.backoff = INITIAL_BACKOFF;
    }

    fn escalate_backoff(&mut self) -> Duration {
        let current = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        current
    }
}

/// Adapts an open WebSocket connection to the [`CommandChannel`]
/// abstraction the handshake engine expects: send a text frame, await the
/// next text frame back.
struct WsCommandChannel<'a> {
    socket: &'a mut WsStream,
}

impl CommandChannel for WsCommandChannel<'_> {
    async fn send_command(&mut self, command: &str) -> Result<Value, HandshakeError> {
        self.socket
            .send(Message::Text(command.to_string()))
            .await
            .map_err(|e| HandshakeError::Transport(e.to_string()))?;

        loop {
            let msg = self
                .socket
                .next()
                .await
                .ok_or_else(|| HandshakeError::Transport("connection closed".to_string()))?
                .map_err(|e| HandshakeError::Transport(e.to_string()))?;
            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        HandshakeError::MalformedResponse {
                            command: command.to_string(),
                            detail: e.to_string(),
                        }
                    });
                }
                Message::Binary(bytes) => {
                    // Header/payload frame pairs can interleave with text
                    // command responses during structure download; ignore
                    // binary frames while waiting on a text response.
                    debug!(len = bytes.len(), "ignoring binary frame awaiting command response");
                }
                Message::Close(_) => {
                    return Err(HandshakeError::Transport("connection closed".to_string()));
                }
                _ => {}
            }
        }
    }
}

fn build_url(config: &MiniserverConfig, encrypted: bool) -> String {
    let scheme = if encrypted { "wss" } else { "ws" };
    format!(
        "{scheme}://{}:{}/ws/rfc6455",
        config.host, config.port
    )
}

async fn fetch_public_key_http(config: &MiniserverConfig) -> Option<String> {
    let url = format!("http://{}:{}/jdev/sys/getPublicKey", config.host, config.port);
    let client = reqwest::Client::new();
    let response = client
        .get(&url)
        .basic_auth(&config.username, Some(&config.password))
        .send()
        .await
        .ok()?;
    let body: Value = response.json().await.ok()?;
    body.get("LL")
        .and_then(|ll| ll.get("value"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

async fn fetch_structure(socket: &mut WsStream) -> Result<Value, LoxoneError> {
    let mut channel = WsCommandChannel { socket };
    channel
        .send_command("data/LoxAPP3.json")
        .await
        .map(|envelope| envelope.get("LL").cloned().unwrap_or(envelope))
        .map_err(|e| LoxoneError::WireProtocol(e.to_string()))
}

/// One connect-authenticate-run cycle. Returns `Ok(())` when the loop
/// exits cleanly (should not normally happen outside tests/shutdown) or
/// an error describing why the connection ended, always recoverable.
async fn run_once(
    config: &MiniserverConfig,
    mirror: &Mirror,
    state: &mut RunnerState,
    shutdown: &tokio_util::sync::CancellationToken,
) -> Result<(), LoxoneError> {
    let url = build_url(config, state.encrypted);
    info!(url = %url, "connecting to miniserver");

    let (mut socket, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| LoxoneError::Transient(e.to_string()))?;

    let pubkey = fetch_public_key_http(config).await;
    {
        let mut channel = WsCommandChannel {
            socket: &mut socket,
        };
        handshake::authenticate(
            &mut channel,
            pubkey.as_deref(),
            &config.username,
            &config.password,
            "loxone-exporter",
            &config.name,
        )
        .await
        .map_err(|e| LoxoneError::AuthFailed {
            reason: e.to_string(),
        })?;
    }

    let structure_json = fetch_structure(&mut socket).await?;
    let parsed = parse_structure(&structure_json).map_err(|e| LoxoneError::WireProtocol(e.to_string()))?;
    let generation2 = parsed.generation2;

    if generation2 && !state.encrypted {
        if config.force_encryption {
            return Err(LoxoneError::Transient(
                "miniserver requires encryption, retrying over wss".to_string(),
            ));
        }
        info!("auto-upgrading to encrypted connection for detected generation-2 miniserver");
        state.encrypted = true;
        return Err(LoxoneError::Transient("reconnecting with encryption".to_string()));
    }

    mirror.write(|snapshot| apply_structure(snapshot, parsed)).await;
    mirror.set_connected(true).await;
    state.reset_backoff();

    {
        let mut channel = WsCommandChannel {
            socket: &mut socket,
        };
        let _ = channel.send_command("jdev/sys/enablebinstatusupdate").await;
    }

    let last_frame_at = Arc::new(AtomicU64::new(now_secs()));

    let (mut write_half, mut read_half) = socket.split();

    let keepalive_last_frame = Arc::clone(&last_frame_at);
    let keepalive_shutdown = shutdown.clone();
    let keepalive_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if write_half.send(Message::Text("keepalive".to_string())).await.is_err() {
                        return;
                    }
                }
                () = keepalive_shutdown.cancelled() => {
                    let _ = write_half.close().await;
                    return;
                }
            }
            let _ = keepalive_last_frame.load(Ordering::Relaxed);
        }
    });

    let result = receive_loop(&mut read_half, mirror, &last_frame_at, shutdown).await;

    keepalive_task.abort();
    mirror.set_connected(false).await;
    result
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

async fn receive_loop(
    read_half: &mut futures_util::stream::SplitStream<WsStream>,
    mirror: &Mirror,
    last_frame_at: &AtomicU64,
    shutdown: &tokio_util::sync::CancellationToken,
) -> Result<(), LoxoneError> {
    let mut pending_header: Option<loxone_protocol::frame::MessageHeader> = None;

    loop {
        let next = tokio::select! {
            msg = timeout(DEAD_CONNECTION_TIMEOUT, read_half.next()) => msg,
            () = shutdown.cancelled() => return Ok(()),
        };

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => return Err(LoxoneError::Transient(e.to_string())),
            Ok(None) => return Err(LoxoneError::Transient("connection closed".to_string())),
            Err(_) => {
                return Err(LoxoneError::Transient(
                    "no frame received within dead-connection timeout".to_string(),
                ))
            }
        };

        last_frame_at.store(now_secs(), Ordering::Relaxed);

        match msg {
            Message::Binary(bytes) => {
                // Per the wire contract: consume header frames until one
                // declares payload_length>0, then treat exactly the next
                // frame as that header's payload. A header-only frame
                // (payload_length==0) carries no data of its own and is
                // simply discarded, never mistaken for a payload frame.
                if bytes.len() >= 8 && pending_header.is_none() {
                    if let Ok(header) = decode_header(&bytes) {
                        if header.payload_length > 0 {
                            pending_header = Some(header);
                        }
                        continue;
                    }
                }
                if let Some(header) = pending_header.take() {
                    apply_payload(header.msg_type, &bytes, mirror).await?;
                }
            }
            Message::Close(_) => {
                return Err(LoxoneError::Transient("connection closed by peer".to_string()))
            }
            _ => {}
        }
    }
}

async fn apply_payload(
    msg_type: MessageType,
    payload: &[u8],
    mirror: &Mirror,
) -> Result<(), LoxoneError> {
    match msg_type {
        MessageType::ValueStates => {
            let updates = parse_value_states(payload);
            let unknown = mirror.apply_value_batch(&updates).await;
            if unknown > 0 {
                debug!(unknown, "value batch referenced unknown state ids");
            }
        }
        MessageType::TextStates => {
            let updates = parse_text_states(payload);
            let unknown = mirror.apply_text_batch(&updates).await;
            if unknown > 0 {
                debug!(unknown, "text batch referenced unknown state ids");
            }
        }
        MessageType::OutOfService => {
            warn!("miniserver reported out of service, reconnecting");
            return Err(LoxoneError::OutOfService);
        }
        _ => {}
    }
    Ok(())
}

/// Run the supervision loop forever: connect, authenticate, mirror
/// updates, and on any failure sleep with escalating backoff before
/// retrying. Returns only when `shutdown` is triggered.
pub async fn run_session(
    config: MiniserverConfig,
    mirror: Mirror,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut state = RunnerState::new(config.use_encryption || config.force_encryption);

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        let out_of_service = match run_once(&config, &mirror, &mut state, &shutdown).await {
            Ok(()) => {
                if shutdown.is_cancelled() {
                    return;
                }
                false
            }
            Err(err) => {
                warn!(miniserver = %config.name, error = %err, "session ended, retrying");
                matches!(err, LoxoneError::OutOfService)
            }
        };

        mirror.set_connected(false).await;

        // An OUT_OF_SERVICE frame is not a connection fault: reconnect
        // immediately instead of escalating backoff.
        if out_of_service {
            state.reset_backoff();
            continue;
        }

        let delay = state.escalate_backoff();
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shutdown.cancelled() => return,
        }
    }
}
