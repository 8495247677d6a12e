//! Serial console WebSocket relay
//!
//! Bridges a browser WebSocket to the PTY backing a VM's serial console.
//! Each session runs two workers sharing one cancellation token: whichever
//! direction finishes first stops the other, and the owning task releases
//! the PTY and the socket once both have returned.

use axum::{
    extract::{
        ws::{Message, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use flint_common::{CredentialStore, Hypervisor};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt::Display;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pty::{is_hangup, PtyDevice};
use crate::server::{lookup_vm_id, WebState};

/// First frame sent once the PTY is open
pub const CONNECTED_BANNER: &str = "Serial console connected\r\n";

const READ_CHUNK: usize = 1024;

/// `?token=` query used by the WebSocket endpoints
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Check a WebSocket `?token=` against the API key. Runs before the upgrade.
#[allow(clippy::result_large_err)]
pub fn check_token(credentials: &CredentialStore, token: Option<&str>) -> Result<(), Response> {
    match token.filter(|t| !t.is_empty()) {
        None => Err((StatusCode::UNAUTHORIZED, "Authentication token required").into_response()),
        Some(token) if !credentials.compare_api_key(token) => {
            Err((StatusCode::UNAUTHORIZED, "Invalid authentication token").into_response())
        }
        Some(_) => Ok(()),
    }
}

/// `GET /api/vms/:uuid/serial-console/ws`
pub async fn serial_console_ws_handler(
    State(state): State<Arc<WebState>>,
    Path(vm_id): Path<String>,
    Query(query): Query<TokenQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Err(response) = check_token(&state.auth.credentials, query.token.as_deref()) {
        warn!(vm_id = %vm_id, "Rejected serial console connection");
        return response;
    }

    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "Failed to upgrade to WebSocket").into_response();
    };

    let hypervisor = Arc::clone(&state.hypervisor);
    ws.on_upgrade(move |socket| {
        let (sink, stream) = socket.split();
        console_session(hypervisor, vm_id, sink, stream)
    })
}

/// Resolve the VM, open its PTY and relay. Lookup and open failures are
/// reported to the client as a text frame before the socket is closed.
async fn console_session<Tx, Rx, E>(
    hypervisor: Arc<dyn Hypervisor>,
    vm_id: String,
    mut sink: Tx,
    stream: Rx,
) where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Tx::Error: Display + Send,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let lookup = async {
        let vm_id = lookup_vm_id(hypervisor.as_ref(), &vm_id).await?;
        let path = hypervisor.serial_console_path(&vm_id).await?;
        Ok::<_, flint_common::Error>((vm_id, path))
    };
    let (vm_id, path) = match lookup.await {
        Ok(found) => found,
        Err(e) => {
            warn!(vm_id = %vm_id, error = %e, "Serial console lookup failed");
            let _ = sink.send(Message::Text(format!("Error: {}", e))).await;
            let _ = sink.close().await;
            return;
        }
    };

    let pty = match PtyDevice::open(&path) {
        Ok(pty) => pty,
        Err(e) => {
            warn!(vm_id = %vm_id, pty = %path, error = %e, "Failed to open PTY");
            let _ = sink
                .send(Message::Text(format!("Error opening PTY: {}", e)))
                .await;
            let _ = sink.close().await;
            return;
        }
    };

    if sink
        .send(Message::Text(CONNECTED_BANNER.to_string()))
        .await
        .is_err()
    {
        return;
    }

    info!(vm_id = %vm_id, pty = %path, "Serial console session started");
    relay(pty, sink, stream).await;
    info!(vm_id = %vm_id, "Serial console session ended");
}

/// Relay between a PTY and a WebSocket until either side finishes.
///
/// Text frames from the socket are written to the PTY verbatim; PTY output
/// is sent back as text frames. Both halves of the PTY and the socket sink
/// are dropped before this returns, including when a worker panics.
pub async fn relay<P, Tx, Rx, E>(pty: P, sink: Tx, stream: Rx)
where
    P: AsyncRead + AsyncWrite + Send + 'static,
    Tx: Sink<Message> + Unpin + Send + 'static,
    Tx::Error: Display + Send,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let done = CancellationToken::new();
    let (reader, writer) = tokio::io::split(pty);

    let outbound = tokio::spawn(pty_to_socket(reader, sink, done.clone()));
    let inbound = tokio::spawn(socket_to_pty(stream, writer, done.clone()));

    let (outbound, inbound) = tokio::join!(outbound, inbound);
    done.cancel();

    let write_failure = inbound.unwrap_or_else(|e| {
        warn!(error = %e, "Console input worker failed");
        None
    });

    match outbound {
        Ok(mut sink) => {
            if let Some(message) = write_failure {
                let _ = sink.send(Message::Text(message)).await;
            }
            let _ = sink.close().await;
        }
        Err(e) => warn!(error = %e, "Console output worker failed"),
    }
}

/// PTY output to socket. Returns the sink so the owner can close it.
async fn pty_to_socket<P, Tx>(mut reader: ReadHalf<P>, mut sink: Tx, done: CancellationToken) -> Tx
where
    P: AsyncRead,
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let _cancel_on_exit = done.clone().drop_guard();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = tokio::select! {
            _ = done.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("PTY closed");
                    break;
                }
                Ok(n) => n,
                Err(e) if is_hangup(&e) => {
                    debug!("PTY hung up");
                    break;
                }
                Err(e) => {
                    let _ = sink
                        .send(Message::Text(format!("Error reading from PTY: {}", e)))
                        .await;
                    break;
                }
            },
        };

        pending.extend_from_slice(&buf[..n]);
        let text = drain_utf8(&mut pending);
        if text.is_empty() {
            continue;
        }
        if let Err(e) = sink.send(Message::Text(text)).await {
            debug!(error = %e, "WebSocket send failed");
            break;
        }
    }

    sink
}

/// Socket input to PTY. Returns a diagnostic if the PTY write failed.
async fn socket_to_pty<P, Rx, E>(
    mut stream: Rx,
    mut writer: WriteHalf<P>,
    done: CancellationToken,
) -> Option<String>
where
    P: AsyncWrite,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let _cancel_on_exit = done.clone().drop_guard();

    loop {
        let message = tokio::select! {
            _ = done.cancelled() => return None,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                let written = tokio::select! {
                    _ = done.cancelled() => return None,
                    result = writer.write_all(text.as_bytes()) => result,
                };
                if let Err(e) = written {
                    return Some(format!("Error writing to PTY: {}", e));
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                debug!("WebSocket closed by client");
                return None;
            }
            // Binary and control frames are not console input
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "WebSocket read failed");
                return None;
            }
        }
    }
}

/// Decode everything in `pending` except an incomplete trailing sequence,
/// which is kept for the next read. Invalid bytes become U+FFFD.
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        let e = match std::str::from_utf8(pending) {
            Ok(valid) => {
                text.push_str(valid);
                pending.clear();
                return text;
            }
            Err(e) => e,
        };

        let valid = e.valid_up_to();
        text.push_str(&String::from_utf8_lossy(&pending[..valid]));
        match e.error_len() {
            None => {
                pending.drain(..valid);
                return text;
            }
            Some(invalid) => {
                text.push(char::REPLACEMENT_CHARACTER);
                pending.drain(..valid + invalid);
            }
        }
    }
}
