//! VNC WebSocket proxy
//!
//! Bridges a noVNC WebSocket to the VNC server libvirt exposes for a domain.

use axum::extract::ws::{Message, WebSocket};
use flint_common::hypervisor::VncEndpoint;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

/// VNC WebSocket proxy
pub struct VncProxy {
    endpoint: VncEndpoint,
}

impl VncProxy {
    pub fn new(endpoint: VncEndpoint) -> Self {
        Self { endpoint }
    }

    /// Address the proxy dials
    pub fn address(&self) -> String {
        self.endpoint.dial_address()
    }

    /// Bridge a WebSocket to the VNC server. Connection failures are reported
    /// to the client as a text frame before the socket is closed.
    pub async fn bridge(self, mut socket: WebSocket) -> anyhow::Result<()> {
        let vnc_addr = self.address();
        debug!("Connecting to VNC server at {}", vnc_addr);

        let vnc_stream = match TcpStream::connect(&vnc_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to connect to VNC server at {}: {}", vnc_addr, e);
                let _ = socket
                    .send(Message::Text(format!("Error: VNC connection failed: {}", e)))
                    .await;
                let _ = socket.close().await;
                return Err(anyhow::anyhow!("VNC connection failed: {}", e));
            }
        };
        vnc_stream.set_nodelay(true)?;

        let (vnc_read, vnc_write) = vnc_stream.into_split();
        let (ws_write, ws_read) = socket.split();

        tokio::select! {
            result = Self::forward_ws_to_vnc(ws_read, vnc_write) => {
                if let Err(e) = result {
                    debug!("WS->VNC forwarding ended: {}", e);
                }
            }
            result = Self::forward_vnc_to_ws(vnc_read, ws_write) => {
                if let Err(e) = result {
                    debug!("VNC->WS forwarding ended: {}", e);
                }
            }
        }

        debug!("VNC proxy session ended");
        Ok(())
    }

    async fn forward_ws_to_vnc(
        mut ws_read: SplitStream<WebSocket>,
        mut vnc_write: OwnedWriteHalf,
    ) -> anyhow::Result<()> {
        while let Some(msg) = ws_read.next().await {
            match msg? {
                Message::Binary(data) => {
                    trace!("WS->VNC: {} bytes", data.len());
                    vnc_write.write_all(&data).await?;
                }
                Message::Text(text) => {
                    // Some clients send the RFB version handshake as text
                    vnc_write.write_all(text.as_bytes()).await?;
                }
                Message::Close(_) => {
                    debug!("WebSocket closed by client");
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }

        Ok(())
    }

    async fn forward_vnc_to_ws(
        mut vnc_read: OwnedReadHalf,
        mut ws_write: SplitSink<WebSocket, Message>,
    ) -> anyhow::Result<()> {
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let n = vnc_read.read(&mut buffer).await?;
            if n == 0 {
                debug!("VNC server closed connection");
                break;
            }

            trace!("VNC->WS: {} bytes", n);
            ws_write.send(Message::Binary(buffer[..n].to_vec())).await?;
        }

        let _ = ws_write.close().await;
        Ok(())
    }
}
