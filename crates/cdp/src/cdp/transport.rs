//! Transport - the duplex pipe under a connection
//!
//! Outbound: `Transport::send` with a serialized message.
//! Inbound: an unbounded channel of raw text frames. The channel closing
//! is the one and only "transport closed" signal.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use crate::error::{CDPError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Inbound half handed to the connection
pub type Inbound = mpsc::UnboundedReceiver<String>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one serialized protocol message
    async fn send(&self, message: String) -> Result<()>;

    /// Close the pipe; the inbound channel ends shortly after
    async fn close(&self) -> Result<()>;
}

/// WebSocket transport (single socket per browser)
pub struct WebSocketTransport {
    /// WebSocket write half (wrapped for concurrent sending)
    sink: Mutex<WsSink>,
}

impl WebSocketTransport {
    /// Connect to Chrome DevTools Protocol endpoint
    pub async fn connect(ws_url: &str) -> Result<(Arc<Self>, Inbound)> {
        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        info!("[Transport] Connected to {}", ws_url);

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if tx.send(text).is_err() {
                            debug!("[Transport] Connection dropped, stopping reader");
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("[Transport] WebSocket closed");
                        break;
                    }
                    Err(e) => {
                        error!("[Transport] WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // tx dropped here: inbound channel closes
        });

        Ok((
            Arc::new(Self {
                sink: Mutex::new(sink),
            }),
            rx,
        ))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, message: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(message))
            .await
            .map_err(CDPError::WebSocket)
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        match sink.close().await {
            Ok(()) => Ok(()),
            // Already gone is fine
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(CDPError::WebSocket(e)),
        }
    }
}
