#![forbid(unsafe_code)]

// One persistent WebSocket to the ASR server, split into halves so a listener
// task can own the read side while the send path keeps the write side.

use crate::error::{StressError, StressResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWriter = SplitSink<WsStream, Message>;
pub type WsReader = SplitStream<WsStream>;

pub struct Connection {
    url: String,
    writer: WsWriter,
    reader: Option<WsReader>,
}

impl Connection {
    /// Opens the socket, failing with `Connect` on refusal, handshake error or timeout.
    pub async fn open(url: &str, connect_timeout: Duration) -> StressResult<Self> {
        let (ws, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| StressError::Connect(format!("timed out after {:?}", connect_timeout)))?
            .map_err(|e| StressError::Connect(e.to_string()))?;

        let (writer, reader) = ws.split();
        Ok(Self {
            url: url.to_string(),
            writer,
            reader: Some(reader),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Hands the read half to a listener. `None` once a listener failed to return it.
    pub fn take_reader(&mut self) -> Option<WsReader> {
        self.reader.take()
    }

    pub fn restore_reader(&mut self, reader: WsReader) {
        self.reader = Some(reader);
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    /// Sends one binary frame of raw audio.
    pub async fn send_binary(&mut self, chunk: &[u8]) -> StressResult<()> {
        self.writer
            .send(Message::Binary(chunk.to_vec().into()))
            .await
            .map_err(|e| StressError::Send(e.to_string()))
    }

    /// Sends a close frame and flushes.
    pub async fn close(mut self) -> StressResult<()> {
        self.writer
            .close()
            .await
            .map_err(|e| StressError::Connect(format!("close failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_refused_is_connect_error() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = Connection::open(&format!("ws://127.0.0.1:{}/ws", port), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(StressError::Connect(_))));
    }

    #[tokio::test]
    async fn test_open_times_out_on_silent_peer() {
        // Accepts TCP but never answers the upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let result = Connection::open(&format!("ws://{}/ws", addr), Duration::from_millis(200)).await;
        match result {
            Err(StressError::Connect(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected connect timeout, got {:?}", other.map(|c| c.url().to_string())),
        }
    }

    #[tokio::test]
    async fn test_secure_url_reaches_tls_handshake() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Plain TCP peer: records the first byte of the client's hello, then answers garbage
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 1];
            let _ = socket.read_exact(&mut first).await;
            let _ = seen_tx.send(first[0]);
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let result = Connection::open(&format!("wss://{}/ws", addr), Duration::from_secs(5)).await;
        match result {
            Err(StressError::Connect(msg)) => {
                assert!(!msg.contains("not compiled"), "{msg}");
                assert!(!msg.starts_with("URL error"), "{msg}");
            }
            other => panic!("expected handshake failure, got {:?}", other.map(|c| c.url().to_string())),
        }
        // 0x16 opens a TLS handshake record
        assert_eq!(seen_rx.await.unwrap(), 0x16);
    }
}
