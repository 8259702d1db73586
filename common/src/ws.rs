//! Client-side WebSocket plumbing: a thin connection wrapper and a
//! one-shot request/response helper used by the delegation client, the
//! node uplinks and the federation bridge.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::protocol::{parse_payload, Envelope, ErrorPayload, ProtocolError};

#[derive(Debug, Error)]
pub enum WsClientError {
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("connection closed")]
    Closed,
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    #[error("{message}")]
    Remote { message: String },
    #[error("unexpected reply type: {0}")]
    UnexpectedType(String),
}

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConnection {
    stream: WsStream,
    timeout: Duration,
}

impl WsConnection {
    /// Open a connection with a connect deadline. The same deadline is
    /// reused as the default read deadline for replies.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, WsClientError> {
        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| WsClientError::Timeout("connect"))??;
        Ok(Self { stream, timeout })
    }

    pub async fn send(&mut self, env: &Envelope) -> Result<(), WsClientError> {
        self.stream.send(Message::Text(env.to_json())).await?;
        Ok(())
    }

    /// Receive the next envelope, answering transport pings transparently.
    pub async fn recv(&mut self) -> Result<Envelope, WsClientError> {
        self.recv_with_timeout(self.timeout).await
    }

    pub async fn recv_with_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Envelope, WsClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .map_err(|_| WsClientError::Timeout("reply"))?
                .ok_or(WsClientError::Closed)??;
            match message {
                Message::Text(text) => return Ok(Envelope::from_json(&text)?),
                Message::Binary(bytes) => {
                    let text = String::from_utf8(bytes).map_err(|_| {
                        WsClientError::Protocol(ProtocolError::MissingField("utf-8 frame"))
                    })?;
                    return Ok(Envelope::from_json(&text)?);
                }
                Message::Ping(data) => {
                    self.stream.send(Message::Pong(data)).await?;
                }
                Message::Close(_) => return Err(WsClientError::Closed),
                _ => {}
            }
        }
    }

    /// Send a request and wait for the reply bearing the same correlator,
    /// discarding unrelated frames.
    pub async fn request(&mut self, env: &Envelope) -> Result<Envelope, WsClientError> {
        self.request_with_timeout(env, self.timeout).await
    }

    pub async fn request_with_timeout(
        &mut self,
        env: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope, WsClientError> {
        self.send(env).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(WsClientError::Timeout("reply"))?;
            let reply = self.recv_with_timeout(remaining).await?;
            if reply.id == env.id {
                return Ok(reply);
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Open a connection for a single request/response exchange.
pub async fn request_once(
    url: &str,
    env: &Envelope,
    timeout: Duration,
) -> Result<Envelope, WsClientError> {
    let mut conn = WsConnection::connect(url, timeout).await?;
    let reply = conn.request_with_timeout(env, timeout).await;
    conn.close().await;
    reply
}

/// Map a reply to its typed success case: `error` envelopes become
/// `Remote` errors, any other kind mismatch is surfaced as unexpected.
pub fn expect_kind(reply: Envelope, expected: &str) -> Result<Envelope, WsClientError> {
    if reply.kind == "error" {
        let message = parse_payload::<ErrorPayload>(&reply)
            .map(|p| p.message)
            .unwrap_or_else(|_| "remote error".to_string());
        return Err(WsClientError::Remote { message });
    }
    if reply.kind != expected {
        return Err(WsClientError::UnexpectedType(reply.kind));
    }
    Ok(reply)
}
