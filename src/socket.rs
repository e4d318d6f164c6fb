//! Frame model and transport erasure.
//!
//! The server upgrades through [`axum::extract::ws`] while the client dials
//! through [`tokio_tungstenite`]; both produce a sink/stream pair that is
//! erased behind [`FrameSink`] / [`FrameStream`] so that [`Connection`] can
//! serve both sides of the wire with one implementation.
//!
//! The adapters absorb inbound ping/pong frames (both transport libraries
//! queue the pong reply themselves) and normalize peer-close handling, so
//! only data frames ever reach a reader.
//!
//! [`Connection`]: crate::Connection

use crate::error::WsError;
use async_trait::async_trait;
use axum::extract::ws::{self, WebSocket};
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{
        self,
        protocol::{frame::coding::CloseCode, CloseFrame},
    },
    MaybeTlsStream, WebSocketStream,
};

/// A single WebSocket frame bound for, or received from, the peer.
#[derive(Debug, Clone)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
    /// Heartbeat ping. Outbound only; inbound pings are absorbed by the
    /// transport adapters.
    Ping,
    /// Peer-initiated close.
    Close,
}

/// The kind of data frame produced by [`Connection::read`].
///
/// [`Connection::read`]: crate::Connection::read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// UTF-8 text frame.
    Text,
    /// Binary frame.
    Binary,
}

/// Write half of an upgraded socket.
#[async_trait]
pub(crate) trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), WsError>;

    /// Close the underlying socket with a normal-closure status. Best effort;
    /// the peer may already be gone.
    async fn close_normal(&mut self);
}

/// Read half of an upgraded socket. `None` means the peer went away without
/// a close frame.
#[async_trait]
pub(crate) trait FrameStream: Send {
    async fn next_frame(&mut self) -> Option<Result<Frame, WsError>>;
}

// ---------------------------------------------------------------------------
// Server side: axum upgrade
// ---------------------------------------------------------------------------

pub(crate) struct AxumSink(pub(crate) SplitSink<WebSocket, ws::Message>);

#[async_trait]
impl FrameSink for AxumSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), WsError> {
        let message = match frame {
            Frame::Text(text) => ws::Message::Text(text.into()),
            Frame::Binary(data) => ws::Message::Binary(data),
            Frame::Ping => ws::Message::Ping(Bytes::new()),
            Frame::Close => ws::Message::Close(Some(ws::CloseFrame {
                code: ws::close_code::NORMAL,
                reason: "closed".into(),
            })),
        };
        self.0.send(message).await.map_err(WsError::transport)
    }

    async fn close_normal(&mut self) {
        let _ = self
            .0
            .send(ws::Message::Close(Some(ws::CloseFrame {
                code: ws::close_code::NORMAL,
                reason: "closed".into(),
            })))
            .await;
        let _ = self.0.close().await;
    }
}

pub(crate) struct AxumStream(pub(crate) SplitStream<WebSocket>);

#[async_trait]
impl FrameStream for AxumStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, WsError>> {
        loop {
            return match self.0.next().await? {
                Ok(ws::Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
                Ok(ws::Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(ws::Message::Ping(_) | ws::Message::Pong(_)) => continue,
                Ok(ws::Message::Close(_)) => Some(Ok(Frame::Close)),
                Err(err) => Some(Err(WsError::transport(err))),
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Client side: tokio-tungstenite dial
// ---------------------------------------------------------------------------

pub(crate) type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) struct TungsteniteSink(pub(crate) SplitSink<ClientSocket, tungstenite::Message>);

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), WsError> {
        let message = match frame {
            Frame::Text(text) => tungstenite::Message::Text(text.into()),
            Frame::Binary(data) => tungstenite::Message::Binary(data),
            Frame::Ping => tungstenite::Message::Ping(Bytes::new()),
            Frame::Close => tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "closed".into(),
            })),
        };
        self.0.send(message).await.map_err(WsError::transport)
    }

    async fn close_normal(&mut self) {
        let _ = self
            .0
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "closed".into(),
            })))
            .await;
        let _ = self.0.close().await;
    }
}

pub(crate) struct TungsteniteStream(pub(crate) SplitStream<ClientSocket>);

#[async_trait]
impl FrameStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, WsError>> {
        loop {
            return match self.0.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    Some(Ok(Frame::Text(text.as_str().to_owned())))
                }
                Ok(tungstenite::Message::Binary(data)) => Some(Ok(Frame::Binary(data))),
                Ok(tungstenite::Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(_) => continue,
                Err(err) => Some(Err(WsError::transport(err))),
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Accepts every frame instantly and discards it.
    pub(crate) struct DiscardSink;

    #[async_trait]
    impl FrameSink for DiscardSink {
        async fn send_frame(&mut self, _frame: Frame) -> Result<(), WsError> {
            Ok(())
        }

        async fn close_normal(&mut self) {}
    }

    /// Never completes a write, simulating a peer that stopped draining.
    pub(crate) struct StalledSink;

    #[async_trait]
    impl FrameSink for StalledSink {
        async fn send_frame(&mut self, _frame: Frame) -> Result<(), WsError> {
            std::future::pending().await
        }

        async fn close_normal(&mut self) {}
    }

    /// Never yields a frame; the connection stays open until closed locally.
    pub(crate) struct SilentStream;

    #[async_trait]
    impl FrameStream for SilentStream {
        async fn next_frame(&mut self) -> Option<Result<Frame, WsError>> {
            std::future::pending().await
        }
    }
}
