//! Websocket transport seam.
//!
//! The connection task only sees a stream of [`WsFrame`]s and a
//! [`WsWriter`]. [`TungsteniteConnector`] opens real sockets;
//! [`MemoryConnector`] pairs the client with an in-process peer.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt, stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self, Message,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tracing::debug;

use super::config::DmsConfig;
use crate::error::{DmsError, DmsResult};

/// A websocket frame as seen by the connection task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsFrame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    /// Close frame with an optional reason.
    Close(Option<String>),
}

impl WsFrame {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Payload size used for the inbound size limit.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
            Self::Close(_) => 0,
        }
    }
}

/// Inbound half of a connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = DmsResult<WsFrame>> + Send>>;

/// Outbound half of a connection.
#[async_trait]
pub trait WsWriter: Send {
    async fn send_frame(&mut self, frame: WsFrame) -> DmsResult<()>;

    /// Send a close frame. Errors are not interesting at this point.
    async fn close(&mut self) {
        let _ = self.send_frame(WsFrame::Close(None)).await;
    }

    /// Whether the transport answers inbound pings by itself.
    fn answers_pings(&self) -> bool {
        false
    }
}

/// Opens websocket connections for a client.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &DmsConfig) -> DmsResult<(FrameStream, Box<dyn WsWriter>)>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, config: &DmsConfig) -> DmsResult<(FrameStream, Box<dyn WsWriter>)> {
        let url = config.url();
        debug!(url = %url, "Opening websocket");
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| DmsError::connect_failed(format!("{url}: {e}")))?;

        let (sink, stream) = ws.split();
        Ok((
            tungstenite_frames(stream),
            Box::new(TungsteniteWriter::new(sink)),
        ))
    }
}

/// Adapt a tungstenite message stream to a [`FrameStream`].
pub fn tungstenite_frames<S>(stream: S) -> FrameStream
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Send + 'static,
{
    stream
        .filter_map(|result| async move {
            match result {
                Ok(message) => message_to_frame(message).map(Ok),
                Err(e) => Some(Err(DmsError::connection_lost(e.to_string()))),
            }
        })
        .boxed()
}

fn message_to_frame(message: Message) -> Option<WsFrame> {
    match message {
        Message::Text(text) => Some(WsFrame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(WsFrame::Binary(data)),
        Message::Ping(data) => Some(WsFrame::Ping(data)),
        Message::Pong(data) => Some(WsFrame::Pong(data)),
        Message::Close(frame) => Some(WsFrame::Close(
            frame.map(|f| f.reason.as_str().to_owned()),
        )),
        Message::Frame(_) => None,
    }
}

fn frame_to_message(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(text) => Message::text(text),
        WsFrame::Binary(data) => Message::Binary(data),
        WsFrame::Ping(data) => Message::Ping(data),
        WsFrame::Pong(data) => Message::Pong(data),
        WsFrame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

/// [`WsWriter`] over any tungstenite message sink.
pub struct TungsteniteWriter<S> {
    sink: S,
}

impl<S> TungsteniteWriter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S> WsWriter for TungsteniteWriter<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    async fn send_frame(&mut self, frame: WsFrame) -> DmsResult<()> {
        self.sink
            .send(frame_to_message(frame))
            .await
            .map_err(|e| DmsError::connection_lost(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.close().await;
    }

    // tungstenite queues a pong for every ping it reads.
    fn answers_pings(&self) -> bool {
        true
    }
}

/// In-process connector. Each connect hands a [`MemoryPeer`] to the
/// paired [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let refuse = Arc::new(AtomicBool::new(false));
        (
            Self {
                accept_tx,
                refuse: Arc::clone(&refuse),
            },
            MemoryServer { accept_rx, refuse },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _config: &DmsConfig) -> DmsResult<(FrameStream, Box<dyn WsWriter>)> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(DmsError::connect_failed("connection refused"));
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            to_client,
            from_client,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| DmsError::connect_failed("memory server dropped"))?;

        let reader = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();
        Ok((reader, Box::new(MemoryWriter { tx: client_tx })))
    }
}

struct MemoryWriter {
    tx: mpsc::UnboundedSender<WsFrame>,
}

#[async_trait]
impl WsWriter for MemoryWriter {
    async fn send_frame(&mut self, frame: WsFrame) -> DmsResult<()> {
        self.tx
            .send(frame)
            .map_err(|_| DmsError::connection_lost("memory peer closed"))
    }
}

/// Server side of a [`MemoryConnector`].
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    refuse: Arc<AtomicBool>,
}

impl MemoryServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Make subsequent connection attempts fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::Release);
    }
}

/// The server end of one in-memory connection.
///
/// Dropping the peer ends the client's frame stream.
pub struct MemoryPeer {
    to_client: mpsc::UnboundedSender<DmsResult<WsFrame>>,
    from_client: mpsc::UnboundedReceiver<WsFrame>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send_frame(WsFrame::Text(text.into()))
    }

    pub fn send_json(&self, value: &serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn send_frame(&self, frame: WsFrame) -> bool {
        self.to_client.send(Ok(frame)).is_ok()
    }

    /// Make the client's reader yield a transport error.
    pub fn send_error(&self, error: DmsError) -> bool {
        self.to_client.send(Err(error)).is_ok()
    }

    /// Next frame from the client. Pings are answered and skipped.
    pub async fn recv(&mut self) -> Option<WsFrame> {
        loop {
            match self.from_client.recv().await? {
                WsFrame::Ping(data) => {
                    let _ = self.to_client.send(Ok(WsFrame::Pong(data)));
                }
                frame => return Some(frame),
            }
        }
    }

    /// Next text frame from the client; other frames are skipped.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            if let WsFrame::Text(text) = self.recv().await? {
                return Some(text);
            }
        }
    }

    /// Next text frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    /// Send a close frame and hang up.
    pub fn close(self) {
        let _ = self.to_client.send(Ok(WsFrame::Close(None)));
    }
}
