//! Websocket transport for agent channels.
//!
//! Two wire formats share the same endpoints:
//!
//! - **Legacy**: one binary websocket message carries exactly one packet.
//! - **Framed**: a binary message carries one or more frames
//!   `[F0 A0 60 30][u32 LE length][payload]`.
//!
//! The format is chosen once per connection, either up front (the client
//! asks for framing with the `X-Vxp-Framing: framed` header) or from the
//! first binary message read, and never re-checked. Writes before that
//! read use the legacy format without deciding it.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use vxproto_hub::{Inbound, Transport, TransportError};

/// Marker opening every frame in framed mode.
pub const FRAME_MAGIC: [u8; 4] = [0xF0, 0xA0, 0x60, 0x30];
/// Request header a client uses to ask for framed mode.
pub const FRAMING_HEADER: &str = "x-vxp-framing";
pub const FRAMING_FRAMED: &str = "framed";

const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    Legacy,
    Framed,
}

/// Picks the wire format from the first binary message of a connection.
pub fn detect_mode(first: &[u8]) -> FrameMode {
    if first.len() >= FRAME_HEADER_LEN && first[..4] == FRAME_MAGIC {
        FrameMode::Framed
    } else {
        FrameMode::Legacy
    }
}

pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits a framed-mode message into its payloads.
pub fn decode_frames(mut message: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
    let mut frames = Vec::new();
    while !message.is_empty() {
        if message.len() < FRAME_HEADER_LEN || message[..4] != FRAME_MAGIC {
            return Err(TransportError::Framing("missing frame marker".to_string()));
        }
        let len = u32::from_le_bytes([message[4], message[5], message[6], message[7]]) as usize;
        let body = &message[FRAME_HEADER_LEN..];
        if body.len() < len {
            return Err(TransportError::Framing(format!(
                "frame declares {} bytes, {} available",
                len,
                body.len()
            )));
        }
        frames.push(body[..len].to_vec());
        message = &body[len..];
    }
    Ok(frames)
}

/// A websocket message as seen by the transport.
#[derive(Debug)]
pub enum WsFrame {
    Binary(Vec<u8>),
    Pong(Vec<u8>),
    Close,
    /// Text, ping and raw frames; pings are answered by the websocket
    /// library itself.
    Ignored,
}

/// Adapts a websocket library's message type.
pub trait WsMessage: Send + Sized + 'static {
    fn binary(data: Vec<u8>) -> Self;
    fn ping(data: Vec<u8>) -> Self;
    fn close() -> Self;
    fn into_frame(self) -> WsFrame;
}

impl WsMessage for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }

    fn ping(data: Vec<u8>) -> Self {
        Self::Ping(data.into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn into_frame(self) -> WsFrame {
        match self {
            Self::Binary(data) => WsFrame::Binary(data.to_vec()),
            Self::Pong(data) => WsFrame::Pong(data.to_vec()),
            Self::Close(_) => WsFrame::Close,
            Self::Text(_) | Self::Ping(_) => WsFrame::Ignored,
        }
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }

    fn ping(data: Vec<u8>) -> Self {
        Self::Ping(data.into())
    }

    fn close() -> Self {
        Self::Close(None)
    }

    fn into_frame(self) -> WsFrame {
        match self {
            Self::Binary(data) => WsFrame::Binary(data.to_vec()),
            Self::Pong(data) => WsFrame::Pong(data.to_vec()),
            Self::Close(_) => WsFrame::Close,
            Self::Text(_) | Self::Ping(_) | Self::Frame(_) => WsFrame::Ignored,
        }
    }
}

struct Reader<R> {
    stream: R,
    pending: VecDeque<Vec<u8>>,
}

/// A websocket connection serving as an agent transport.
///
/// Reads and writes are serialized by separate locks, so one reader task
/// and any number of writers can share the transport. Closing ends a
/// pending read even if the peer never answers.
pub struct WsTransport<S, M> {
    reader: Mutex<Reader<SplitStream<S>>>,
    writer: Mutex<SplitSink<S, M>>,
    mode: OnceLock<FrameMode>,
    write_timeout: Duration,
    closed: CancellationToken,
}

impl<S, M, E> WsTransport<S, M>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin + Send + 'static,
    M: WsMessage,
    E: Display + Send + 'static,
{
    /// Wraps a websocket. `mode` fixes the wire format up front; `None`
    /// detects it from the first binary message read.
    pub fn new(socket: S, write_timeout: Duration, mode: Option<FrameMode>) -> Self {
        let (writer, stream) = socket.split();
        let frozen = OnceLock::new();
        if let Some(mode) = mode {
            let _ = frozen.set(mode);
        }
        Self {
            reader: Mutex::new(Reader {
                stream,
                pending: VecDeque::new(),
            }),
            writer: Mutex::new(writer),
            mode: frozen,
            write_timeout,
            closed: CancellationToken::new(),
        }
    }

    /// The wire format, once decided.
    pub fn mode(&self) -> Option<FrameMode> {
        self.mode.get().copied()
    }

    async fn send_message(&self, message: M) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, writer.send(message)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) => Err(TransportError::Io(e.to_string())),
            Ok(Ok(())) => Ok(()),
        }
    }
}

#[async_trait]
impl<S, M, E> Transport for WsTransport<S, M>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin + Send + 'static,
    M: WsMessage,
    E: Display + Send + 'static,
{
    async fn read(&self) -> Result<Option<Inbound>, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            if let Some(packet) = reader.pending.pop_front() {
                return Ok(Some(Inbound::Packet(packet)));
            }

            let next = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                next = reader.stream.next() => next,
            };
            let message = match next {
                None => return Ok(None),
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(message)) => message,
            };

            match message.into_frame() {
                WsFrame::Binary(data) => {
                    let mode = *self.mode.get_or_init(|| {
                        let mode = detect_mode(&data);
                        tracing::debug!(?mode, "wire format detected");
                        mode
                    });
                    match mode {
                        FrameMode::Legacy => return Ok(Some(Inbound::Packet(data))),
                        FrameMode::Framed => {
                            let frames = decode_frames(&data)?;
                            reader.pending.extend(frames);
                        }
                    }
                }
                WsFrame::Pong(payload) => return Ok(Some(Inbound::Pong(payload))),
                WsFrame::Close => return Ok(None),
                WsFrame::Ignored => {}
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        // Nothing read yet: legacy, until the first read decides.
        let framed = match self.mode.get().copied().unwrap_or(FrameMode::Legacy) {
            FrameMode::Legacy => data.to_vec(),
            FrameMode::Framed => encode_frame(data),
        };
        self.send_message(M::binary(framed)).await
    }

    async fn ping(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.send_message(M::ping(payload.to_vec())).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        if let Err(e) = self.send_message(M::close()).await {
            tracing::debug!(error = %e, "close frame not sent, peer already gone");
        }
        let mut writer = self.writer.lock().await;
        let _ = tokio::time::timeout(self.write_timeout, writer.close()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    type TestTransport = WsTransport<WebSocketStream<DuplexStream>, Message>;

    /// A server-side transport over an in-memory pipe, and the client end.
    async fn pipe(mode: Option<FrameMode>) -> (TestTransport, WebSocketStream<DuplexStream>) {
        let (server, client) = tokio::io::duplex(256 * 1024);
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        (WsTransport::new(server, Duration::from_millis(200), mode), client)
    }

    #[test]
    fn detection_looks_at_the_marker() {
        assert_eq!(detect_mode(&encode_frame(b"x")), FrameMode::Framed);
        assert_eq!(detect_mode(&encode_frame(b"")), FrameMode::Framed);
        assert_eq!(detect_mode(b"\x0a\x04main"), FrameMode::Legacy);
        assert_eq!(detect_mode(&FRAME_MAGIC), FrameMode::Legacy);
    }

    #[test]
    fn several_frames_share_one_message() {
        let mut message = encode_frame(b"first");
        message.extend(encode_frame(b""));
        message.extend(encode_frame(b"third"));
        let frames = decode_frames(&message).unwrap();
        assert_eq!(frames, vec![b"first".to_vec(), vec![], b"third".to_vec()]);
    }

    #[test]
    fn truncated_or_unmarked_frames_are_rejected() {
        let message = encode_frame(b"payload");
        assert!(decode_frames(&message[..message.len() - 1]).is_err());
        assert!(decode_frames(&message[..6]).is_err());

        let mut trailing = encode_frame(b"ok");
        trailing.extend_from_slice(b"junk");
        assert!(matches!(decode_frames(&trailing), Err(TransportError::Framing(_))));
    }

    #[tokio::test]
    async fn early_write_does_not_fix_the_format() {
        let (transport, mut client) = pipe(None).await;

        transport.write(b"hello").await.unwrap();
        assert_eq!(transport.mode(), None);
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected message {:?}", other),
        }

        let mut batch = encode_frame(b"one");
        batch.extend(encode_frame(b"two"));
        client.send(Message::Binary(batch.into())).await.unwrap();
        for expected in [b"one", b"two"] {
            match transport.read().await.unwrap() {
                Some(Inbound::Packet(data)) => assert_eq!(&data[..], expected),
                other => panic!("unexpected read {:?}", other),
            }
        }
        assert_eq!(transport.mode(), Some(FrameMode::Framed));

        transport.write(b"reply").await.unwrap();
        match client.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data.to_vec(), encode_frame(b"reply")),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_ends_a_read_on_a_silent_peer() {
        let (transport, _client) = pipe(Some(FrameMode::Legacy)).await;
        let transport = Arc::new(transport);

        let reading = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.read().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reading.is_finished());

        transport.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), reading)
            .await
            .expect("read still blocked after close")
            .unwrap();
        assert!(matches!(result, Ok(None)));
    }
}
