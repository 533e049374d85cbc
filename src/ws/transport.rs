//! Transport collaborator: a bidirectional frame stream opened per connection attempt.

use std::{fmt::Display, pin::Pin};

use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use snafu::prelude::*;
use tokio_tungstenite::tungstenite::{
    self as websocket,
    protocol::{frame::coding::CloseCode, CloseFrame},
};

/// Status sent or received with a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// close code
    pub code: u16,
    /// human readable reason
    pub reason: String,
}

impl CloseStatus {
    /// 1000, ends the remote session
    pub const NORMAL_CLOSE: u16 = 1000;
    /// 1002, a non 1000/1001 code keeps the remote session resumable
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// 1006, connection dropped without a close frame
    pub const ABNORMAL_CLOSE: u16 = 1006;

    /// Create a close status
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Status used when the transport ends without a close frame
    pub fn abnormal() -> Self {
        Self::new(Self::ABNORMAL_CLOSE, "")
    }
}

impl Display for CloseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

/// One transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// text frame, used by uncompressed json
    Text(String),
    /// binary frame, used by compressed stream
    Binary(Bytes),
    /// close frame, with optional status
    Close(Option<CloseStatus>),
}

/// Error of the underlying transport
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum TransportError {
    /// open a connection failed
    #[snafu(display("connect {url} failed: {source}"))]
    Connect {
        /// target url
        url: String,
        /// source error
        source: websocket::Error,
    },

    /// underlying websocket broken
    #[snafu(display("underlying websocket stream broken: {source}"))]
    Websocket {
        /// source error
        source: websocket::Error,
    },

    /// transport closed, frames can't be sent anymore
    #[snafu(display("transport closed"))]
    Closed,
}

/// Boxed sending half of a transport
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
/// Boxed receiving half of a transport
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An opened connection, split in sending and receiving half
pub struct Transport {
    /// sending half
    pub sink: FrameSink,
    /// receiving half
    pub stream: FrameStream,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    /// Create a transport from two halves
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Frame, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens transports, one per connection attempt
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport to url
    async fn connect(&self, url: &url::Url) -> Result<Transport, TransportError>;
}

/// Websocket [Connector] backed by tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebsocketConnector;

fn into_websocket_message(frame: Frame) -> websocket::Message {
    match frame {
        Frame::Text(text) => websocket::Message::Text(text),
        Frame::Binary(data) => websocket::Message::Binary(data.to_vec()),
        Frame::Close(status) => websocket::Message::Close(status.map(|s| CloseFrame {
            code: CloseCode::from(s.code),
            reason: s.reason.into(),
        })),
    }
}

fn from_websocket_message(message: websocket::Message) -> Option<Frame> {
    match message {
        websocket::Message::Text(text) => Some(Frame::Text(text)),
        websocket::Message::Binary(data) => Some(Frame::Binary(data.into())),
        websocket::Message::Close(frame) => Some(Frame::Close(
            frame.map(|f| CloseStatus::new(u16::from(f.code), f.reason.into_owned())),
        )),
        // ping/pong are answered by tungstenite itself
        _ => None,
    }
}

#[async_trait::async_trait]
impl Connector for WebsocketConnector {
    async fn connect(&self, url: &url::Url) -> Result<Transport, TransportError> {
        log::debug!("Connecting gateway: {}", url);

        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|_| error::Connect {
                url: url.to_string(),
            })?;

        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|source| TransportError::Websocket { source })
            .with(|frame| future::ok::<_, TransportError>(into_websocket_message(frame)));

        let stream = stream.filter_map(|result| {
            future::ready(match result {
                Ok(message) => from_websocket_message(message).map(Ok),
                // remote already closed, the missing close frame is reported as end of stream
                Err(websocket::Error::ConnectionClosed) => None,
                Err(source) => Some(Err(TransportError::Websocket { source })),
            })
        });

        Ok(Transport::new(sink, stream))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_close_frame_conversion() {
        let message = into_websocket_message(Frame::Close(Some(CloseStatus::new(4004, "bad"))));
        let frame = from_websocket_message(message).unwrap();
        assert_eq!(frame, Frame::Close(Some(CloseStatus::new(4004, "bad"))));
    }

    #[test]
    fn test_ping_is_not_a_frame() {
        assert!(from_websocket_message(websocket::Message::Ping(vec![1])).is_none());
    }

    #[test]
    fn test_close_status_display() {
        assert_eq!(CloseStatus::abnormal().to_string(), "1006");
        assert_eq!(
            CloseStatus::new(4004, "Authentication failed.").to_string(),
            "4004 (Authentication failed.)"
        );
    }
}
