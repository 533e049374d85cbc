use std::task::Poll;

use futures_util::{Stream, StreamExt};
use snafu::prelude::*;

use super::{DecompressError, ParsePayloadError, Payload, ZlibStream};
use crate::ws::transport::{CloseStatus, Frame, TransportError};

/// Error when read payloads from a transport
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum PayloadStreamError {
    /// underlying transport broken
    #[snafu(display("underlying transport broken: {source}"))]
    Transport {
        /// source error
        source: TransportError,
    },

    /// remote sent a close frame
    #[snafu(display("transport closed by remote with status {status}"))]
    Closed {
        /// close status, 1006 if the frame carried none
        status: CloseStatus,
    },

    /// compressed stream is corrupted
    #[snafu(display("decompress frame failed: {source}"))]
    Decompress {
        /// source error
        source: DecompressError,
    },

    /// frame content is not a valid payload
    #[snafu(display("parse frame to payload failed: {source}"))]
    ParsePayloadFailed {
        /// source error
        source: ParsePayloadError,
    },
}

impl PayloadStreamError {
    /// Check if this error will make the stream stop
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::ParsePayloadFailed { .. })
    }

    /// Close status this error ends the connection with, as seen from the remote side
    pub fn close_status(&self) -> Option<&CloseStatus> {
        match self {
            Self::Closed { status } => Some(status),
            _ => None,
        }
    }
}

/// Payload stream of one connection.
///
/// When `compress` is enabled, binary frames are fed to a connection scoped
/// [ZlibStream], text frames are always parsed as is.
#[derive(Debug)]
pub struct PayloadStream<S> {
    frames: S,
    inflater: Option<ZlibStream>,
}

impl<S> PayloadStream<S> {
    /// Construct a new stream with underlying frame stream.
    pub fn new(frames: S, compress: bool) -> Self {
        Self {
            frames,
            inflater: compress.then(ZlibStream::new),
        }
    }

    fn parse(data: &[u8]) -> Result<Payload, PayloadStreamError> {
        Payload::decode(data).map_err(|source| {
            log::trace!(
                "Parse failed payload data: {}",
                std::str::from_utf8(data).unwrap_or("<not-utf8-binary>")
            );
            PayloadStreamError::ParsePayloadFailed { source }
        })
    }
}

impl<S> Stream for PayloadStream<S>
where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    type Item = Result<Payload, PayloadStreamError>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            let frame = match self.frames.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(frame)) => frame.context(error::Transport)?,
            };

            let result = match frame {
                Frame::Text(text) => Self::parse(text.as_bytes()),
                Frame::Binary(data) => match self.inflater.as_mut() {
                    Some(inflater) => match inflater.push(&data).context(error::Decompress)? {
                        Some(message) => Self::parse(&message),
                        None => continue,
                    },
                    None => Self::parse(&data),
                },
                Frame::Close(status) => {
                    let status = status.unwrap_or_else(CloseStatus::abnormal);
                    error::Closed { status }.fail()
                }
            };

            return Poll::Ready(Some(result));
        }
    }
}
