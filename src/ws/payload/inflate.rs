use bytes::{Bytes, BytesMut};
use miniz_oxide::{
    inflate::stream::{inflate, InflateState},
    DataFormat, MZError, MZFlush, MZStatus,
};
use snafu::prelude::*;

/// Trailer of a sync flush, marks the end of one message in the compressed stream
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

const OUTPUT_CHUNK_SIZE: usize = 32 * 1024;

/// Error when inflate the compressed stream
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum DecompressError {
    /// inflate context returned an error
    #[snafu(display("inflate failed: {status:?}"))]
    Inflate {
        /// error status
        status: MZError,
    },

    /// compressed stream was finished by the remote, no more message can be read
    #[snafu(display("compressed stream already ended"))]
    StreamEnded,
}

/// Decompressor for a zlib stream that spans the whole connection.
///
/// Frames are buffered until the buffered input ends with [ZLIB_SUFFIX],
/// then the buffer is inflated as one message. The inflate context is kept
/// between messages, so one instance must be used for exactly one connection.
pub struct ZlibStream {
    state: Box<InflateState>,
    buffer: BytesMut,
    output: Vec<u8>,
    ended: bool,
}

impl std::fmt::Debug for ZlibStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibStream")
            .field("buffered", &self.buffer.len())
            .field("ended", &self.ended)
            .finish()
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStream {
    /// Create a decompressor with a fresh inflate context
    pub fn new() -> Self {
        Self {
            state: InflateState::new_boxed(DataFormat::Zlib),
            buffer: BytesMut::new(),
            output: vec![0; OUTPUT_CHUNK_SIZE],
            ended: false,
        }
    }

    /// Bytes received but not yet inflated
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Push one frame, returns the decompressed message if this frame completes one.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Bytes>, DecompressError> {
        ensure!(!self.ended, error::StreamEnded);

        self.buffer.extend_from_slice(frame);

        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            log::trace!(
                "Compressed frame is partial, {} bytes buffered",
                self.buffer.len()
            );
            return Ok(None);
        }

        let input = self.buffer.split().freeze();
        self.inflate_message(&input).map(Some)
    }

    fn inflate_message(&mut self, mut input: &[u8]) -> Result<Bytes, DecompressError> {
        let mut message = BytesMut::with_capacity(input.len() * 4);

        loop {
            let result = inflate(&mut self.state, input, &mut self.output, MZFlush::Sync);

            input = &input[result.bytes_consumed..];
            message.extend_from_slice(&self.output[..result.bytes_written]);

            let output_full = result.bytes_written == self.output.len();

            match result.status {
                Ok(MZStatus::StreamEnd) => {
                    log::debug!("Compressed stream ended by remote");
                    self.ended = true;
                    break;
                }
                Ok(_) => {
                    if input.is_empty() && !output_full {
                        break;
                    }
                }
                // no progress possible, everything available has been inflated
                Err(MZError::Buf) if input.is_empty() => break,
                Err(status) => return error::Inflate { status }.fail(),
            }
        }

        log::trace!("Inflated message of {} bytes", message.len());

        Ok(message.freeze())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use miniz_oxide::deflate::{
        core::{create_comp_flags_from_zip_params, CompressorOxide},
        stream::deflate,
    };

    /// zlib stream compressor that sync-flushes after every message, like the remote does
    pub(crate) struct Compressor {
        inner: Box<CompressorOxide>,
    }

    impl Compressor {
        pub(crate) fn new() -> Self {
            Self {
                inner: Box::new(CompressorOxide::new(create_comp_flags_from_zip_params(
                    6, 15, 0,
                ))),
            }
        }

        pub(crate) fn compress(&mut self, mut data: &[u8]) -> Vec<u8> {
            let mut out = Vec::new();
            let mut buf = vec![0; 64 * 1024];
            loop {
                let result = deflate(&mut self.inner, data, &mut buf, MZFlush::Sync);
                data = &data[result.bytes_consumed..];
                out.extend_from_slice(&buf[..result.bytes_written]);
                result.status.unwrap();
                if data.is_empty() && result.bytes_written < buf.len() {
                    break;
                }
            }
            out
        }
    }

    fn message(n: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..n {
            data.extend_from_slice(
                format!(r#"{{"op":0,"s":{},"t":"MESSAGE_CREATE","d":{{"i":{}}}}}"#, i, i)
                    .as_bytes(),
            );
        }
        data
    }

    #[test]
    fn test_compressed_message_ends_with_suffix() {
        let compressed = Compressor::new().compress(b"{\"op\":11}");
        assert!(compressed.ends_with(&ZLIB_SUFFIX));
    }

    #[test]
    fn test_whole_message_in_one_frame() {
        let original = message(3);
        let compressed = Compressor::new().compress(&original);

        let mut stream = ZlibStream::new();
        let out = stream.push(&compressed).unwrap().unwrap();

        assert_eq!(&out[..], &original[..]);
        assert_eq!(stream.buffered(), 0);
    }

    #[test]
    fn test_fragmented_message_emitted_only_after_last_fragment() {
        let original = message(200);
        let compressed = Compressor::new().compress(&original);

        for fragment_size in [1, 3, 7, 64, 1000] {
            let mut stream = ZlibStream::new();
            let chunks: Vec<_> = compressed.chunks(fragment_size).collect();
            let last = chunks.len() - 1;

            let mut outputs = Vec::new();
            for (i, chunk) in chunks.into_iter().enumerate() {
                if let Some(out) = stream.push(chunk).unwrap() {
                    assert_eq!(i, last, "fragment size {}", fragment_size);
                    outputs.push(out);
                }
            }

            assert_eq!(outputs.len(), 1, "fragment size {}", fragment_size);
            assert_eq!(&outputs[0][..], &original[..]);
        }
    }

    #[test]
    fn test_context_is_shared_between_messages() {
        let mut compressor = Compressor::new();
        let mut stream = ZlibStream::new();

        let first = message(20);
        let second = message(21);

        let out = stream.push(&compressor.compress(&first)).unwrap().unwrap();
        assert_eq!(&out[..], &first[..]);

        // second chunk has no zlib header and back-references the first message
        let out = stream.push(&compressor.compress(&second)).unwrap().unwrap();
        assert_eq!(&out[..], &second[..]);
    }

    #[test]
    fn test_large_message_spanning_output_chunks() {
        let original = message(5000);
        assert!(original.len() > OUTPUT_CHUNK_SIZE * 4);

        let compressed = Compressor::new().compress(&original);
        let out = ZlibStream::new().push(&compressed).unwrap().unwrap();

        assert_eq!(out.len(), original.len());
        assert_eq!(&out[..], &original[..]);
    }
}
