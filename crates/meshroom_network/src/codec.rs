//! Envelope codec: newline-delimited JSON framing.
//!
//! Each envelope is serialized as one JSON object followed by `\n`. JSON
//! escapes control characters inside strings, so a frame never contains a
//! bare newline and many envelopes can be written back-to-back on one
//! stream. The codec never looks inside `payload`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::NetworkError;
use crate::message::Envelope;

/// Upper bound on a single encoded envelope, newline excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Serialize an envelope into one self-delimiting frame. Fails with
/// `FrameTooLarge` when the peer would refuse to decode it.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, NetworkError> {
    encode_within(envelope, MAX_FRAME_LEN)
}

fn encode_within(envelope: &Envelope, max: usize) -> Result<Vec<u8>, NetworkError> {
    let mut bytes = serde_json::to_vec(envelope)?;
    if bytes.len() > max {
        return Err(NetworkError::FrameTooLarge {
            len: bytes.len(),
            max,
        });
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse a single frame. Surrounding whitespace (including the trailing
/// newline) is ignored.
pub fn decode(bytes: &[u8]) -> Result<Envelope, NetworkError> {
    serde_json::from_slice(bytes.trim_ascii())
        .map_err(|e| NetworkError::MalformedEnvelope(e.to_string()))
}

/// `tokio-util` codec used on every peer connection.
#[derive(Debug)]
pub struct EnvelopeCodec {
    lines: LinesCodec,
    max_frame_len: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max),
            max_frame_len: max,
        }
    }

    fn next_line(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> Result<Option<Envelope>, NetworkError> {
        loop {
            let line = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            }
            .map_err(lines_error)?;

            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode(line.as_bytes()).map(Some),
                None => return Ok(None),
            }
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn lines_error(err: LinesCodecError) -> NetworkError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            NetworkError::MalformedEnvelope("frame exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            NetworkError::MalformedEnvelope(e.to_string())
        }
        LinesCodecError::Io(e) => NetworkError::Io(e),
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, NetworkError> {
        self.next_line(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, NetworkError> {
        self.next_line(src, true)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), NetworkError> {
        let frame = encode_within(&item, self.max_frame_len)?;
        dst.reserve(frame.len());
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
