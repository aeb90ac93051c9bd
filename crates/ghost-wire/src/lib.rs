//! Wire codec (C2): schema-stable binary encoding of the message kinds in
//! `ghost-common`, framed with a 4-byte length prefix so a stream transport
//! (TCP, a unix socket, or an in-process duplex pipe) can recover message
//! boundaries.
//!
//! Framing is `tokio_util::codec::LengthDelimitedCodec`; the message body is
//! `bincode`. Both ends of a connection must agree on this pair — mixing
//! codecs is a configuration error, not something this crate detects.

use bytes::{Buf, BufMut, BytesMut};
use ghost_common::GhostError;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<WireError> for GhostError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Malformed(msg) => GhostError::MalformedFrame(msg),
            WireError::Io(e) => GhostError::MalformedFrame(e.to_string()),
        }
    }
}

/// Encode a value as a length-prefixed frame body (no length prefix — that
/// is added by [`FrameCodec`] or [`encode_frame`]).
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(value).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Decode a frame body produced by [`encode_body`]. Unknown trailing bytes
/// are rejected; missing optional fields take their `Default` per bincode's
/// normal struct layout rules, giving forward compatibility for fields
/// appended at the end of a struct.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(bytes).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Encode a value as a complete length-prefixed frame, for transports that
/// don't go through `tokio_util`'s `Framed` (e.g. writing directly to a
/// `Vec<u8>` buffer in a test, or an in-process channel).
pub fn encode_frame<T: Serialize>(value: &T) -> Result<BytesMut, WireError> {
    let body = encode_body(value)?;
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_u32(body.len() as u32);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one frame from the front of `buf`, advancing it past the consumed
/// bytes. Returns `Ok(None)` if the buffer does not yet hold a complete
/// frame (the caller should read more and retry).
pub fn decode_frame<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    let body = buf.split_to(len);
    decode_body(&body).map(Some)
}

/// A `tokio_util::codec::{Encoder,Decoder}` for a single message type `T`,
/// built on top of [`LengthDelimitedCodec`] so it can be dropped into
/// `tokio_util::codec::Framed` over any `AsyncRead + AsyncWrite` transport.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src) {
            Ok(Some(frame)) => decode_body(&frame).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(WireError::Io(e)),
        }
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = WireError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_body(&item)?;
        self.inner
            .encode(bytes::Bytes::from(body), dst)
            .map_err(WireError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_common::{EnvelopeKind, Payload, Priority};

    fn sample_envelope() -> ghost_common::Envelope {
        ghost_common::Envelope::new(
            "health:abc",
            Payload::Generic(vec![1, 2, 3, 4]),
            EnvelopeKind::Generic,
            Priority::Normal,
        )
    }

    #[test]
    fn round_trips_an_envelope() {
        let original = sample_envelope();
        let frame = encode_frame(&original).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded: ghost_common::Envelope = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.channel, original.channel);
        assert_eq!(decoded.priority, original.priority);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_frame_waits_for_full_buffer() {
        let original = sample_envelope();
        let frame = encode_frame(&original).unwrap();
        let mut partial = BytesMut::from(&frame[..frame.len() - 1]);
        let result: Option<ghost_common::Envelope> = decode_frame(&mut partial).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn malformed_body_is_reported_not_panicked() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        let result: Result<Option<ghost_common::Envelope>, WireError> = decode_frame(&mut buf);
        assert!(result.is_err());
    }

    #[test]
    fn frame_codec_round_trips_through_bytesmut() {
        let mut codec = FrameCodec::<ghost_common::Envelope>::new();
        let mut buf = BytesMut::new();
        codec.encode(sample_envelope(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.channel, "health:abc");
    }
}
