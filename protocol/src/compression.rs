//! Gzip envelope bundling several frames into one.

use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::{Frame, FrameCodec};
use crate::header::{PackageType, RoutingHeader};

/// Envelopes are never answered, so they do not consume a sequence number.
pub const ENVELOPE_SEQUENCE: u16 = 0;

pub fn pack(frames: Vec<Frame>) -> Result<Frame, ProtocolError> {
    let mut codec = FrameCodec::default();
    let mut plain = BytesMut::new();
    for frame in frames {
        codec.encode(frame, &mut plain)?;
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&plain)?;
    let compressed = encoder.finish()?;

    Ok(Frame::new(
        ENVELOPE_SEQUENCE,
        PackageType::Compression,
        RoutingHeader::direct(),
        Bytes::from(compressed),
    ))
}

pub fn unpack(envelope: &Frame) -> Result<Vec<Frame>, ProtocolError> {
    let mut plain = Vec::new();
    GzDecoder::new(&envelope.body[..]).read_to_end(&mut plain)?;

    let mut codec = FrameCodec::default();
    let mut buffer = BytesMut::from(&plain[..]);
    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buffer)? {
        if frame.kind()? == PackageType::Compression {
            return Err(ProtocolError::NestedEnvelope);
        }
        frames.push(frame);
    }
    if !buffer.is_empty() {
        return Err(ProtocolError::TrailingBytes(buffer.len()));
    }
    Ok(frames)
}
