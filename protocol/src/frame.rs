use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::header::{PackageType, RoutingHeader};

/// Sequence, package type and routing length.
const FIXED_HEADER_LEN: usize = 6;
const BODY_LEN_FIELD: usize = 4;
pub const DEFAULT_MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// One protocol frame. The package type stays raw so that unknown types
/// surface at dispatch instead of in the codec.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub sequence: u16,
    pub package_type: u16,
    pub routing: RoutingHeader,
    pub body: Bytes,
}

impl Frame {
    pub fn new(
        sequence: u16,
        package_type: PackageType,
        routing: RoutingHeader,
        body: Bytes,
    ) -> Self {
        Self {
            sequence,
            package_type: package_type as u16,
            routing,
            body,
        }
    }

    pub fn kind(&self) -> Result<PackageType, ProtocolError> {
        PackageType::try_from(self.package_type)
    }
}

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_body_len: usize,
}

impl FrameCodec {
    pub fn new(max_body_len: usize) -> Self {
        Self { max_body_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BODY_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < FIXED_HEADER_LEN {
            return Ok(None);
        }
        let routing_len = u16::from_be_bytes([src[4], src[5]]) as usize;
        let header_len = FIXED_HEADER_LEN + routing_len + BODY_LEN_FIELD;
        if src.len() < header_len {
            src.reserve(header_len - src.len());
            return Ok(None);
        }

        let len_offset = FIXED_HEADER_LEN + routing_len;
        let body_len = u32::from_be_bytes([
            src[len_offset],
            src[len_offset + 1],
            src[len_offset + 2],
            src[len_offset + 3],
        ]) as usize;
        if body_len > self.max_body_len {
            return Err(ProtocolError::FrameTooLarge {
                len: body_len,
                max: self.max_body_len,
            });
        }
        if src.len() < header_len + body_len {
            src.reserve(header_len + body_len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(header_len + body_len);
        let sequence = frame.get_u16();
        let package_type = frame.get_u16();
        frame.advance(2);
        let routing_bytes = frame.split_to(routing_len);
        let routing = if routing_len == 0 {
            RoutingHeader::direct()
        } else {
            let config = bincode::config::standard();
            bincode::serde::decode_from_slice::<RoutingHeader, _>(&routing_bytes, config)?.0
        };
        frame.advance(BODY_LEN_FIELD);

        Ok(Some(Frame {
            sequence,
            package_type,
            routing,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.body.len() > self.max_body_len {
            return Err(ProtocolError::FrameTooLarge {
                len: frame.body.len(),
                max: self.max_body_len,
            });
        }
        // Direct routing is encoded as an empty routing section
        let routing = if frame.routing == RoutingHeader::direct() {
            Vec::new()
        } else {
            bincode::serde::encode_to_vec(&frame.routing, bincode::config::standard())?
        };

        dst.reserve(FIXED_HEADER_LEN + routing.len() + BODY_LEN_FIELD + frame.body.len());
        dst.put_u16(frame.sequence);
        dst.put_u16(frame.package_type);
        dst.put_u16(routing.len() as u16);
        dst.extend_from_slice(&routing);
        dst.put_u32(frame.body.len() as u32);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{NodeAddr, RegionId, RoutingHop};
    use proptest::prelude::*;

    fn sample_frame() -> Frame {
        let hop = RoutingHop {
            node: NodeAddr::new("node-a", 50505),
            regions: vec![RegionId(1), RegionId(7)],
        };
        Frame::new(
            4711,
            PackageType::InsertTuple,
            RoutingHeader::routed(vec![hop]),
            Bytes::from_static(b"payload"),
        )
    }

    #[test]
    fn decodes_only_once_the_whole_frame_arrived() {
        let mut codec = FrameCodec::default();
        let mut encoded = BytesMut::new();
        codec.encode(sample_frame(), &mut encoded).unwrap();

        let total = encoded.len();
        let mut partial = encoded.split_to(total - 3);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.unsplit(encoded);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(sample_frame()));
        assert!(partial.is_empty());
    }

    #[test]
    fn sequence_is_preserved_for_back_to_back_frames() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        for seq in [1u16, u16::MAX] {
            let frame =
                Frame::new(seq, PackageType::Success, RoutingHeader::direct(), Bytes::new());
            codec.encode(frame, &mut buf).unwrap();
        }
        assert_eq!(codec.decode(&mut buf).unwrap().map(|f| f.sequence), Some(1));
        assert_eq!(codec.decode(&mut buf).unwrap().map(|f| f.sequence), Some(u16::MAX));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn oversized_frames_are_rejected_before_buffering() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_u16(PackageType::Success as u16);
        buf.put_u16(0);
        buf.put_u32(1024);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { len: 1024, max: 4 })
        ));
    }

    proptest! {
        #[test]
        fn chunked_streams_decode_to_the_same_frames(
            frames in prop::collection::vec(
                (any::<u16>(), prop::collection::vec(any::<u8>(), 0..64)),
                1..8,
            ),
            chunk in 1usize..32,
        ) {
            let frames = frames
                .into_iter()
                .map(|(seq, body)| {
                    Frame::new(seq, PackageType::Tuple, RoutingHeader::direct(), Bytes::from(body))
                })
                .collect::<Vec<_>>();
            let mut codec = FrameCodec::default();
            let mut encoded = BytesMut::new();
            for frame in &frames {
                codec.encode(frame.clone(), &mut encoded).unwrap();
            }

            let mut received = BytesMut::new();
            let mut decoded = Vec::new();
            for piece in encoded.chunks(chunk) {
                received.extend_from_slice(piece);
                while let Some(frame) = codec.decode(&mut received).unwrap() {
                    decoded.push(frame);
                }
            }
            prop_assert_eq!(decoded, frames);
            prop_assert!(received.is_empty());
        }
    }
}
