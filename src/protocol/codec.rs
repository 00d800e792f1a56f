use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::Error;
use super::frame::Frame;

/// Datagram codec for smart cell frames
///
/// The link layer hands over whole frames, so one call to `decode`
/// consumes the entire buffer.
#[derive(Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new frame codec
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split();
        Frame::decode(&datagram).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ShortAddress;

    #[test]
    fn test_codec_request_frame() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::new();

        let frame = Frame::Request { serial: 0xCAFE_0001 };
        codec.encode(frame.clone(), &mut bytes).unwrap();
        assert_eq!(bytes.len(), Frame::REQUEST_LEN);

        let decoded = codec.decode(&mut bytes).unwrap();
        assert_eq!(decoded, Some(frame));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_codec_empty_buffer() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::new();
        assert_eq!(codec.decode(&mut bytes).unwrap(), None);
    }

    #[test]
    fn test_codec_consumes_bad_datagram() {
        let mut codec = FrameCodec::new();
        let mut bytes = BytesMut::from(&[0x01u8, 0x00][..]);
        assert!(codec.decode(&mut bytes).is_err());
        assert!(bytes.is_empty());

        let mut bytes = BytesMut::new();
        codec
            .encode(
                Frame::Response {
                    address: ShortAddress(0x0042),
                },
                &mut bytes,
            )
            .unwrap();
        assert_eq!(&bytes[..], &[0x01, 0x00, 0x42]);
    }
}
