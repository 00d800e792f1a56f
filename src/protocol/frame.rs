use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{Error, FrameKind, Result, ShortAddress, MAX_FRAME_SIZE};

/// Frames exchanged between a smart cell and its coordinator
///
/// Every frame starts with a one-byte discriminant followed by a
/// kind-specific body of fixed layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Join request carrying the device serial
    Request {
        /// Serial number, little-endian on the wire
        serial: u32,
    },

    /// Join response carrying the short address assigned by the coordinator
    Response {
        /// Assigned address, network order on the wire
        address: ShortAddress,
    },

    /// Join successful confirmation, no body
    Successful,

    /// Measurement report
    Measurement {
        /// Network absolute capture time in seconds, little-endian
        timestamp: u32,
        /// Opaque measurement value
        value: Bytes,
    },

    /// Remote command from the coordinator
    Remote {
        /// Opaque command payload
        payload: Bytes,
    },
}

impl Frame {
    /// Length of an encoded Request frame
    pub const REQUEST_LEN: usize = 5;
    /// Length of an encoded Response frame
    pub const RESPONSE_LEN: usize = 3;
    /// Length of an encoded Successful frame
    pub const SUCCESSFUL_LEN: usize = 1;
    /// Minimum length of an encoded Measurement frame
    pub const MEASUREMENT_MIN_LEN: usize = 5;

    /// Returns the discriminant of this frame
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Request { .. } => FrameKind::Request,
            Frame::Response { .. } => FrameKind::Response,
            Frame::Successful => FrameKind::Successful,
            Frame::Measurement { .. } => FrameKind::Measurement,
            Frame::Remote { .. } => FrameKind::Remote,
        }
    }

    /// Number of bytes `encode` produces
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Request { .. } => Self::REQUEST_LEN,
            Frame::Response { .. } => Self::RESPONSE_LEN,
            Frame::Successful => Self::SUCCESSFUL_LEN,
            Frame::Measurement { value, .. } => Self::MEASUREMENT_MIN_LEN + value.len(),
            Frame::Remote { payload } => 1 + payload.len(),
        }
    }

    /// Appends the wire form of this frame to `dst`
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<()> {
        let len = self.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(Error::invalid_parameter(format!(
                "{:?} frame of {} bytes exceeds {} byte payload",
                self.kind(),
                len,
                MAX_FRAME_SIZE
            )));
        }

        dst.reserve(len);
        dst.put_u8(self.kind() as u8);
        match self {
            Frame::Request { serial } => dst.put_u32_le(*serial),
            Frame::Response { address } => dst.put_u16(address.get()),
            Frame::Successful => {}
            Frame::Measurement { timestamp, value } => {
                dst.put_u32_le(*timestamp);
                dst.put_slice(value);
            }
            Frame::Remote { payload } => dst.put_slice(payload),
        }
        Ok(())
    }

    /// Encodes this frame into a standalone buffer
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes a complete frame
    ///
    /// The whole slice is one frame. Lengths must match the kind exactly.
    pub fn decode(src: &[u8]) -> Result<Frame> {
        let (&first, body) = src.split_first().ok_or(Error::NullInput)?;
        let kind = FrameKind::try_from(first)?;

        let check = |expected: usize| {
            if src.len() == expected {
                Ok(())
            } else {
                Err(Error::InvalidLength {
                    kind,
                    expected,
                    actual: src.len(),
                })
            }
        };

        let mut body = body;
        match kind {
            FrameKind::Request => {
                check(Self::REQUEST_LEN)?;
                Ok(Frame::Request {
                    serial: body.get_u32_le(),
                })
            }
            FrameKind::Response => {
                check(Self::RESPONSE_LEN)?;
                Ok(Frame::Response {
                    address: ShortAddress(body.get_u16()),
                })
            }
            FrameKind::Successful => {
                check(Self::SUCCESSFUL_LEN)?;
                Ok(Frame::Successful)
            }
            FrameKind::Measurement => {
                if src.len() < Self::MEASUREMENT_MIN_LEN {
                    return Err(Error::InvalidLength {
                        kind,
                        expected: Self::MEASUREMENT_MIN_LEN,
                        actual: src.len(),
                    });
                }
                let timestamp = body.get_u32_le();
                Ok(Frame::Measurement {
                    timestamp,
                    value: Bytes::copy_from_slice(body),
                })
            }
            FrameKind::Remote => Ok(Frame::Remote {
                payload: Bytes::copy_from_slice(body),
            }),
        }
    }
}
