use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::core::{ShortAddress, TxOrigin, TxStatus};
use crate::protocol::{Frame, FrameCodec};
use crate::util::hex;
use super::{BeaconInfo, LinkEvent};

/// Destination of a link event
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Join protocol frame
    Join {
        source: ShortAddress,
        frame: Frame,
    },
    /// Remote command for the downlink handler
    Downlink(Bytes),
    /// Completion of a join frame
    JoinTxDone(TxStatus),
    /// Completion of a measurement frame
    TelemetryTxDone(TxStatus),
    Beacon(BeaconInfo),
    Associated,
    AssociationFailed,
    CycleStart,
    LeftNetwork,
    /// Nothing to do
    Discard,
}

/// Decodes received frames and routes link events to their owner
pub struct Dispatcher {
    codec: FrameCodec,
    recv_buffer: BytesMut,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a new dispatcher
    pub fn new() -> Self {
        Dispatcher {
            codec: FrameCodec::new(),
            recv_buffer: BytesMut::with_capacity(crate::core::MAX_FRAME_SIZE),
        }
    }

    /// Decides which component handles `event`
    pub fn route(&mut self, event: LinkEvent) -> Route {
        match event {
            LinkEvent::TxDone { origin, status } => {
                trace!(?origin, ?status, "Tx done");
                match origin {
                    TxOrigin::Join => Route::JoinTxDone(status),
                    TxOrigin::Telemetry => Route::TelemetryTxDone(status),
                }
            }
            LinkEvent::Received { source, payload } => self.route_frame(source, &payload),
            LinkEvent::Beacon(beacon) => Route::Beacon(beacon),
            LinkEvent::Associated => Route::Associated,
            LinkEvent::AssociationFailed => Route::AssociationFailed,
            LinkEvent::CycleStart => Route::CycleStart,
            LinkEvent::LeftNetwork => Route::LeftNetwork,
        }
    }

    fn route_frame(&mut self, source: ShortAddress, payload: &[u8]) -> Route {
        debug!(%source, payload = %hex(payload), "Rx frame");
        self.recv_buffer.clear();
        self.recv_buffer.extend_from_slice(payload);

        let frame = match self.codec.decode(&mut self.recv_buffer) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(%source, "Empty frame");
                return Route::Discard;
            }
            Err(e) => {
                warn!(%source, error = %e, "Dropping undecodable frame");
                return Route::Discard;
            }
        };

        match frame {
            Frame::Request { .. } | Frame::Response { .. } | Frame::Successful => {
                Route::Join { source, frame }
            }
            Frame::Remote { payload } => Route::Downlink(payload),
            Frame::Measurement { .. } => {
                debug!(%source, "Ignoring measurement frame");
                Route::Discard
            }
        }
    }
}
