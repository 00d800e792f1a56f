use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::schedule::SlotframeLayout;

/// Link-layer short address of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShortAddress(pub u16);

impl ShortAddress {
    /// The null address, used as "no candidate"
    pub const NULL: ShortAddress = ShortAddress(0x0000);

    /// The broadcast address
    pub const BROADCAST: ShortAddress = ShortAddress(0xFFFF);

    /// Returns true if this is the null address
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Returns the raw value
    pub fn get(&self) -> u16 {
        self.0
    }

    /// Network-order byte representation
    pub fn to_be_bytes(&self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Builds an address from network-order bytes
    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        ShortAddress(u16::from_be_bytes(bytes))
    }
}

impl fmt::Display for ShortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

impl From<u16> for ShortAddress {
    fn from(value: u16) -> Self {
        ShortAddress(value)
    }
}

/// Personal area network identifier
pub type PanId = u16;

/// Frame type discriminant carried in the first byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Join request, node to coordinator
    Request = 0,
    /// Join response, coordinator to node
    Response = 1,
    /// Join successful confirmation, node to coordinator
    Successful = 2,
    /// Measurement report
    Measurement = 3,
    /// Remote configuration or command, coordinator to node
    Remote = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = super::Error;

    fn try_from(value: u8) -> super::Result<Self> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Successful),
            3 => Ok(FrameKind::Measurement),
            4 => Ok(FrameKind::Remote),
            other => Err(super::Error::UndefinedFrameType(other)),
        }
    }
}

/// Join mode advertised in a beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinFlag {
    /// The coordinator's manual join window is open
    ManualJoinOpen,
    /// Normal beacon, only known members may reattach
    ManualJoinClosed,
}

/// Membership status of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connected,
}

/// Outcome of a link-layer transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    NoAck,
    Collision,
    Deferred,
    Err,
    ErrFatal,
    Busy,
}

impl TxStatus {
    /// Returns true for a delivered frame
    pub fn is_ok(&self) -> bool {
        matches!(self, TxStatus::Ok)
    }
}

/// Subsystem that queued a transmission
///
/// Travels with the frame through the link layer and comes back in the
/// completion event so the dispatcher can route the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxOrigin {
    Join,
    Telemetry,
}

/// Transmission outcome reported to the measurement source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitStatus {
    Success,
    Fail,
}

/// A captured measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRecord {
    /// Network absolute time of capture, in seconds
    pub timestamp: u32,
    /// Opaque measurement payload
    pub value: Bytes,
}

impl MeasurementRecord {
    /// Creates a new measurement record
    pub fn new(timestamp: u32, value: impl Into<Bytes>) -> Self {
        MeasurementRecord {
            timestamp,
            value: value.into(),
        }
    }
}

/// Join protocol timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinTiming {
    /// Time allowed to get a join request delivered
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub request_timeout: Duration,
    /// Time allowed for the coordinator's response to arrive
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub response_timeout: Duration,
    /// Time allowed to get the join confirmation delivered
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub successful_timeout: Duration,
    /// Interval between join frame transmissions
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub retry_interval: Duration,
    /// Wait after a failed rejoin scan
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub rejoin_backoff: Duration,
    /// Time allowed for the link layer to associate after a scan
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub association_timeout: Duration,
}

impl JoinTiming {
    /// Overall handshake budget, the sum of the three phase timeouts
    pub fn handshake_timeout(&self) -> Duration {
        self.request_timeout + self.response_timeout + self.successful_timeout
    }
}

impl Default for JoinTiming {
    fn default() -> Self {
        JoinTiming {
            request_timeout: Duration::from_secs(120),
            response_timeout: Duration::from_secs(420),
            successful_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_secs(3),
            rejoin_backoff: Duration::from_secs(5 * 60),
            association_timeout: Duration::from_secs(120),
        }
    }
}

/// Beacon scan parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Total scan duration
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub duration: Duration,
    /// Listening time per channel
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub channel_dwell: Duration,
    /// Join hopping sequence swept round-robin
    pub channels: Vec<u8>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            duration: Duration::from_secs(30),
            channel_dwell: Duration::from_secs(5),
            channels: super::JOIN_HOPPING_SEQUENCE.to_vec(),
        }
    }
}

/// Configuration for a smart cell node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Join protocol timing
    pub timing: JoinTiming,
    /// Beacon scan parameters
    pub scan: ScanConfig,
    /// Shared TDMA schedule layout
    pub layout: SlotframeLayout,
    /// Transmission budget for join frames (1 send + retries)
    pub join_transmissions: u8,
    /// Transmission budget for measurement frames (1 send + retries)
    pub measurement_transmissions: u8,
    /// Number of unsent measurements the default source retains
    pub measurement_retention: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            timing: JoinTiming::default(),
            scan: ScanConfig::default(),
            layout: SlotframeLayout::default(),
            join_transmissions: 8,
            measurement_transmissions: 2,
            measurement_retention: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_address() {
        assert!(ShortAddress::NULL.is_null());
        assert!(!ShortAddress::BROADCAST.is_null());
        let addr = ShortAddress(0x1234);
        assert_eq!(addr.to_be_bytes(), [0x12, 0x34]);
        assert_eq!(ShortAddress::from_be_bytes([0x12, 0x34]), addr);
        assert_eq!(addr.to_string(), "1234");
    }

    #[test]
    fn test_default_address_is_null() {
        assert_eq!(ShortAddress::default(), ShortAddress::NULL);
        assert!(ShortAddress::default().is_null());
    }

    #[test]
    fn test_frame_kind_discriminant() {
        assert_eq!(FrameKind::try_from(0).unwrap(), FrameKind::Request);
        assert_eq!(FrameKind::try_from(4).unwrap(), FrameKind::Remote);
        assert!(matches!(
            FrameKind::try_from(5),
            Err(super::super::Error::UndefinedFrameType(5))
        ));
        assert_eq!(FrameKind::Measurement as u8, 3);
    }

    #[test]
    fn test_handshake_timeout_is_phase_sum() {
        let timing = JoinTiming::default();
        assert_eq!(timing.handshake_timeout(), Duration::from_secs(570));
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = NodeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: NodeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, config);
        assert_eq!(decoded.scan.channels, vec![18, 11, 22]);
    }
}
