//! Core types and traits for the smart cell network stack
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod serde;
pub mod types;

pub use self::error::{Error, ErrorKind, Result};
pub use self::types::{
    ConnectionStatus,
    FrameKind,
    JoinFlag,
    JoinTiming,
    MeasurementRecord,
    NodeConfig,
    PanId,
    ScanConfig,
    ShortAddress,
    TransmitStatus,
    TxOrigin,
    TxStatus,
};

/// Maximum application payload of a single frame in bytes
pub const MAX_FRAME_SIZE: usize = 40;

/// Lower bound of the measurement interval in seconds
pub const MEAS_INTERVAL_MIN_SECS: u32 = 3;

/// Join hopping sequence of the 2.4 GHz region
pub const JOIN_HOPPING_SEQUENCE: [u8; 3] = [18, 11, 22];
