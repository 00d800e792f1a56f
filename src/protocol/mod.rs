//! Join protocol implementation module
//!
//! This module defines the smart cell frames, their encoding/decoding,
//! the join handshake state machine and the join/rejoin engine.

pub mod codec;
pub mod engine;
pub mod frame;
pub mod state;

pub use self::codec::FrameCodec;
pub use self::engine::{EngineOutcome, Indication, JoinEngine, JoinMode};
pub use self::frame::Frame;
pub use self::state::{AbortReason, Handshake, HandshakeOutcome, JoinState};

use crate::network::ScheduledLink;
use crate::schedule::ScheduleManager;
use crate::storage::ConfigStore;

/// Resources a join component works on
pub struct Context<'a> {
    /// Scheduled link
    pub link: &'a mut dyn ScheduledLink,
    /// Configuration mirror and connection status
    pub store: &'a mut ConfigStore,
    /// Slot allocation
    pub schedule: &'a ScheduleManager,
}
