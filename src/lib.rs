//! smartcell_net: network membership for a smart cell sensor node
//!
//! This library implements how a battery-powered cell joins a coordinator
//! over a time-slotted, channel-hopping link, how it keeps its slots in the
//! shared schedule, and how it reports measurements once connected.
pub mod core;

pub mod network;
pub mod node;
pub mod protocol;
pub mod schedule;
pub mod storage;
pub mod telemetry;
mod util;

// Re-export commonly used items
pub use crate::core::{Error, ErrorKind, NodeConfig, Result, ShortAddress};
pub use crate::network::{LinkEvent, NetworkClock, ScheduledLink, SimHandle, SimLink};
pub use crate::node::{Command, Exit, SmartCell};
pub use crate::protocol::{Frame, Indication, JoinMode};
pub use crate::storage::{ConfigStore, FixedHardwareId, HardwareId, MemoryFlash, Storage};
pub use crate::telemetry::{DownlinkHandler, MeasurementBuffer, MeasurementSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
