//! Link-layer interface and frame routing
//!
//! This module defines the scheduled link the stack runs on, the events it
//! reports, beacon discovery, and the dispatcher that routes link events to
//! their owning component.

mod connection;
mod discovery;
pub mod sim;

pub use self::connection::{Dispatcher, Route};
pub use self::discovery::{BeaconInfo, BeaconScanner, ScanMode, ScanOutcome};
pub use self::sim::{SentFrame, SimClock, SimHandle, SimLink};

use std::sync::Arc;

use bytes::Bytes;

use crate::core::{PanId, Result, ShortAddress, TxOrigin, TxStatus};
use crate::schedule::ScheduleSlot;

/// Asynchronous notifications from the link layer
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A queued frame finished, successfully or not
    TxDone {
        /// Subsystem that queued the frame
        origin: TxOrigin,
        /// Final transmission status
        status: TxStatus,
    },
    /// A frame was received
    Received {
        /// Sender address
        source: ShortAddress,
        /// Raw frame bytes
        payload: Bytes,
    },
    /// A beacon was heard on the channel being listened to
    Beacon(BeaconInfo),
    /// Association with the locked coordinator completed
    Associated,
    /// Association could not be completed
    AssociationFailed,
    /// Start of a slotframe cycle
    CycleStart,
    /// The coordinator dropped this node
    LeftNetwork,
}

/// Reader of the network absolute time
///
/// The coordinator distributes this time with the schedule, so every node in
/// the network stamps its data against the same clock.
pub trait NetworkClock: Send + Sync {
    /// Network absolute time in seconds
    fn absolute_time(&self) -> u32;
}

impl<F> NetworkClock for F
where
    F: Fn() -> u32 + Send + Sync,
{
    fn absolute_time(&self) -> u32 {
        self()
    }
}

/// Time-slotted, channel-hopping link layer
///
/// All calls are synchronous and return immediately. Outcomes that need
/// air time are reported later as [`LinkEvent`]s.
pub trait ScheduledLink: Send {
    /// Creates the application slotframe with `length` slots
    fn init_slotframe(&mut self, length: u16) -> Result<()>;

    /// Adds one slot to the schedule
    fn add_link(&mut self, slot: &ScheduleSlot) -> Result<()>;

    /// Removes the slot at the given offsets
    fn remove_link(&mut self, slot_offset: u16, channel_offset: u16) -> Result<()>;

    /// Queues a frame
    ///
    /// Returns `Error::Busy` when single-packet mode is on and a frame is
    /// already in flight.
    fn send(
        &mut self,
        payload: Bytes,
        dest: ShortAddress,
        max_transmissions: u8,
        origin: TxOrigin,
    ) -> Result<()>;

    /// Enables or disables single-packet queuing
    fn set_single_packet(&mut self, enabled: bool);

    /// Starts association with the locked beacon source
    fn associate(&mut self) -> Result<()>;

    /// Leaves the current network
    fn deassociate(&mut self);

    /// Returns true while associated
    fn is_associated(&self) -> bool;

    /// Time-source neighbour, the coordinator once associated
    fn time_source_address(&self) -> ShortAddress;

    /// Sets this node's link address
    fn set_own_address(&mut self, address: ShortAddress);

    /// PAN identifier of the current network
    fn pan_id(&self) -> PanId;

    /// Enables or disables the link layer's own scanning
    fn set_autonomous_scan(&mut self, enabled: bool);

    /// Turns the radio on and listens on `channel`
    fn listen(&mut self, channel: u8) -> Result<()>;

    /// Turns the radio off
    fn radio_off(&mut self);

    /// Locks onto a beacon source for the next association
    fn lock_beacon(&mut self, source: ShortAddress, channel: u8) -> Result<()>;

    /// Network absolute time in seconds
    fn absolute_time(&self) -> u32;

    /// Shareable reader of [`absolute_time`](Self::absolute_time), for
    /// measurement sources that stamp their own records
    fn clock(&self) -> Arc<dyn NetworkClock>;
}
