//! TDMA slot allocation
//!
//! Deterministic mapping from node identity to slots of the shared
//! slotframe, and its application to a scheduled link.

mod layout;
mod manager;

pub use self::layout::{FrameClass, LinkOptions, ScheduleSlot, SlotClass, SlotframeLayout};
pub use self::manager::ScheduleManager;
