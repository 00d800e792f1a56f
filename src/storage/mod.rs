//! Persistent device configuration
//!
//! The device identity and network binding live in one CRC-protected
//! record in flash, mirrored in memory by the [`ConfigStore`].

mod config;
mod flash;
mod record;

pub use self::config::{ConfigField, ConfigStore, DeviceConfig, FieldId};
pub use self::flash::MemoryFlash;
pub use self::record::{PersistentRecord, RECORD_FLAG, RECORD_LEN};

use bytes::Bytes;
use rand::RngCore;

use crate::core::Result;

/// Byte-level access to the configuration region of flash
pub trait Storage: Send {
    /// Writes `data` at the start of the region
    ///
    /// The region must have been erased first.
    fn write_record(&mut self, data: &[u8]) -> Result<()>;

    /// Reads the whole region
    fn read_record(&mut self) -> Result<Bytes>;

    /// Erases the whole region
    fn erase_region(&mut self) -> Result<()>;
}

/// Source of the factory-programmed 64-bit device id
pub trait HardwareId: Send {
    /// Returns the unique id, most significant byte last
    fn unique_id(&self) -> [u8; 8];
}

/// Hardware id with a fixed value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHardwareId(pub [u8; 8]);

impl FixedHardwareId {
    /// Creates a random id, for simulated devices
    pub fn random() -> Self {
        let mut id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id);
        FixedHardwareId(id)
    }
}

impl HardwareId for FixedHardwareId {
    fn unique_id(&self) -> [u8; 8] {
        self.0
    }
}
