use crc::{Crc, CRC_16_KERMIT};
use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, ShortAddress};
use super::config::DeviceConfig;

/// Marker byte of a valid record
pub const RECORD_FLAG: u8 = 0xB0;

/// Encoded record length
pub const RECORD_LEN: usize = 17;

/// Bytes covered by the checksum
const CRC_COVERED_LEN: usize = RECORD_LEN - 2;

/// CRC-16 as computed by the firmware (reflected CCITT, zero init)
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// On-flash layout of the device configuration
///
/// Little-endian, no padding, fields in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentRecord {
    pub flag: u8,
    pub serial: u32,
    pub meas_interval: u32,
    pub coordinator: u16,
    pub pan_id: u16,
    pub own: u16,
    pub crc: u16,
}

impl PersistentRecord {
    /// Builds the record of `config` with a valid flag and checksum
    pub fn from_config(config: &DeviceConfig) -> Self {
        PersistentRecord {
            flag: RECORD_FLAG,
            serial: config.serial,
            meas_interval: config.meas_interval_sec,
            coordinator: config.coordinator_address.get(),
            pan_id: config.pan_id,
            own: config.short_address.get(),
            crc: 0,
        }
    }

    /// Device configuration held by this record
    pub fn config(&self) -> DeviceConfig {
        DeviceConfig {
            serial: self.serial,
            short_address: ShortAddress(self.own),
            meas_interval_sec: self.meas_interval,
            coordinator_address: ShortAddress(self.coordinator),
            pan_id: self.pan_id,
        }
    }

    /// Encodes the record, filling in the checksum
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(&PersistentRecord { crc: 0, ..*self })
            .map_err(|e| Error::storage(format!("Failed to serialize record: {}", e)))?;
        if bytes.len() != RECORD_LEN {
            return Err(Error::storage(format!(
                "record encoded to {} bytes",
                bytes.len()
            )));
        }

        let crc = CRC16.checksum(&bytes[..CRC_COVERED_LEN]);
        bytes[CRC_COVERED_LEN..].copy_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    /// Decodes a record, returning `None` unless flag and checksum match
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..RECORD_LEN)?;
        let record: PersistentRecord = bincode::deserialize(bytes).ok()?;
        if record.flag != RECORD_FLAG {
            return None;
        }
        if CRC16.checksum(&bytes[..CRC_COVERED_LEN]) != record.crc {
            return None;
        }
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DeviceConfig {
        DeviceConfig {
            serial: 0x0403_0201,
            short_address: ShortAddress(0x0007),
            meas_interval_sec: 10,
            coordinator_address: ShortAddress(0x0001),
            pan_id: 0xABCD,
        }
    }

    #[test]
    fn test_crc_matches_firmware_algorithm() {
        // CRC-16/KERMIT check value
        assert_eq!(CRC16.checksum(b"123456789"), 0x2189);
    }

    #[test]
    fn test_record_layout() {
        let bytes = PersistentRecord::from_config(&sample()).encode().unwrap();
        assert_eq!(bytes.len(), RECORD_LEN);
        assert_eq!(
            &bytes[..15],
            &[
                0xB0, // flag
                0x01, 0x02, 0x03, 0x04, // serial
                0x0A, 0x00, 0x00, 0x00, // interval
                0x01, 0x00, // coordinator
                0xCD, 0xAB, // pan id
                0x07, 0x00, // own address
            ]
        );
        let crc = CRC16.checksum(&bytes[..15]);
        assert_eq!(&bytes[15..], &crc.to_le_bytes());
    }

    #[test]
    fn test_record_round_trip() {
        let config = sample();
        let bytes = PersistentRecord::from_config(&config).encode().unwrap();
        let record = PersistentRecord::decode(&bytes).unwrap();
        assert_eq!(record.config(), config);
    }

    #[test]
    fn test_any_single_byte_corruption_detected() {
        let bytes = PersistentRecord::from_config(&sample()).encode().unwrap();
        for i in 0..RECORD_LEN {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x5A;
            assert!(PersistentRecord::decode(&corrupted).is_none(), "byte {}", i);
        }
    }

    #[test]
    fn test_erased_and_short_input_absent() {
        assert!(PersistentRecord::decode(&[0xFF; 64]).is_none());
        assert!(PersistentRecord::decode(&[0xB0; 4]).is_none());
    }
}
