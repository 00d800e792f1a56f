use tracing::{debug, info, warn};

use crate::core::{ConnectionStatus, Error, PanId, Result, ShortAddress, MEAS_INTERVAL_MIN_SECS};
use crate::util::hex;
use super::record::PersistentRecord;
use super::{HardwareId, Storage};

/// Device identity and network binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceConfig {
    /// Device serial number
    pub serial: u32,
    /// Own link address
    pub short_address: ShortAddress,
    /// Measurement interval in seconds
    pub meas_interval_sec: u32,
    /// Coordinator link address
    pub coordinator_address: ShortAddress,
    /// PAN id of the bound network, 0 when unbound
    pub pan_id: PanId,
}

/// Identifies one configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldId {
    Serial,
    ShortAddress,
    MeasInterval,
    CoordinatorAddress,
    PanId,
}

impl FieldId {
    /// Size of the field's raw representation
    pub fn size(&self) -> usize {
        match self {
            FieldId::Serial | FieldId::MeasInterval => 4,
            FieldId::ShortAddress | FieldId::CoordinatorAddress | FieldId::PanId => 2,
        }
    }
}

/// A configuration field with its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    Serial(u32),
    ShortAddress(ShortAddress),
    MeasInterval(u32),
    CoordinatorAddress(ShortAddress),
    PanId(PanId),
}

impl ConfigField {
    /// Identifier of this field
    pub fn id(&self) -> FieldId {
        match self {
            ConfigField::Serial(_) => FieldId::Serial,
            ConfigField::ShortAddress(_) => FieldId::ShortAddress,
            ConfigField::MeasInterval(_) => FieldId::MeasInterval,
            ConfigField::CoordinatorAddress(_) => FieldId::CoordinatorAddress,
            ConfigField::PanId(_) => FieldId::PanId,
        }
    }

    /// Parses a field from its raw native-endian representation
    pub fn from_bytes(id: FieldId, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != id.size() {
            return Err(Error::invalid_parameter(format!(
                "{:?} takes {} bytes, got {}",
                id,
                id.size(),
                bytes.len()
            )));
        }
        let u16_value = || u16::from_le_bytes([bytes[0], bytes[1]]);
        let u32_value = || u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(match id {
            FieldId::Serial => ConfigField::Serial(u32_value()),
            FieldId::MeasInterval => ConfigField::MeasInterval(u32_value()),
            FieldId::ShortAddress => ConfigField::ShortAddress(ShortAddress(u16_value())),
            FieldId::CoordinatorAddress => {
                ConfigField::CoordinatorAddress(ShortAddress(u16_value()))
            }
            FieldId::PanId => ConfigField::PanId(u16_value()),
        })
    }

    /// Raw representation of this field
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ConfigField::Serial(v) | ConfigField::MeasInterval(v) => v.to_le_bytes().to_vec(),
            ConfigField::ShortAddress(a) | ConfigField::CoordinatorAddress(a) => {
                a.get().to_le_bytes().to_vec()
            }
            ConfigField::PanId(v) => v.to_le_bytes().to_vec(),
        }
    }
}

/// In-memory configuration mirror backed by a persistent record
///
/// Also holds the node's connection status.
pub struct ConfigStore {
    storage: Box<dyn Storage>,
    config: DeviceConfig,
    status: ConnectionStatus,
}

impl ConfigStore {
    /// Creates a store with an empty mirror
    pub fn new(storage: Box<dyn Storage>) -> Self {
        ConfigStore {
            storage,
            config: DeviceConfig::default(),
            status: ConnectionStatus::NotConnected,
        }
    }

    /// Snapshot of the mirror
    pub fn config(&self) -> DeviceConfig {
        self.config
    }

    /// Returns true when bound to a network
    pub fn is_bound(&self) -> bool {
        self.config.pan_id != 0
    }

    /// Updates one field of the mirror
    pub fn set_field(&mut self, field: ConfigField) -> Result<()> {
        match field {
            ConfigField::Serial(v) => self.config.serial = v,
            ConfigField::ShortAddress(a) => self.config.short_address = a,
            ConfigField::MeasInterval(v) => {
                if v < MEAS_INTERVAL_MIN_SECS {
                    return Err(Error::invalid_parameter(format!(
                        "measurement interval {} s below {} s",
                        v, MEAS_INTERVAL_MIN_SECS
                    )));
                }
                self.config.meas_interval_sec = v;
            }
            ConfigField::CoordinatorAddress(a) => self.config.coordinator_address = a,
            ConfigField::PanId(v) => self.config.pan_id = v,
        }
        debug!(?field, "Config field set");
        Ok(())
    }

    /// Reads one field of the mirror
    pub fn get_field(&self, id: FieldId) -> ConfigField {
        match id {
            FieldId::Serial => ConfigField::Serial(self.config.serial),
            FieldId::ShortAddress => ConfigField::ShortAddress(self.config.short_address),
            FieldId::MeasInterval => ConfigField::MeasInterval(self.config.meas_interval_sec),
            FieldId::CoordinatorAddress => {
                ConfigField::CoordinatorAddress(self.config.coordinator_address)
            }
            FieldId::PanId => ConfigField::PanId(self.config.pan_id),
        }
    }

    /// Updates one field from its raw representation
    pub fn set_field_bytes(&mut self, id: FieldId, bytes: &[u8]) -> Result<()> {
        self.set_field(ConfigField::from_bytes(id, bytes)?)
    }

    /// Reads one field as its raw representation
    pub fn get_field_bytes(&self, id: FieldId) -> Vec<u8> {
        self.get_field(id).to_bytes()
    }

    /// Resets the mirror to factory values derived from the hardware id
    /// and persists it
    pub fn write_defaults(&mut self, hardware: &dyn HardwareId) -> Result<()> {
        let id = hardware.unique_id();
        self.config = DeviceConfig {
            serial: u32::from_le_bytes([id[0], id[1], id[2], id[3]]),
            short_address: ShortAddress::from_be_bytes([id[6], id[7]]),
            meas_interval_sec: MEAS_INTERVAL_MIN_SECS,
            coordinator_address: ShortAddress::NULL,
            pan_id: 0,
        };
        info!(
            serial = self.config.serial,
            address = %self.config.short_address,
            hw_id = %hex(&id),
            "Write default config"
        );
        self.persist()
    }

    /// Writes the mirror to storage, erasing the old record first
    pub fn persist(&mut self) -> Result<()> {
        let bytes = PersistentRecord::from_config(&self.config).encode()?;
        self.storage.erase_region()?;
        self.storage.write_record(&bytes)?;
        info!(
            pan_id = self.config.pan_id,
            own = %self.config.short_address,
            coordinator = %self.config.coordinator_address,
            "Config persisted"
        );
        Ok(())
    }

    /// Loads the stored record into the mirror
    ///
    /// Returns `Ok(None)` and leaves the mirror untouched if no valid
    /// record is stored.
    pub fn load(&mut self) -> Result<Option<DeviceConfig>> {
        let bytes = self.storage.read_record()?;
        match PersistentRecord::decode(&bytes) {
            Some(record) => {
                self.config = record.config();
                info!(
                    serial = self.config.serial,
                    pan_id = self.config.pan_id,
                    own = %self.config.short_address,
                    "Config loaded"
                );
                Ok(Some(self.config))
            }
            None => {
                warn!("No valid config record");
                Ok(None)
            }
        }
    }

    /// Factory reset
    ///
    /// On failure the region is in an unknown state and the device must
    /// restart.
    pub fn erase_all(&mut self) -> Result<()> {
        self.status = ConnectionStatus::NotConnected;
        self.storage
            .erase_region()
            .map_err(|e| Error::storage(format!("factory reset: {}", e)))?;
        self.config = DeviceConfig::default();
        info!("Config erased");
        Ok(())
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            debug!(?status, "Connection status");
        }
        self.status = status;
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status
    }

    /// Returns true while connected
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::storage::{FixedHardwareId, MemoryFlash};

    const HW_ID: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x00, 0x2A];

    fn store() -> (ConfigStore, MemoryFlash) {
        let flash = MemoryFlash::new();
        (ConfigStore::new(Box::new(flash.clone())), flash)
    }

    #[test]
    fn test_defaults_from_hardware_id() {
        let (mut store, _flash) = store();
        store.write_defaults(&FixedHardwareId(HW_ID)).unwrap();

        let config = store.config();
        assert_eq!(config.serial, 0x4433_2211);
        assert_eq!(config.short_address, ShortAddress(0x002A));
        assert_eq!(config.meas_interval_sec, 3);
        assert!(!store.is_bound());
    }

    #[test]
    fn test_persist_and_load() {
        let (mut store, flash) = store();
        store.write_defaults(&FixedHardwareId(HW_ID)).unwrap();
        store.set_field(ConfigField::PanId(0xABCD)).unwrap();
        store
            .set_field(ConfigField::CoordinatorAddress(ShortAddress(1)))
            .unwrap();
        store.persist().unwrap();
        assert_eq!(flash.erase_count(), 2);

        let mut reloaded = ConfigStore::new(Box::new(flash));
        let config = reloaded.load().unwrap().unwrap();
        assert_eq!(config, store.config());
        assert!(reloaded.is_bound());
    }

    #[test]
    fn test_corrupted_record_is_absent() {
        let (mut store, flash) = store();
        store.write_defaults(&FixedHardwareId(HW_ID)).unwrap();
        flash.inject_corruption(6);

        let mut reloaded = ConfigStore::new(Box::new(flash));
        reloaded.set_field(ConfigField::Serial(77)).unwrap();
        assert_eq!(reloaded.load().unwrap(), None);
        assert_eq!(reloaded.config().serial, 77);
    }

    #[test]
    fn test_interval_lower_bound() {
        let (mut store, _flash) = store();
        let err = store.set_field(ConfigField::MeasInterval(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        store.set_field(ConfigField::MeasInterval(3)).unwrap();
        store.set_field(ConfigField::MeasInterval(60)).unwrap();
        assert_eq!(store.get_field(FieldId::MeasInterval), ConfigField::MeasInterval(60));
    }

    #[test]
    fn test_raw_field_access() {
        let (mut store, _flash) = store();
        store.set_field_bytes(FieldId::PanId, &[0xCD, 0xAB]).unwrap();
        assert_eq!(store.config().pan_id, 0xABCD);
        assert_eq!(store.get_field_bytes(FieldId::PanId), vec![0xCD, 0xAB]);

        assert!(matches!(
            store.set_field_bytes(FieldId::Serial, &[1, 2]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(store.set_field_bytes(FieldId::MeasInterval, &[1, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_default_config_is_unbound() {
        let config = DeviceConfig::default();
        assert!(config.short_address.is_null());
        assert!(config.coordinator_address.is_null());
        assert_eq!(config.pan_id, 0);
        assert_eq!(config.serial, 0);
    }

    #[test]
    fn test_erase_all() {
        let (mut store, flash) = store();
        store.write_defaults(&FixedHardwareId(HW_ID)).unwrap();
        store.set_connection_status(ConnectionStatus::Connected);

        store.erase_all().unwrap();
        assert_eq!(store.connection_status(), ConnectionStatus::NotConnected);
        assert_eq!(store.config(), DeviceConfig::default());
        assert_eq!(store.load().unwrap(), None);

        flash.set_fail_erase(true);
        let err = store.erase_all().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GenericFailure);
    }
}
