use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::trace;

use crate::core::{Error, Result};
use super::Storage;

/// Size of the simulated configuration page
const PAGE_SIZE: usize = 256;

/// Erased cell value
const ERASED: u8 = 0xFF;

#[derive(Debug)]
struct FlashState {
    page: Vec<u8>,
    erase_count: u32,
    fail_erase: bool,
    fail_write: bool,
}

/// In-memory flash page
///
/// Behaves like NOR flash: a write may only program erased cells, so a
/// record must be erased before it is rewritten. Clones share the same
/// page, letting tests keep a handle after the store takes ownership.
///
/// Supports:
/// - Erase count tracking
/// - Corruption injection for testing error handling
/// - Erase and write failure injection
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    state: Arc<Mutex<FlashState>>,
}

impl MemoryFlash {
    /// Creates an erased page
    pub fn new() -> Self {
        MemoryFlash {
            state: Arc::new(Mutex::new(FlashState {
                page: vec![ERASED; PAGE_SIZE],
                erase_count: 0,
                fail_erase: false,
                fail_write: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FlashState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get page contents (for test verification)
    pub fn contents(&self, len: usize) -> Vec<u8> {
        self.state().page[..len.min(PAGE_SIZE)].to_vec()
    }

    /// Flips every bit of the byte at `offset`
    pub fn inject_corruption(&self, offset: usize) {
        if let Some(byte) = self.state().page.get_mut(offset) {
            *byte = !*byte;
        }
    }

    /// Number of erase cycles so far
    pub fn erase_count(&self) -> u32 {
        self.state().erase_count
    }

    /// Makes every erase fail
    pub fn set_fail_erase(&self, fail: bool) {
        self.state().fail_erase = fail;
    }

    /// Makes every write fail
    pub fn set_fail_write(&self, fail: bool) {
        self.state().fail_write = fail;
    }
}

impl Default for MemoryFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryFlash {
    fn write_record(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.fail_write {
            return Err(Error::storage("write failed"));
        }
        if data.len() > PAGE_SIZE {
            return Err(Error::storage(format!(
                "record of {} bytes exceeds {} byte page",
                data.len(),
                PAGE_SIZE
            )));
        }
        if state.page[..data.len()].iter().any(|&b| b != ERASED) {
            return Err(Error::storage("write to unerased cells"));
        }

        trace!(len = data.len(), "flash write");
        state.page[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_record(&mut self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(&self.state().page))
    }

    fn erase_region(&mut self) -> Result<()> {
        let mut state = self.state();
        if state.fail_erase {
            return Err(Error::storage("erase failed"));
        }
        trace!("flash erase");
        state.page.fill(ERASED);
        state.erase_count += 1;
        Ok(())
    }
}
