//! Measurement capture and reporting
//!
//! The scheduler decides when to capture and when to transmit. What is
//! captured, and what happens to remote commands, is up to the injected
//! [`MeasurementSource`] and [`DownlinkHandler`].

mod scheduler;

pub use self::scheduler::TelemetryScheduler;

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::core::{MeasurementRecord, TransmitStatus};
use crate::network::NetworkClock;
use crate::util::hex;

/// Produces measurements and learns whether they were delivered
pub trait MeasurementSource: Send {
    /// Captures a new measurement stamped with the network absolute time
    ///
    /// Returns true if a measurement was taken.
    fn perform_measurement(&mut self) -> bool {
        false
    }

    /// Next measurement to transmit, if any
    fn get_measurement(&mut self) -> Option<MeasurementRecord> {
        None
    }

    /// Outcome of the last transmitted measurement
    fn set_transmit_status(&mut self, status: TransmitStatus) {
        let _ = status;
    }
}

/// Handles remote commands from the coordinator
pub trait DownlinkHandler: Send {
    /// Called with the payload of every Remote frame
    fn handle_remote(&mut self, payload: &[u8]) {
        debug!(payload = %hex(payload), "Unhandled remote frame");
    }
}

/// Source that never measures
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMeasurements;

impl MeasurementSource for NoMeasurements {}

/// Handler that ignores remote frames
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreDownlink;

impl DownlinkHandler for IgnoreDownlink {}

/// Measurement source backed by a sampling closure
///
/// Each sample is stamped with the network absolute time read from `clock`.
/// Keeps captured records until the coordinator has acknowledged them, up
/// to `capacity` records; the oldest is dropped when full. The front
/// record is resent until a transmission succeeds.
pub struct MeasurementBuffer<F> {
    clock: Arc<dyn NetworkClock>,
    sampler: F,
    pending: VecDeque<MeasurementRecord>,
    capacity: usize,
    awaiting_status: bool,
}

impl<F> MeasurementBuffer<F>
where
    F: FnMut() -> Option<Bytes> + Send,
{
    /// Creates a buffer holding up to `capacity` unsent records
    pub fn new(capacity: usize, clock: Arc<dyn NetworkClock>, sampler: F) -> Self {
        MeasurementBuffer {
            clock,
            sampler,
            pending: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            awaiting_status: false,
        }
    }

    /// Number of records not yet delivered
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<F> MeasurementSource for MeasurementBuffer<F>
where
    F: FnMut() -> Option<Bytes> + Send,
{
    fn perform_measurement(&mut self) -> bool {
        let value = match (self.sampler)() {
            Some(value) => value,
            None => return false,
        };
        let timestamp = self.clock.absolute_time();
        if self.pending.len() >= self.capacity {
            // Never drop the record currently on the air.
            let victim = if self.awaiting_status { 1 } else { 0 };
            if self.pending.remove(victim).is_some() {
                info!("Measurement buffer full, dropping oldest");
            }
        }
        self.pending.push_back(MeasurementRecord::new(timestamp, value));
        true
    }

    fn get_measurement(&mut self) -> Option<MeasurementRecord> {
        let record = self.pending.front().cloned()?;
        self.awaiting_status = true;
        Some(record)
    }

    fn set_transmit_status(&mut self, status: TransmitStatus) {
        if !self.awaiting_status {
            return;
        }
        self.awaiting_status = false;
        if status == TransmitStatus::Success {
            self.pending.pop_front();
        }
    }
}
