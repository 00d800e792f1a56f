use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{TransmitStatus, TxOrigin, TxStatus, MEAS_INTERVAL_MIN_SECS};
use crate::network::ScheduledLink;
use crate::protocol::Frame;
use crate::storage::ConfigStore;
use crate::util::{hex, secs};
use super::MeasurementSource;

/// Cycle-synchronised measurement capture and transmission
///
/// At the minimum interval a measurement is captured on every cycle
/// start; longer intervals run on their own timer. Transmission always
/// happens on cycle start, one frame at a time.
#[derive(Debug)]
pub struct TelemetryScheduler {
    transmissions: u8,
    running: bool,
    next_capture: Option<Instant>,
}

impl TelemetryScheduler {
    /// Creates a stopped scheduler
    pub fn new(transmissions: u8) -> Self {
        TelemetryScheduler {
            transmissions,
            running: false,
            next_capture: None,
        }
    }

    /// Returns true once started
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts capture and transmission
    ///
    /// Restarting resets the capture timer.
    pub fn start(&mut self, link: &mut dyn ScheduledLink, store: &ConfigStore, now: Instant) {
        link.set_single_packet(true);
        self.running = true;
        self.next_capture = None;
        self.schedule_capture(store, now);
        info!(interval = store.config().meas_interval_sec, "Telemetry started");
    }

    /// Stops capture and transmission
    pub fn stop(&mut self) {
        self.running = false;
        self.next_capture = None;
    }

    /// Deadline of the capture timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.next_capture
    }

    /// Runs the capture timer
    pub fn on_tick(&mut self, store: &ConfigStore, source: &mut dyn MeasurementSource, now: Instant) {
        match self.next_capture {
            Some(at) if at <= now => {}
            _ => return,
        }
        self.next_capture = None;
        if !cycle_driven(store) {
            capture(source);
        }
        self.schedule_capture(store, now);
    }

    /// Start of a slotframe cycle: capture at the highest rate and transmit
    pub fn on_cycle_start(
        &mut self,
        link: &mut dyn ScheduledLink,
        store: &ConfigStore,
        source: &mut dyn MeasurementSource,
        now: Instant,
    ) {
        if !self.is_running() {
            return;
        }

        if cycle_driven(store) {
            self.next_capture = None;
            capture(source);
        } else if self.next_capture.is_none() {
            self.schedule_capture(store, now);
        }

        if !(store.is_connected() && link.is_associated()) {
            debug!("Waiting for connection to the coordinator");
            return;
        }

        let record = match source.get_measurement() {
            Some(record) => record,
            None => return,
        };
        let record_time = record.timestamp;
        let frame = Frame::Measurement {
            timestamp: record.timestamp,
            value: record.value,
        };
        let payload = match frame.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable measurement");
                source.set_transmit_status(TransmitStatus::Success);
                return;
            }
        };

        let coordinator = store.config().coordinator_address;
        info!(
            %coordinator,
            captured = record_time,
            now = link.absolute_time(),
            payload = %hex(&payload),
            "Tx measurement"
        );
        match link.send(payload, coordinator, self.transmissions, TxOrigin::Telemetry) {
            Ok(()) => {}
            Err(e) if e.is_busy() => debug!("Previous measurement still queued"),
            Err(e) => warn!(error = %e, "Failed to queue measurement"),
        }
    }

    /// Completion of a measurement frame
    pub fn on_tx_done(&mut self, source: &mut dyn MeasurementSource, status: TxStatus) {
        if status.is_ok() {
            info!("Tx successful");
            source.set_transmit_status(TransmitStatus::Success);
        } else {
            info!(?status, "Tx failed");
            source.set_transmit_status(TransmitStatus::Fail);
        }
    }

    fn schedule_capture(&mut self, store: &ConfigStore, now: Instant) {
        if !self.is_running() || cycle_driven(store) {
            return;
        }
        let interval = store.config().meas_interval_sec;
        debug!(interval, "Blocked until meas read time");
        self.next_capture = Some(now + secs(interval));
    }
}

/// The source stamps the record with the network absolute time itself
fn capture(source: &mut dyn MeasurementSource) {
    if source.perform_measurement() {
        debug!("Measurement captured");
    }
}

fn cycle_driven(store: &ConfigStore) -> bool {
    store.config().meas_interval_sec <= MEAS_INTERVAL_MIN_SECS
}
