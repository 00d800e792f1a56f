use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::{JoinFlag, PanId, ScanConfig, ShortAddress};
use super::ScheduledLink;

/// A received beacon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconInfo {
    /// Beacon source address
    pub source_address: ShortAddress,
    /// Beacon source PAN id
    pub source_pan_id: PanId,
    /// Channel the beacon was heard on
    pub channel: u8,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Join mode advertised by the source
    pub join_flag: JoinFlag,
}

/// What a scan is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Any coordinator with its manual join window open
    Join,
    /// The coordinator this node is bound to
    Rejoin {
        /// Stored PAN id
        pan_id: PanId,
        /// Stored coordinator address
        coordinator: ShortAddress,
    },
}

impl ScanMode {
    /// Join flag a beacon must carry to be considered
    pub fn join_flag(&self) -> JoinFlag {
        match self {
            ScanMode::Join => JoinFlag::ManualJoinOpen,
            ScanMode::Rejoin { .. } => JoinFlag::ManualJoinClosed,
        }
    }

    /// Returns true if `beacon` is acceptable in this mode
    pub fn accepts(&self, beacon: &BeaconInfo) -> bool {
        if beacon.join_flag != self.join_flag() {
            return false;
        }
        match self {
            ScanMode::Join => true,
            ScanMode::Rejoin {
                pan_id,
                coordinator,
            } => beacon.source_pan_id == *pan_id && beacon.source_address == *coordinator,
        }
    }
}

/// Result of a finished scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Best accepted beacon, already locked in the link
    Found(BeaconInfo),
    /// No acceptable beacon was heard
    NotFound,
}

struct ActiveScan {
    mode: ScanMode,
    started: Instant,
    dwell_until: Instant,
    sweep: usize,
    accepted: u32,
    best: Option<BeaconInfo>,
}

/// Channel sweep for the best beacon by RSSI
///
/// The scanner is a state machine: `start` begins a sweep, `on_beacon`
/// tallies beacons, and `on_tick` moves to the next channel and eventually
/// finishes the scan. The total duration is only checked when a channel
/// dwell ends.
pub struct BeaconScanner {
    config: ScanConfig,
    active: Option<ActiveScan>,
}

impl BeaconScanner {
    /// Creates an idle scanner
    pub fn new(config: ScanConfig) -> Self {
        BeaconScanner {
            config,
            active: None,
        }
    }

    /// Returns true while a scan runs
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Starts a scan, discarding any running one
    pub fn start(&mut self, link: &mut dyn ScheduledLink, mode: ScanMode, now: Instant) {
        link.set_autonomous_scan(false);
        link.radio_off();

        match mode {
            ScanMode::Join => info!("Scan for beacons with manual join flag"),
            ScanMode::Rejoin { pan_id, coordinator } => {
                info!(pan_id, %coordinator, "Scan for beacons without manual join flag")
            }
        }

        self.active = Some(ActiveScan {
            mode,
            started: now,
            dwell_until: now,
            sweep: 0,
            accepted: 0,
            best: None,
        });
        self.tune_next(link, now);
    }

    /// Stops a running scan without an outcome
    pub fn cancel(&mut self, link: &mut dyn ScheduledLink) {
        if self.active.take().is_some() {
            debug!("Scan cancelled");
            link.radio_off();
        }
    }

    /// Deadline of the current channel dwell
    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|scan| scan.dwell_until)
    }

    /// Tallies a received beacon
    pub fn on_beacon(&mut self, beacon: BeaconInfo) {
        let channel = match self.current_channel() {
            Some(channel) => channel,
            None => return,
        };
        let scan = match self.active.as_mut() {
            Some(scan) => scan,
            None => return,
        };

        let beacon = BeaconInfo { channel, ..beacon };
        info!(
            source = %beacon.source_address,
            pan_id = beacon.source_pan_id,
            channel = beacon.channel,
            rssi = beacon.rssi,
            join_flag = ?beacon.join_flag,
            "Rx beacon"
        );

        if !scan.mode.accepts(&beacon) {
            return;
        }

        scan.accepted += 1;
        let better = scan
            .best
            .as_ref()
            .map_or(true, |best| beacon.rssi > best.rssi);
        if better {
            scan.best = Some(beacon);
        }
    }

    /// Advances the sweep, returning the outcome once the scan is done
    pub fn on_tick(&mut self, link: &mut dyn ScheduledLink, now: Instant) -> Option<ScanOutcome> {
        let scan = self.active.as_ref()?;
        if now < scan.dwell_until {
            return None;
        }

        link.radio_off();
        if now.saturating_duration_since(scan.started) < self.config.duration {
            self.tune_next(link, now);
            return None;
        }

        let scan = self.active.take()?;
        Some(self.finish(link, scan))
    }

    fn current_channel(&self) -> Option<u8> {
        let scan = self.active.as_ref()?;
        let channels = &self.config.channels;
        if channels.is_empty() {
            return None;
        }
        Some(channels[(scan.sweep.max(1) - 1) % channels.len()])
    }

    fn tune_next(&mut self, link: &mut dyn ScheduledLink, now: Instant) {
        let dwell = self.config.channel_dwell.max(Duration::from_millis(1));
        let channels = &self.config.channels;
        let scan = match self.active.as_mut() {
            Some(scan) => scan,
            None => return,
        };

        scan.dwell_until = now + dwell;
        if channels.is_empty() {
            return;
        }

        let channel = channels[scan.sweep % channels.len()];
        scan.sweep += 1;
        info!(channel, "Scan channel");
        if let Err(e) = link.listen(channel) {
            warn!(channel, error = %e, "Failed to tune radio");
        }
    }

    fn finish(&mut self, link: &mut dyn ScheduledLink, scan: ActiveScan) -> ScanOutcome {
        let outcome = match scan.best {
            Some(best) if scan.accepted > 0 => {
                info!(
                    accepted = scan.accepted,
                    source = %best.source_address,
                    channel = best.channel,
                    rssi = best.rssi,
                    "Best beacon"
                );
                match link.lock_beacon(best.source_address, best.channel) {
                    Ok(()) => ScanOutcome::Found(best),
                    Err(e) => {
                        warn!(error = %e, "Failed to lock beacon");
                        ScanOutcome::NotFound
                    }
                }
            }
            _ => {
                info!("No beacon received");
                ScanOutcome::NotFound
            }
        };
        link.radio_off();
        outcome
    }
}
