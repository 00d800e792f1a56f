use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::{ConnectionStatus, NodeConfig, ShortAddress, TxStatus};
use crate::network::{BeaconInfo, BeaconScanner, ScanMode, ScanOutcome};
use crate::schedule::ScheduleManager;
use super::frame::Frame;
use super::state::{Handshake, HandshakeOutcome};
use super::Context;

/// Kind of membership attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// First join through the coordinator's manual join window
    Join,
    /// Reattach to the stored coordinator without a handshake
    Rejoin,
}

/// Events for the user-facing layer (LEDs, power control)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    ScanStarted { mode: JoinMode },
    ScanFailed { mode: JoinMode },
    JoinSucceeded { address: ShortAddress },
    JoinFailed,
    Rejoined { address: ShortAddress },
    RejoinBackoff { retry_in: Duration },
    ConnectionLost,
    Status { connected: bool },
    ShutdownRequested,
    RestartRequired,
}

/// Result of an engine step the runtime must act on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The node is a member of the network
    Connected,
    /// A first join gave up, the device should power down
    JoinFailed,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Scanning { mode: JoinMode },
    Associating { mode: JoinMode, deadline: Instant },
    Handshake(Handshake),
    Backoff { until: Instant },
    Connected,
}

/// Drives join and rejoin attempts
///
/// At most one attempt runs at a time. Starting an attempt cancels the
/// running one.
pub struct JoinEngine {
    config: NodeConfig,
    scanner: BeaconScanner,
    phase: Phase,
    indications: mpsc::UnboundedSender<Indication>,
}

impl JoinEngine {
    /// Creates an idle engine reporting to `indications`
    pub fn new(config: NodeConfig, indications: mpsc::UnboundedSender<Indication>) -> Self {
        let scanner = BeaconScanner::new(config.scan.clone());
        JoinEngine {
            config,
            scanner,
            phase: Phase::Idle,
            indications,
        }
    }

    /// Returns true once the node is a member of the network
    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected)
    }

    /// Returns true while no attempt is running
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle | Phase::Connected)
    }

    /// Active handshake, if any
    pub fn handshake(&self) -> Option<&Handshake> {
        match &self.phase {
            Phase::Handshake(handshake) => Some(handshake),
            _ => None,
        }
    }

    /// Starts a first join
    pub fn join(&mut self, ctx: &mut Context<'_>, now: Instant) {
        self.cancel(ctx);
        info!("Start manual join");
        self.start_scan(ctx, JoinMode::Join, now);
    }

    /// Starts a rejoin with the stored binding
    pub fn rejoin(&mut self, ctx: &mut Context<'_>, now: Instant) {
        self.cancel(ctx);
        info!("Start rejoin process; no handshake will be performed");
        self.start_scan(ctx, JoinMode::Rejoin, now);
    }

    /// Stops the running attempt and cleans up its slots
    pub fn cancel(&mut self, ctx: &mut Context<'_>) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Scanning { .. } => self.scanner.cancel(ctx.link),
            Phase::Handshake(mut handshake) => handshake.cancel(ctx),
            Phase::Associating { .. } => ctx.link.deassociate(),
            Phase::Backoff { .. } => {}
            Phase::Idle | Phase::Connected => return,
        }
        debug!("Join attempt cancelled");
    }

    /// Earliest instant `on_tick` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::Scanning { .. } => self.scanner.next_deadline(),
            Phase::Associating { deadline, .. } => Some(*deadline),
            Phase::Handshake(handshake) => handshake.next_deadline(),
            Phase::Backoff { until } => Some(*until),
            Phase::Idle | Phase::Connected => None,
        }
    }

    /// Runs expired timers
    pub fn on_tick(&mut self, ctx: &mut Context<'_>, now: Instant) -> Option<EngineOutcome> {
        match &mut self.phase {
            Phase::Scanning { mode } => {
                let mode = *mode;
                match self.scanner.on_tick(ctx.link, now)? {
                    ScanOutcome::Found(beacon) => self.associate(ctx, mode, beacon, now),
                    ScanOutcome::NotFound => {
                        error!(?mode, "Failed beacon scan");
                        self.indicate(Indication::ScanFailed { mode });
                        self.attempt_failed(mode, now)
                    }
                }
            }
            Phase::Associating { mode, deadline } => {
                if now < *deadline {
                    return None;
                }
                let mode = *mode;
                warn!(?mode, "Association timed out");
                ctx.link.deassociate();
                self.attempt_failed(mode, now)
            }
            Phase::Handshake(handshake) => {
                let outcome = handshake.on_tick(ctx, now)?;
                self.handshake_finished(outcome, now)
            }
            Phase::Backoff { until } => {
                if now < *until {
                    return None;
                }
                self.rejoin(ctx, now);
                None
            }
            Phase::Idle | Phase::Connected => None,
        }
    }

    /// Feeds a received beacon to the running scan
    pub fn on_beacon(&mut self, beacon: BeaconInfo) {
        if matches!(self.phase, Phase::Scanning { .. }) {
            self.scanner.on_beacon(beacon);
        }
    }

    /// Link association completed
    pub fn on_associated(&mut self, ctx: &mut Context<'_>, now: Instant) -> Option<EngineOutcome> {
        let mode = match self.phase {
            Phase::Associating { mode, .. } => mode,
            _ => {
                debug!("Unexpected association event");
                return None;
            }
        };
        info!(pan_id = ctx.link.pan_id(), "Associated");

        match mode {
            JoinMode::Join => {
                let handshake = Handshake::start(
                    ctx,
                    self.config.timing.clone(),
                    self.config.join_transmissions,
                    now,
                );
                self.phase = Phase::Handshake(handshake);
                None
            }
            JoinMode::Rejoin => {
                let address = ctx.store.config().short_address;
                info!(%address, "Stored device address");
                ScheduleManager::tolerate(ctx.schedule.add_data_slots(ctx.link, address));
                ctx.store.set_connection_status(ConnectionStatus::Connected);
                self.phase = Phase::Connected;
                self.indicate(Indication::Rejoined { address });
                Some(EngineOutcome::Connected)
            }
        }
    }

    /// Link association failed
    pub fn on_association_failed(&mut self, now: Instant) -> Option<EngineOutcome> {
        match self.phase {
            Phase::Associating { mode, .. } => {
                warn!(?mode, "Association failed");
                self.attempt_failed(mode, now)
            }
            _ => None,
        }
    }

    /// Completion of a join frame
    pub fn on_tx_done(
        &mut self,
        ctx: &mut Context<'_>,
        status: TxStatus,
        now: Instant,
    ) -> Option<EngineOutcome> {
        match &mut self.phase {
            Phase::Handshake(handshake) => {
                let outcome = handshake.on_tx_done(ctx, status, now)?;
                self.handshake_finished(outcome, now)
            }
            _ => {
                debug!(?status, "Join frame completed outside handshake");
                None
            }
        }
    }

    /// A join frame arrived from the coordinator
    pub fn on_frame(&mut self, ctx: &mut Context<'_>, frame: &Frame, now: Instant) {
        match (frame, &mut self.phase) {
            (Frame::Response { address }, Phase::Handshake(handshake)) => {
                handshake.on_response(ctx, *address, now);
            }
            (frame, _) => debug!(kind = ?frame.kind(), "Ignoring join frame"),
        }
    }

    /// The link layer dropped the node from the network
    pub fn on_left_network(&mut self, ctx: &mut Context<'_>, now: Instant) {
        info!("Left network");
        if ctx.store.connection_status() != ConnectionStatus::Connected {
            return;
        }
        ctx.store.set_connection_status(ConnectionStatus::NotConnected);
        self.indicate(Indication::ConnectionLost);
        self.rejoin(ctx, now);
    }

    fn start_scan(&mut self, ctx: &mut Context<'_>, mode: JoinMode, now: Instant) {
        let scan_mode = match mode {
            JoinMode::Join => ScanMode::Join,
            JoinMode::Rejoin => {
                let config = ctx.store.config();
                ScanMode::Rejoin {
                    pan_id: config.pan_id,
                    coordinator: config.coordinator_address,
                }
            }
        };
        self.scanner.start(ctx.link, scan_mode, now);
        self.phase = Phase::Scanning { mode };
        self.indicate(Indication::ScanStarted { mode });
    }

    fn associate(
        &mut self,
        ctx: &mut Context<'_>,
        mode: JoinMode,
        beacon: BeaconInfo,
        now: Instant,
    ) -> Option<EngineOutcome> {
        info!(source = %beacon.source_address, channel = beacon.channel, "Start link as end point");
        ScheduleManager::tolerate(ctx.schedule.init_slotframe(ctx.link));
        ScheduleManager::tolerate(ctx.schedule.add_beacon_slots(ctx.link));

        match ctx.link.associate() {
            Ok(()) => {
                self.phase = Phase::Associating {
                    mode,
                    deadline: now + self.config.timing.association_timeout,
                };
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to start association");
                self.attempt_failed(mode, now)
            }
        }
    }

    fn handshake_finished(&mut self, outcome: HandshakeOutcome, now: Instant) -> Option<EngineOutcome> {
        match outcome {
            HandshakeOutcome::Connected(address) => {
                self.phase = Phase::Connected;
                self.indicate(Indication::JoinSucceeded { address });
                Some(EngineOutcome::Connected)
            }
            HandshakeOutcome::Aborted(reason) => {
                error!(?reason, "Failed handshake");
                self.attempt_failed(JoinMode::Join, now)
            }
        }
    }

    fn attempt_failed(&mut self, mode: JoinMode, now: Instant) -> Option<EngineOutcome> {
        match mode {
            JoinMode::Join => {
                self.phase = Phase::Idle;
                self.indicate(Indication::JoinFailed);
                Some(EngineOutcome::JoinFailed)
            }
            JoinMode::Rejoin => {
                let retry_in = self.config.timing.rejoin_backoff;
                info!(retry_in = ?retry_in, "Wait then retry to rejoin");
                self.phase = Phase::Backoff {
                    until: now + retry_in,
                };
                self.indicate(Indication::RejoinBackoff { retry_in });
                None
            }
        }
    }

    fn indicate(&self, indication: Indication) {
        debug!(?indication, "Indication");
        let _ = self.indications.send(indication);
    }
}
