use std::cmp::Ordering;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::{
    ConnectionStatus, Error, JoinTiming, Result, ShortAddress, TxOrigin, TxStatus,
};
use crate::schedule::ScheduleManager;
use crate::storage::ConfigField;
use crate::util::hex;
use super::frame::Frame;
use super::Context;

/// Phase of the join handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinState {
    /// Sending the join request
    RequestTx,
    /// Waiting for the coordinator's response
    ResponseRx,
    /// Sending the join confirmation
    SuccessfulTx,
}

impl JoinState {
    fn rank(&self) -> u8 {
        match self {
            JoinState::RequestTx => 0,
            JoinState::ResponseRx => 1,
            JoinState::SuccessfulTx => 2,
        }
    }

    /// Returns true if moving to `next` does not go backwards
    pub fn can_advance_to(&self, next: JoinState) -> bool {
        next.rank() >= self.rank()
    }
}

impl PartialOrd for JoinState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JoinState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// Why a handshake was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The request was not delivered in time
    RequestTimeout,
    /// No response arrived in time
    ResponseTimeout,
    /// The confirmation was not delivered in time
    SuccessfulTimeout,
    /// The whole handshake took too long
    OverallTimeout,
}

/// Terminal result of a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Joined with the given address
    Connected(ShortAddress),
    /// Gave up
    Aborted(AbortReason),
}

/// Request/response/confirm exchange with the coordinator
///
/// Every phase has its own timeout on top of an overall one. Join frames
/// are sent on a fixed retry period while nothing is in flight. A phase
/// that times out with a frame still in flight waits for its completion
/// before giving up.
#[derive(Debug)]
pub struct Handshake {
    timing: JoinTiming,
    transmissions: u8,
    state: JoinState,
    destination: ShortAddress,
    assigned: Option<ShortAddress>,
    overall_deadline: Instant,
    phase_deadline: Option<Instant>,
    retry_at: Option<Instant>,
    in_flight: bool,
}

impl Handshake {
    /// Starts a handshake with the current time-source neighbour
    pub fn start(ctx: &mut Context<'_>, timing: JoinTiming, transmissions: u8, now: Instant) -> Self {
        ctx.store.set_connection_status(ConnectionStatus::NotConnected);
        ctx.link.set_single_packet(false);

        let destination = ctx.link.time_source_address();
        let overall_deadline = now + timing.handshake_timeout();
        info!(%destination, "Start handshake");

        let mut handshake = Handshake {
            timing,
            transmissions,
            state: JoinState::RequestTx,
            destination,
            assigned: None,
            overall_deadline,
            phase_deadline: None,
            retry_at: None,
            in_flight: false,
        };
        handshake.enter(ctx, JoinState::RequestTx, now);
        handshake
    }

    /// Current phase
    pub fn state(&self) -> JoinState {
        self.state
    }

    /// Coordinator the handshake talks to
    pub fn destination(&self) -> ShortAddress {
        self.destination
    }

    /// Earliest instant `on_tick` has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let phase = match self.state {
            JoinState::ResponseRx => self.phase_deadline,
            JoinState::RequestTx | JoinState::SuccessfulTx => self.retry_at,
        };
        Some(phase.map_or(self.overall_deadline, |at| at.min(self.overall_deadline)))
    }

    /// Runs expired timers
    pub fn on_tick(&mut self, ctx: &mut Context<'_>, now: Instant) -> Option<HandshakeOutcome> {
        if now >= self.overall_deadline {
            info!("Join timeout expired");
            return Some(self.abort(ctx, AbortReason::OverallTimeout));
        }

        match self.state {
            JoinState::ResponseRx => {
                if self.phase_expired(now) {
                    info!("Join response timeout expired");
                    return Some(self.abort(ctx, AbortReason::ResponseTimeout));
                }
                None
            }
            JoinState::RequestTx | JoinState::SuccessfulTx => {
                match self.retry_at {
                    Some(at) if at <= now => {}
                    _ => return None,
                }
                self.retry_at = Some(now + self.timing.retry_interval);

                if self.phase_expired(now) && !self.in_flight {
                    return Some(self.abort(ctx, self.phase_reason()));
                }
                self.transmit(ctx);
                None
            }
        }
    }

    /// Handles the completion of a join frame
    pub fn on_tx_done(
        &mut self,
        ctx: &mut Context<'_>,
        status: TxStatus,
        now: Instant,
    ) -> Option<HandshakeOutcome> {
        let failed = !matches!(status, TxStatus::Ok | TxStatus::Busy);
        self.in_flight = false;

        match self.state {
            JoinState::RequestTx => {
                if failed {
                    error!(?status, "Failed Tx req frame");
                    if self.phase_expired(now) {
                        return Some(self.abort(ctx, AbortReason::RequestTimeout));
                    }
                    return None;
                }
                info!(destination = %self.destination, "Tx req to gw");
                ScheduleManager::tolerate(ctx.schedule.remove_join_request_slots(ctx.link));
                self.phase_deadline = None;
                self.enter(ctx, JoinState::ResponseRx, now);
                None
            }
            JoinState::SuccessfulTx => {
                if failed || ctx.store.is_connected() {
                    if failed {
                        error!(?status, "Failed Tx succ frame");
                    }
                    if self.phase_expired(now) {
                        return Some(self.abort(ctx, AbortReason::SuccessfulTimeout));
                    }
                    return None;
                }
                info!(destination = %self.destination, "Tx succ to gw");
                Some(self.complete(ctx))
            }
            JoinState::ResponseRx => {
                debug!(?status, "Join frame completed while waiting for response");
                None
            }
        }
    }

    /// Handles a join response carrying the assigned address
    ///
    /// Ignored outside the response phase.
    pub fn on_response(&mut self, ctx: &mut Context<'_>, address: ShortAddress, now: Instant) {
        if self.state != JoinState::ResponseRx {
            debug!(%address, state = ?self.state, "Ignoring join response");
            return;
        }

        ctx.link.set_own_address(address);
        self.assigned = Some(address);
        info!(%address, "Rx resp; new device address");

        self.phase_deadline = None;
        self.enter(ctx, JoinState::SuccessfulTx, now);
    }

    /// Tears the handshake down without an outcome
    pub fn cancel(&mut self, ctx: &mut Context<'_>) {
        self.teardown(ctx);
    }

    fn enter(&mut self, ctx: &mut Context<'_>, next: JoinState, now: Instant) {
        if !self.state.can_advance_to(next) {
            warn!(from = ?self.state, to = ?next, "Refusing backward join state change");
            return;
        }
        self.state = next;

        match next {
            JoinState::RequestTx => {
                ScheduleManager::tolerate(ctx.schedule.add_join_request_slots(ctx.link));
                self.phase_deadline = Some(now + self.timing.request_timeout);
                self.retry_at = Some(now + self.timing.retry_interval);
            }
            JoinState::ResponseRx => {
                self.phase_deadline = Some(now + self.timing.response_timeout);
                self.retry_at = None;
                ScheduleManager::tolerate(
                    ctx.schedule.add_join_process_slots(ctx.link, self.destination),
                );
                info!("Wait for resp Rx");
            }
            JoinState::SuccessfulTx => {
                self.phase_deadline = Some(now + self.timing.successful_timeout);
                self.retry_at = Some(now + self.timing.retry_interval);
            }
        }
    }

    fn phase_expired(&self, now: Instant) -> bool {
        self.phase_deadline.map_or(true, |at| now >= at)
    }

    fn phase_reason(&self) -> AbortReason {
        match self.state {
            JoinState::RequestTx => AbortReason::RequestTimeout,
            JoinState::ResponseRx => AbortReason::ResponseTimeout,
            JoinState::SuccessfulTx => AbortReason::SuccessfulTimeout,
        }
    }

    fn transmit(&mut self, ctx: &mut Context<'_>) {
        if !ctx.link.is_associated() {
            info!("Wait for cxn to gw");
            return;
        }
        if self.in_flight {
            error!(state = ?self.state, "Join frame still active");
            return;
        }

        let frame = match self.state {
            JoinState::RequestTx => Frame::Request {
                serial: ctx.store.config().serial,
            },
            JoinState::SuccessfulTx => Frame::Successful,
            JoinState::ResponseRx => return,
        };

        self.destination = ctx.link.time_source_address();
        match self.send(ctx, &frame) {
            Ok(()) => self.in_flight = true,
            Err(e) => error!(kind = ?frame.kind(), error = %e, "Failed join Tx"),
        }
    }

    fn send(&self, ctx: &mut Context<'_>, frame: &Frame) -> Result<()> {
        let payload = frame.encode()?;
        debug!(destination = %self.destination, payload = %hex(&payload), "Tx join frame");
        ctx.link
            .send(payload, self.destination, self.transmissions, TxOrigin::Join)
    }

    fn complete(&mut self, ctx: &mut Context<'_>) -> HandshakeOutcome {
        let own = self
            .assigned
            .unwrap_or_else(|| ctx.store.config().short_address);

        ScheduleManager::tolerate(ctx.schedule.remove_join_process_slots(ctx.link));
        ScheduleManager::tolerate(ctx.schedule.add_data_slots(ctx.link, own));
        self.stop_timers();

        let pan_id = ctx.link.pan_id();
        info!(pan_id, "Set PAN ID of device");
        if let Err(e) = self.persist_binding(ctx, pan_id, own) {
            error!(error = %e, "Failed to store join binding");
        }

        info!(address = %own, "Device joined NW successfully");
        ctx.store.set_connection_status(ConnectionStatus::Connected);
        ctx.link.set_single_packet(true);
        HandshakeOutcome::Connected(own)
    }

    fn persist_binding(&self, ctx: &mut Context<'_>, pan_id: u16, own: ShortAddress) -> Result<()> {
        if own.is_null() {
            return Err(Error::InvalidAddress(own.get()));
        }
        ctx.store.set_field(ConfigField::PanId(pan_id))?;
        ctx.store.set_field(ConfigField::ShortAddress(own))?;
        ctx.store
            .set_field(ConfigField::CoordinatorAddress(self.destination))?;
        ctx.store.persist()
    }

    fn abort(&mut self, ctx: &mut Context<'_>, reason: AbortReason) -> HandshakeOutcome {
        warn!(?reason, state = ?self.state, "Exit join");
        self.teardown(ctx);
        HandshakeOutcome::Aborted(reason)
    }

    fn teardown(&mut self, ctx: &mut Context<'_>) {
        ctx.link.set_single_packet(true);
        ScheduleManager::tolerate(ctx.schedule.remove_join_request_slots(ctx.link));
        ScheduleManager::tolerate(ctx.schedule.remove_join_process_slots(ctx.link));
        self.stop_timers();
        self.in_flight = false;
    }

    fn stop_timers(&mut self) {
        self.phase_deadline = None;
        self.retry_at = None;
    }
}
