//! In-process scheduled link
//!
//! `SimLink` implements [`ScheduledLink`] entirely in memory. A cloneable
//! [`SimHandle`] plays the coordinator and the radio environment: it
//! inspects the schedule and the frames sent, completes transmissions and
//! injects received frames, beacons and cycle signals.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::core::{Error, PanId, Result, ShortAddress, TxOrigin, TxStatus};
use crate::schedule::ScheduleSlot;
use super::{BeaconInfo, LinkEvent, NetworkClock, ScheduledLink};

/// A frame handed to the link
#[derive(Debug, Clone, PartialEq)]
pub struct SentFrame {
    pub payload: Bytes,
    pub dest: ShortAddress,
    pub max_transmissions: u8,
    pub origin: TxOrigin,
}

#[derive(Debug, Default)]
struct SimState {
    slotframe_len: Option<u16>,
    links: BTreeMap<(u16, u16), ScheduleSlot>,
    link_budget: Option<usize>,
    sent: Vec<SentFrame>,
    in_flight: VecDeque<TxOrigin>,
    single_packet: bool,
    auto_complete: Option<TxStatus>,
    associated: bool,
    association_ok: bool,
    autonomous_scan: bool,
    listening: Option<u8>,
    locked: Option<(ShortAddress, u8)>,
    own_address: ShortAddress,
    pan_id: PanId,
    time_source: ShortAddress,
    network_pan_id: PanId,
    time_base: u32,
    epoch: Option<Instant>,
}

impl SimState {
    fn network_time(&self) -> u32 {
        let elapsed = self
            .epoch
            .map(|epoch| epoch.elapsed().as_secs())
            .unwrap_or_default();
        let elapsed = u32::try_from(elapsed).unwrap_or(u32::MAX);
        self.time_base.saturating_add(elapsed)
    }
}

/// Simulated scheduled link
pub struct SimLink {
    state: Arc<Mutex<SimState>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

/// Reader of a [`SimLink`]'s network time
#[derive(Clone)]
pub struct SimClock {
    state: Arc<Mutex<SimState>>,
}

impl NetworkClock for SimClock {
    fn absolute_time(&self) -> u32 {
        lock(&self.state).network_time()
    }
}

/// Control side of a [`SimLink`]
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimLink {
    /// Creates a link, its control handle and the event stream it feeds
    pub fn new() -> (SimLink, SimHandle, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SimState {
            single_packet: true,
            association_ok: true,
            autonomous_scan: true,
            epoch: Some(Instant::now()),
            ..SimState::default()
        }));

        let link = SimLink {
            state: Arc::clone(&state),
            events: tx.clone(),
        };
        let handle = SimHandle { state, events: tx };
        (link, handle, rx)
    }

    fn emit(&self, event: LinkEvent) {
        // The receiver is gone once the runtime has exited.
        let _ = self.events.send(event);
    }
}

impl ScheduledLink for SimLink {
    fn init_slotframe(&mut self, length: u16) -> Result<()> {
        let mut state = lock(&self.state);
        state.slotframe_len = Some(length);
        state.links.clear();
        Ok(())
    }

    fn add_link(&mut self, slot: &ScheduleSlot) -> Result<()> {
        let mut state = lock(&self.state);
        let key = (slot.slot_offset, slot.channel_offset);
        if state.links.contains_key(&key) {
            return Err(Error::link(format!(
                "slot {}/{} already scheduled",
                slot.slot_offset, slot.channel_offset
            )));
        }
        if let Some(budget) = state.link_budget.as_mut() {
            if *budget == 0 {
                return Err(Error::link("schedule full"));
            }
            *budget -= 1;
        }
        state.links.insert(key, *slot);
        Ok(())
    }

    fn remove_link(&mut self, slot_offset: u16, channel_offset: u16) -> Result<()> {
        lock(&self.state)
            .links
            .remove(&(slot_offset, channel_offset))
            .map(|_| ())
            .ok_or_else(|| Error::link(format!("no slot at {}/{}", slot_offset, channel_offset)))
    }

    fn send(
        &mut self,
        payload: Bytes,
        dest: ShortAddress,
        max_transmissions: u8,
        origin: TxOrigin,
    ) -> Result<()> {
        let auto_complete = {
            let mut state = lock(&self.state);
            if state.single_packet && !state.in_flight.is_empty() {
                return Err(Error::Busy);
            }
            trace!(?origin, %dest, len = payload.len(), "sim send");
            state.sent.push(SentFrame {
                payload,
                dest,
                max_transmissions,
                origin,
            });
            match state.auto_complete {
                Some(status) => Some(status),
                None => {
                    state.in_flight.push_back(origin);
                    None
                }
            }
        };

        if let Some(status) = auto_complete {
            self.emit(LinkEvent::TxDone { origin, status });
        }
        Ok(())
    }

    fn set_single_packet(&mut self, enabled: bool) {
        lock(&self.state).single_packet = enabled;
    }

    fn associate(&mut self) -> Result<()> {
        let event = {
            let mut state = lock(&self.state);
            let (source, _) = state
                .locked
                .ok_or(Error::NullReference("locked beacon"))?;
            if state.association_ok {
                state.associated = true;
                state.time_source = source;
                state.pan_id = state.network_pan_id;
                LinkEvent::Associated
            } else {
                LinkEvent::AssociationFailed
            }
        };
        self.emit(event);
        Ok(())
    }

    fn deassociate(&mut self) {
        let mut state = lock(&self.state);
        state.associated = false;
        state.in_flight.clear();
    }

    fn is_associated(&self) -> bool {
        lock(&self.state).associated
    }

    fn time_source_address(&self) -> ShortAddress {
        lock(&self.state).time_source
    }

    fn set_own_address(&mut self, address: ShortAddress) {
        lock(&self.state).own_address = address;
    }

    fn pan_id(&self) -> PanId {
        lock(&self.state).pan_id
    }

    fn set_autonomous_scan(&mut self, enabled: bool) {
        lock(&self.state).autonomous_scan = enabled;
    }

    fn listen(&mut self, channel: u8) -> Result<()> {
        debug!(channel, "sim listen");
        lock(&self.state).listening = Some(channel);
        Ok(())
    }

    fn radio_off(&mut self) {
        lock(&self.state).listening = None;
    }

    fn lock_beacon(&mut self, source: ShortAddress, channel: u8) -> Result<()> {
        lock(&self.state).locked = Some((source, channel));
        Ok(())
    }

    fn absolute_time(&self) -> u32 {
        lock(&self.state).network_time()
    }

    fn clock(&self) -> Arc<dyn NetworkClock> {
        Arc::new(SimClock {
            state: Arc::clone(&self.state),
        })
    }
}

impl SimHandle {
    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    /// Sets the PAN id adopted on association
    pub fn set_network_pan_id(&self, pan_id: PanId) {
        lock(&self.state).network_pan_id = pan_id;
    }

    /// Sets the network absolute time, which then advances with the clock
    pub fn set_network_time(&self, secs: u32) {
        let mut state = lock(&self.state);
        state.time_base = secs;
        state.epoch = Some(Instant::now());
    }

    /// Current network absolute time in seconds
    pub fn network_time(&self) -> u32 {
        lock(&self.state).network_time()
    }

    /// Makes future associations succeed or fail
    pub fn set_association_ok(&self, ok: bool) {
        lock(&self.state).association_ok = ok;
    }

    /// Completes every future send immediately with `status`
    pub fn set_auto_complete(&self, status: Option<TxStatus>) {
        lock(&self.state).auto_complete = status;
    }

    /// Lets the next `count` slot additions succeed and fails the rest
    pub fn fail_links_after(&self, count: usize) {
        lock(&self.state).link_budget = Some(count);
    }

    /// Completes the oldest in-flight frame
    pub fn complete_tx(&self, status: TxStatus) -> Option<TxOrigin> {
        let origin = lock(&self.state).in_flight.pop_front()?;
        self.emit(LinkEvent::TxDone { origin, status });
        Some(origin)
    }

    /// Delivers a received frame
    pub fn deliver(&self, source: ShortAddress, payload: impl Into<Bytes>) {
        self.emit(LinkEvent::Received {
            source,
            payload: payload.into(),
        });
    }

    /// Announces a beacon, heard only if the radio listens on its channel
    pub fn announce(&self, beacon: BeaconInfo) -> bool {
        let heard = lock(&self.state).listening == Some(beacon.channel);
        if heard {
            self.emit(LinkEvent::Beacon(beacon));
        }
        heard
    }

    /// Signals the start of a slotframe cycle
    pub fn cycle_start(&self) {
        self.emit(LinkEvent::CycleStart);
    }

    /// Drops the node from the network
    pub fn leave_network(&self) {
        {
            let mut state = lock(&self.state);
            state.associated = false;
            state.in_flight.clear();
        }
        self.emit(LinkEvent::LeftNetwork);
    }

    /// Frames sent so far
    pub fn sent(&self) -> Vec<SentFrame> {
        lock(&self.state).sent.clone()
    }

    /// Drains the frames sent so far
    pub fn take_sent(&self) -> Vec<SentFrame> {
        std::mem::take(&mut lock(&self.state).sent)
    }

    /// Number of frames awaiting completion
    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    /// Scheduled slots ordered by offset
    pub fn links(&self) -> Vec<ScheduleSlot> {
        lock(&self.state).links.values().copied().collect()
    }

    /// Returns true if a slot exists at `slot_offset`
    pub fn has_link(&self, slot_offset: u16) -> bool {
        lock(&self.state).links.contains_key(&(slot_offset, 0))
    }

    pub fn slotframe_len(&self) -> Option<u16> {
        lock(&self.state).slotframe_len
    }

    pub fn single_packet(&self) -> bool {
        lock(&self.state).single_packet
    }

    pub fn associated(&self) -> bool {
        lock(&self.state).associated
    }

    pub fn autonomous_scan(&self) -> bool {
        lock(&self.state).autonomous_scan
    }

    pub fn listening(&self) -> Option<u8> {
        lock(&self.state).listening
    }

    pub fn locked_beacon(&self) -> Option<(ShortAddress, u8)> {
        lock(&self.state).locked
    }

    pub fn own_address(&self) -> ShortAddress {
        lock(&self.state).own_address
    }
}
