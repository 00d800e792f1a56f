use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;

use smartcell_net::core::{FrameKind, JoinFlag, TxStatus};
use smartcell_net::network::BeaconInfo;
use smartcell_net::schedule::SlotframeLayout;
use smartcell_net::storage::ConfigField;
use smartcell_net::{
    Command, ConfigStore, Exit, FixedHardwareId, Indication, JoinMode, MemoryFlash, NodeConfig,
    Result, ScheduledLink, ShortAddress, SimHandle, SimLink, SmartCell,
};

const HW_ID: [u8; 8] = [0x01, 0x00, 0xCE, 0xFA, 0x00, 0x00, 0x00, 0x07];
const COORDINATOR: ShortAddress = ShortAddress(0x0001);
const PAN_ID: u16 = 0xABCD;
const NETWORK_EPOCH: u32 = 1_700_000_000;

struct Harness {
    handle: SimHandle,
    flash: MemoryFlash,
    indications: mpsc::UnboundedReceiver<Indication>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<(Result<Exit>, SmartCell<SimLink>)>,
}

impl Harness {
    fn start(flash: MemoryFlash) -> Self {
        let (link, handle, events) = SimLink::new();
        handle.set_network_pan_id(PAN_ID);
        handle.set_network_time(NETWORK_EPOCH);
        handle.set_auto_complete(Some(TxStatus::Ok));

        let (node, indications) = SmartCell::new(
            NodeConfig::default(),
            link,
            Box::new(flash.clone()),
            Box::new(FixedHardwareId(HW_ID)),
        )
        .unwrap();
        let mut node = node.with_sampler(|| Some(Bytes::from_static(&[0x12, 0x34])));

        let (commands, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let exit = node.run(events, rx).await;
            (exit, node)
        });

        Harness {
            handle,
            flash,
            indications,
            commands,
            task,
        }
    }

    async fn indication(&mut self) -> Indication {
        timeout(Duration::from_secs(3600), self.indications.recv())
            .await
            .expect("no indication within an hour")
            .expect("indication stream closed")
    }

    /// Skips indications until one matches
    async fn expect(&mut self, wanted: Indication) {
        loop {
            if self.indication().await == wanted {
                return;
            }
        }
    }

    /// Waits until a frame of `kind` has been handed to the link
    async fn wait_for_frame(&self, kind: FrameKind) {
        for _ in 0..600 {
            if self.frames(kind) > 0 {
                return;
            }
            sleep(Duration::from_secs(1)).await;
        }
        panic!("no {:?} frame sent", kind);
    }

    fn frames(&self, kind: FrameKind) -> usize {
        self.handle
            .sent()
            .iter()
            .filter(|frame| frame.payload.first() == Some(&(kind as u8)))
            .count()
    }

    fn announce(&self, source: ShortAddress, rssi: i16, join_flag: JoinFlag) -> bool {
        self.handle.announce(BeaconInfo {
            source_address: source,
            source_pan_id: PAN_ID,
            channel: 18,
            rssi,
            join_flag,
        })
    }

    async fn finish(self) -> (Exit, SmartCell<SimLink>) {
        let (exit, node) = self.task.await.unwrap();
        (exit.unwrap(), node)
    }
}

fn bound_flash() -> MemoryFlash {
    let flash = MemoryFlash::new();
    let mut store = ConfigStore::new(Box::new(flash.clone()));
    store.write_defaults(&FixedHardwareId(HW_ID)).unwrap();
    store.set_field(ConfigField::PanId(PAN_ID)).unwrap();
    store.set_field(ConfigField::CoordinatorAddress(COORDINATOR)).unwrap();
    store.persist().unwrap();
    flash
}

async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

/// Runs a first join up to the point the coordinator has confirmed it
async fn join_network(h: &mut Harness) {
    h.expect(Indication::ScanStarted { mode: JoinMode::Join }).await;
    assert!(h.announce(ShortAddress(0x0002), -60, JoinFlag::ManualJoinOpen));
    assert!(h.announce(COORDINATOR, -40, JoinFlag::ManualJoinOpen));

    h.wait_for_frame(FrameKind::Request).await;
    let request = h.handle.sent()[0].clone();
    assert_eq!(request.dest, COORDINATOR);
    assert_eq!(request.max_transmissions, 8);
    assert_eq!(&request.payload[1..], &0xFACE_0001u32.to_le_bytes());
    assert_eq!(h.handle.locked_beacon(), Some((COORDINATOR, 18)));

    h.handle.deliver(COORDINATOR, vec![0x01, 0x00, 0x2A]);
    h.expect(Indication::JoinSucceeded {
        address: ShortAddress(0x002A),
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_first_join() {
    let mut h = Harness::start(MemoryFlash::new());
    join_network(&mut h).await;

    assert_eq!(h.frames(FrameKind::Successful), 1);
    assert_eq!(h.handle.own_address(), ShortAddress(0x002A));
    assert!(h.handle.single_packet());
    for slot in SlotframeLayout::default().data_slots(ShortAddress(0x002A)).unwrap() {
        assert!(h.handle.has_link(slot.slot_offset));
    }

    let mut store = ConfigStore::new(Box::new(h.flash.clone()));
    let stored = assert_ok!(store.load()).unwrap();
    assert_eq!(stored.pan_id, PAN_ID);
    assert_eq!(stored.short_address, ShortAddress(0x002A));
    assert_eq!(stored.coordinator_address, COORDINATOR);

    // telemetry is released once connected
    h.handle.cycle_start();
    settle().await;
    let measurement = h.handle.sent().last().cloned().unwrap();
    assert_eq!(measurement.payload[0], FrameKind::Measurement as u8);
    assert_eq!(&measurement.payload[5..], &[0x12, 0x34]);
    // stamped with network time, not time since telemetry started
    let mut stamp = [0u8; 4];
    stamp.copy_from_slice(&measurement.payload[1..5]);
    let stamp = u32::from_le_bytes(stamp);
    assert!(stamp >= NETWORK_EPOCH);
    assert!(stamp <= h.handle.network_time());
    assert_eq!(measurement.dest, COORDINATOR);
    assert_eq!(measurement.max_transmissions, 2);

    h.commands.send(Command::QueryStatus).await.unwrap();
    h.expect(Indication::Status { connected: true }).await;

    h.commands.send(Command::Shutdown).await.unwrap();
    let (exit, node) = h.finish().await;
    assert_eq!(exit, Exit::Shutdown);
    assert!(node.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_response_timeout_shuts_down() {
    let mut h = Harness::start(MemoryFlash::new());
    h.expect(Indication::ScanStarted { mode: JoinMode::Join }).await;
    assert!(h.announce(COORDINATOR, -40, JoinFlag::ManualJoinOpen));
    h.wait_for_frame(FrameKind::Request).await;

    let handle = h.handle.clone();
    let flash = h.flash.clone();
    let mut indications = std::mem::replace(&mut h.indications, mpsc::unbounded_channel().1);
    let (exit, node) = h.finish().await;
    assert_eq!(exit, Exit::Shutdown);
    assert!(!node.is_connected());

    let mut seen = Vec::new();
    while let Ok(indication) = indications.try_recv() {
        seen.push(indication);
    }
    assert_eq!(
        &seen[seen.len() - 2..],
        &[Indication::JoinFailed, Indication::ShutdownRequested]
    );
    assert!(handle.single_packet());

    // nothing beyond the factory defaults was persisted
    let mut store = ConfigStore::new(Box::new(flash));
    let stored = assert_ok!(store.load()).unwrap();
    assert_eq!(stored.pan_id, 0);
    assert!(stored.coordinator_address.is_null());
}

#[tokio::test(start_paused = true)]
async fn test_busy_single_packet_retains_measurement() {
    let mut h = Harness::start(MemoryFlash::new());
    join_network(&mut h).await;
    h.handle.set_auto_complete(None);
    let before = h.frames(FrameKind::Measurement);

    h.handle.cycle_start();
    settle().await;
    assert_eq!(h.handle.in_flight(), 1);

    // the slot is still taken, nothing new goes out
    sleep(Duration::from_secs(1)).await;
    h.handle.cycle_start();
    settle().await;
    assert_eq!(h.frames(FrameKind::Measurement), before + 1);

    h.handle.complete_tx(TxStatus::Ok);
    settle().await;
    sleep(Duration::from_secs(1)).await;
    h.handle.cycle_start();
    settle().await;
    assert_eq!(h.frames(FrameKind::Measurement), before + 2);

    let sent = h.handle.sent();
    let measurements: Vec<_> = sent
        .iter()
        .filter(|frame| frame.payload[0] == FrameKind::Measurement as u8)
        .collect();
    assert_ne!(measurements[0].payload, measurements[1].payload);

    h.commands.send(Command::Shutdown).await.unwrap();
    assert_eq!(h.finish().await.0, Exit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_flash_cold_start() {
    let flash = bound_flash();
    flash.inject_corruption(5);
    let mut h = Harness::start(flash);

    assert_eq!(
        h.indication().await,
        Indication::ScanStarted { mode: JoinMode::Join }
    );
    assert_eq!(h.handle.own_address(), ShortAddress(0x0007));

    h.commands.send(Command::Shutdown).await.unwrap();
    assert_eq!(h.finish().await.0, Exit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_backoff_and_retry() {
    let mut h = Harness::start(bound_flash());
    assert_eq!(
        h.indication().await,
        Indication::ScanStarted { mode: JoinMode::Rejoin }
    );
    assert_eq!(
        h.indication().await,
        Indication::ScanFailed { mode: JoinMode::Rejoin }
    );
    assert_eq!(
        h.indication().await,
        Indication::RejoinBackoff {
            retry_in: Duration::from_secs(300)
        }
    );
    assert_eq!(
        h.indication().await,
        Indication::ScanStarted { mode: JoinMode::Rejoin }
    );

    // beacons of other coordinators and open join windows are ignored
    assert!(h.announce(ShortAddress(0x0002), -30, JoinFlag::ManualJoinClosed));
    assert!(h.announce(COORDINATOR, -30, JoinFlag::ManualJoinOpen));
    assert!(h.announce(COORDINATOR, -70, JoinFlag::ManualJoinClosed));
    assert_eq!(
        h.indication().await,
        Indication::Rejoined {
            address: ShortAddress(0x0007)
        }
    );
    assert_eq!(h.handle.locked_beacon(), Some((COORDINATOR, 18)));
    for slot in SlotframeLayout::default().data_slots(ShortAddress(0x0007)).unwrap() {
        assert!(h.handle.has_link(slot.slot_offset));
    }
    assert!(h.handle.sent().is_empty());

    h.commands.send(Command::Shutdown).await.unwrap();
    assert_eq!(h.finish().await.0, Exit::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_leave_network_rejoins() {
    let mut h = Harness::start(MemoryFlash::new());
    join_network(&mut h).await;

    h.handle.leave_network();
    h.expect(Indication::ConnectionLost).await;
    assert_eq!(
        h.indication().await,
        Indication::ScanStarted { mode: JoinMode::Rejoin }
    );

    h.commands.send(Command::QueryStatus).await.unwrap();
    h.expect(Indication::Status { connected: false }).await;

    assert!(h.announce(COORDINATOR, -50, JoinFlag::ManualJoinClosed));
    h.expect(Indication::Rejoined {
        address: ShortAddress(0x002A),
    })
    .await;

    h.commands.send(Command::Shutdown).await.unwrap();
    let (_, node) = h.finish().await;
    assert!(node.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_factory_reset_erase_failure_restarts() {
    let mut h = Harness::start(bound_flash());
    h.expect(Indication::ScanStarted { mode: JoinMode::Rejoin }).await;

    h.flash.set_fail_erase(true);
    h.commands.send(Command::FactoryReset).await.unwrap();
    h.expect(Indication::RestartRequired).await;

    let (exit, node) = h.finish().await;
    assert_eq!(exit, Exit::Restart);
    assert!(!node.is_connected());
    assert!(!node.link().is_associated());
}
