//! Runs one smart cell against a scripted coordinator on the in-process link.
//!
//! Time is simulated, so the whole join completes instantly. Use
//! `RUST_LOG=smartcell_net=debug` for the full protocol trace.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use smartcell_net::core::{JoinFlag, JOIN_HOPPING_SEQUENCE};
use smartcell_net::network::BeaconInfo;
use smartcell_net::{
    Command, FixedHardwareId, Frame, Indication, MemoryFlash, NodeConfig, ShortAddress,
    SimHandle, SimLink, SmartCell,
};

const COORDINATOR: ShortAddress = ShortAddress(0x0001);
const PAN_ID: u16 = 0xABCD;

/// Beacons on every hopping channel; the node hears the one it listens to
async fn advertise(handle: SimHandle) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        for &channel in JOIN_HOPPING_SEQUENCE.iter() {
            let rssi = -45 + rand::thread_rng().gen_range(-5..=5);
            handle.announce(BeaconInfo {
                source_address: COORDINATOR,
                source_pan_id: PAN_ID,
                channel,
                rssi,
                join_flag: JoinFlag::ManualJoinOpen,
            });
        }
    }
}

/// Answers join requests and prints measurements
async fn coordinate(handle: SimHandle) {
    let mut seen = 0;
    let mut ticker = interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        let sent = handle.sent();
        for frame in &sent[seen..] {
            match Frame::decode(&frame.payload) {
                Ok(Frame::Request { serial }) => {
                    let address = ShortAddress(0x0100 | (serial as u16 & 0x00FF));
                    info!(serial, %address, "Coordinator: assigning address");
                    handle.deliver(COORDINATOR, Frame::Response { address }.encode().unwrap_or_default());
                }
                Ok(Frame::Successful) => info!("Coordinator: join confirmed"),
                Ok(Frame::Measurement { timestamp, value }) => {
                    info!(timestamp, value = ?value, "Coordinator: measurement")
                }
                Ok(other) => info!(frame = ?other, "Coordinator: frame"),
                Err(e) => info!(error = %e, "Coordinator: bad frame"),
            }
        }
        seen = sent.len();
    }
}

/// Slotframe cycle signal
async fn cycles(handle: SimHandle) {
    let mut ticker = interval(Duration::from_secs(4));
    loop {
        ticker.tick().await;
        handle.cycle_start();
    }
}

#[tokio::main(flavor = "current_thread", start_paused = true)]
async fn main() -> smartcell_net::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (link, handle, events) = SimLink::new();
    handle.set_network_pan_id(PAN_ID);
    handle.set_network_time(1_700_000_000);
    handle.set_auto_complete(Some(smartcell_net::core::TxStatus::Ok));

    let (node, mut indications) = SmartCell::new(
        NodeConfig::default(),
        link,
        Box::new(MemoryFlash::new()),
        Box::new(FixedHardwareId::random()),
    )?;
    let mut node = node.with_sampler(|| {
        let millivolts: u16 = rand::thread_rng().gen_range(3100..3400);
        Some(Bytes::copy_from_slice(&millivolts.to_le_bytes()))
    });

    tokio::spawn(advertise(handle.clone()));
    tokio::spawn(coordinate(handle.clone()));
    tokio::spawn(cycles(handle.clone()));

    let (commands, rx) = mpsc::channel(4);
    let node_task = tokio::spawn(async move { node.run(events, rx).await });

    while let Some(indication) = indications.recv().await {
        println!("Indication: {:?}", indication);
        match indication {
            Indication::JoinSucceeded { .. } => {
                // report for a while, then power down
                sleep(Duration::from_secs(30)).await;
                let _ = commands.send(Command::QueryStatus).await;
                let _ = commands.send(Command::Shutdown).await;
            }
            Indication::ShutdownRequested | Indication::RestartRequired => break,
            _ => {}
        }
    }

    match node_task.await {
        Ok(exit) => println!("Node stopped: {:?}", exit?),
        Err(e) => eprintln!("Node task failed: {}", e),
    }
    Ok(())
}
