//! Smart cell runtime
//!
//! [`SmartCell`] owns every component and drives them from one tokio task:
//! link events, device commands and the earliest component deadline are
//! the only points where it waits.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::core::{ConnectionStatus, Error, NodeConfig, Result};
use crate::network::{Dispatcher, LinkEvent, Route, ScheduledLink};
use crate::protocol::{Context, EngineOutcome, Indication, JoinEngine};
use crate::schedule::ScheduleManager;
use crate::storage::{ConfigStore, HardwareId, Storage};
use crate::telemetry::{
    DownlinkHandler, IgnoreDownlink, MeasurementBuffer, MeasurementSource, NoMeasurements,
    TelemetryScheduler,
};

/// Device-level requests, the button presses of the real device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a first join
    Join,
    /// Rejoin with the stored binding
    Rejoin,
    /// Report the connection status
    QueryStatus,
    /// Power down
    Shutdown,
    /// Erase the stored configuration and power down
    FactoryReset,
}

/// Why the runtime stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The device should power down
    Shutdown,
    /// The device must restart
    Restart,
}

/// Resources shared by the join components
struct Inner<L> {
    link: L,
    store: ConfigStore,
    schedule: ScheduleManager,
}

impl<L: ScheduledLink> Inner<L> {
    fn ctx(&mut self) -> Context<'_> {
        Context {
            link: &mut self.link,
            store: &mut self.store,
            schedule: &self.schedule,
        }
    }
}

/// A smart cell node
pub struct SmartCell<L> {
    inner: Inner<L>,
    engine: JoinEngine,
    telemetry: TelemetryScheduler,
    dispatcher: Dispatcher,
    source: Box<dyn MeasurementSource>,
    retention: usize,
    downlink: Box<dyn DownlinkHandler>,
    hardware: Box<dyn HardwareId>,
    indications: mpsc::UnboundedSender<Indication>,
}

impl<L: ScheduledLink> SmartCell<L> {
    /// Creates a node and the stream of its indications
    pub fn new(
        config: NodeConfig,
        link: L,
        storage: Box<dyn Storage>,
        hardware: Box<dyn HardwareId>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Indication>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let schedule = ScheduleManager::new(config.layout.clone())?;
        let telemetry = TelemetryScheduler::new(config.measurement_transmissions);
        let retention = config.measurement_retention;

        let node = SmartCell {
            inner: Inner {
                link,
                store: ConfigStore::new(storage),
                schedule,
            },
            engine: JoinEngine::new(config, tx.clone()),
            telemetry,
            dispatcher: Dispatcher::new(),
            source: Box::new(NoMeasurements),
            retention,
            downlink: Box::new(IgnoreDownlink),
            hardware,
            indications: tx,
        };
        Ok((node, rx))
    }

    /// Sets the measurement source
    pub fn with_source(mut self, source: impl MeasurementSource + 'static) -> Self {
        self.source = Box::new(source);
        self
    }

    /// Measures with `sampler`, buffering up to the configured retention
    ///
    /// Records are stamped with the link's network absolute time.
    pub fn with_sampler<F>(self, sampler: F) -> Self
    where
        F: FnMut() -> Option<Bytes> + Send + 'static,
    {
        let clock = self.inner.link.clock();
        let buffer = MeasurementBuffer::new(self.retention, clock, sampler);
        self.with_source(buffer)
    }

    /// Sets the handler for remote commands
    pub fn with_downlink(mut self, downlink: impl DownlinkHandler + 'static) -> Self {
        self.downlink = Box::new(downlink);
        self
    }

    pub fn link(&self) -> &L {
        &self.inner.link
    }

    pub fn store(&self) -> &ConfigStore {
        &self.inner.store
    }

    /// Returns true while a member of the network
    pub fn is_connected(&self) -> bool {
        self.inner.store.is_connected()
    }

    /// Loads the configuration and starts joining
    ///
    /// A valid stored binding leads to a rejoin, anything else to a first
    /// join with factory defaults.
    pub fn boot(&mut self, now: Instant) -> Result<()> {
        let warm = match self.inner.store.load() {
            Ok(loaded) => loaded.is_some(),
            Err(e) => {
                warn!(error = %e, "Failed to read config");
                false
            }
        };
        if !warm {
            info!("Cold start");
            if let Err(e) = self.inner.store.write_defaults(self.hardware.as_ref()) {
                warn!(error = %e, "Failed to persist default config");
            }
        }

        let config = self.inner.store.config();
        self.inner.link.set_own_address(config.short_address);
        if self.inner.store.is_bound() {
            info!(pan_id = config.pan_id, coordinator = %config.coordinator_address, "Warm start");
            self.engine.rejoin(&mut self.inner.ctx(), now);
        } else {
            self.engine.join(&mut self.inner.ctx(), now);
        }
        Ok(())
    }

    /// Boots the node and serves events until it has to stop
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) -> Result<Exit> {
        self.boot(Instant::now())?;

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = events.recv() => {
                    let event = event.ok_or_else(|| Error::failure("link event stream closed"))?;
                    if let Some(exit) = self.on_event(event, Instant::now()) {
                        return Ok(exit);
                    }
                }
                Some(command) = commands.recv() => {
                    if let Some(exit) = self.on_command(command, Instant::now()) {
                        return Ok(exit);
                    }
                }
                _ = wait_until(deadline) => {
                    if let Some(exit) = self.on_tick(Instant::now()) {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    /// Earliest instant a component has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.engine.next_deadline(), self.telemetry.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs expired timers
    pub fn on_tick(&mut self, now: Instant) -> Option<Exit> {
        let outcome = self.engine.on_tick(&mut self.inner.ctx(), now);
        self.telemetry
            .on_tick(&self.inner.store, self.source.as_mut(), now);
        self.on_outcome(outcome, now)
    }

    /// Handles one link event
    pub fn on_event(&mut self, event: LinkEvent, now: Instant) -> Option<Exit> {
        let outcome = match self.dispatcher.route(event) {
            Route::Join { frame, .. } => {
                self.engine.on_frame(&mut self.inner.ctx(), &frame, now);
                None
            }
            Route::Downlink(payload) => {
                self.downlink.handle_remote(&payload);
                None
            }
            Route::JoinTxDone(status) => self.engine.on_tx_done(&mut self.inner.ctx(), status, now),
            Route::TelemetryTxDone(status) => {
                self.telemetry.on_tx_done(self.source.as_mut(), status);
                None
            }
            Route::Beacon(beacon) => {
                self.engine.on_beacon(beacon);
                None
            }
            Route::Associated => self.engine.on_associated(&mut self.inner.ctx(), now),
            Route::AssociationFailed => self.engine.on_association_failed(now),
            Route::CycleStart => {
                self.telemetry.on_cycle_start(
                    &mut self.inner.link,
                    &self.inner.store,
                    self.source.as_mut(),
                    now,
                );
                None
            }
            Route::LeftNetwork => {
                self.engine.on_left_network(&mut self.inner.ctx(), now);
                None
            }
            Route::Discard => None,
        };
        self.on_outcome(outcome, now)
    }

    /// Handles one device command
    pub fn on_command(&mut self, command: Command, now: Instant) -> Option<Exit> {
        info!(?command, "Command");
        match command {
            Command::Join => {
                self.engine.join(&mut self.inner.ctx(), now);
                None
            }
            Command::Rejoin => {
                self.engine.rejoin(&mut self.inner.ctx(), now);
                None
            }
            Command::QueryStatus => {
                let connected = self.inner.store.is_connected();
                self.indicate(Indication::Status { connected });
                None
            }
            Command::Shutdown => {
                self.stop();
                self.indicate(Indication::ShutdownRequested);
                Some(Exit::Shutdown)
            }
            Command::FactoryReset => {
                self.stop();
                self.inner.store.set_connection_status(ConnectionStatus::NotConnected);
                self.inner.link.deassociate();
                match self.inner.store.erase_all() {
                    Ok(()) => {
                        info!("Factory reset done");
                        self.indicate(Indication::ShutdownRequested);
                        Some(Exit::Shutdown)
                    }
                    Err(e) => {
                        error!(error = %e, "Factory reset failed");
                        self.indicate(Indication::RestartRequired);
                        Some(Exit::Restart)
                    }
                }
            }
        }
    }

    fn on_outcome(&mut self, outcome: Option<EngineOutcome>, now: Instant) -> Option<Exit> {
        match outcome? {
            EngineOutcome::Connected => {
                if !self.telemetry.is_running() {
                    self.telemetry
                        .start(&mut self.inner.link, &self.inner.store, now);
                }
                None
            }
            EngineOutcome::JoinFailed => {
                self.stop();
                self.indicate(Indication::ShutdownRequested);
                Some(Exit::Shutdown)
            }
        }
    }

    fn stop(&mut self) {
        self.engine.cancel(&mut self.inner.ctx());
        self.telemetry.stop();
    }

    fn indicate(&self, indication: Indication) {
        debug!(?indication, "Indication");
        let _ = self.indications.send(indication);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ShortAddress;
    use crate::network::{SimHandle, SimLink};
    use crate::protocol::JoinMode;
    use crate::storage::{ConfigField, FixedHardwareId, MemoryFlash};

    const HW_ID: [u8; 8] = [0x01, 0x00, 0xCE, 0xFA, 0x00, 0x00, 0x00, 0x07];

    struct Fixture {
        node: SmartCell<SimLink>,
        handle: SimHandle,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        indications: mpsc::UnboundedReceiver<Indication>,
        flash: MemoryFlash,
    }

    fn fixture(flash: MemoryFlash) -> Fixture {
        let (link, handle, events) = SimLink::new();
        let (node, indications) = SmartCell::new(
            NodeConfig::default(),
            link,
            Box::new(flash.clone()),
            Box::new(FixedHardwareId(HW_ID)),
        )
        .unwrap();
        Fixture {
            node,
            handle,
            events,
            indications,
            flash,
        }
    }

    fn bound_flash() -> MemoryFlash {
        let flash = MemoryFlash::new();
        let mut store = ConfigStore::new(Box::new(flash.clone()));
        store.write_defaults(&FixedHardwareId(HW_ID)).unwrap();
        store.set_field(ConfigField::PanId(0xABCD)).unwrap();
        store
            .set_field(ConfigField::CoordinatorAddress(ShortAddress(1)))
            .unwrap();
        store.persist().unwrap();
        flash
    }

    #[test]
    fn test_cold_boot_starts_join() {
        let mut fx = fixture(MemoryFlash::new());
        fx.node.boot(Instant::now()).unwrap();

        let config = fx.node.store().config();
        assert_eq!(config.serial, 0xFACE_0001);
        assert_eq!(config.short_address, ShortAddress(7));
        assert!(!fx.node.store().is_bound());
        assert_eq!(fx.handle.own_address(), ShortAddress(7));
        assert_eq!(fx.flash.erase_count(), 1);
        assert_eq!(
            fx.indications.try_recv().unwrap(),
            Indication::ScanStarted { mode: JoinMode::Join }
        );
    }

    #[test]
    fn test_warm_boot_starts_rejoin() {
        let mut fx = fixture(bound_flash());
        fx.node.boot(Instant::now()).unwrap();

        assert_eq!(fx.node.store().config().pan_id, 0xABCD);
        assert_eq!(
            fx.indications.try_recv().unwrap(),
            Indication::ScanStarted { mode: JoinMode::Rejoin }
        );
    }

    #[test]
    fn test_corrupt_record_is_cold_start() {
        let flash = bound_flash();
        flash.inject_corruption(3);
        let mut fx = fixture(flash);
        fx.node.boot(Instant::now()).unwrap();

        assert!(!fx.node.store().is_bound());
        assert_eq!(
            fx.indications.try_recv().unwrap(),
            Indication::ScanStarted { mode: JoinMode::Join }
        );
    }

    #[test]
    fn test_query_status() {
        let mut fx = fixture(MemoryFlash::new());
        assert_eq!(fx.node.on_command(Command::QueryStatus, Instant::now()), None);
        assert_eq!(
            fx.indications.try_recv().unwrap(),
            Indication::Status { connected: false }
        );
    }

    #[test]
    fn test_factory_reset() {
        let mut fx = fixture(bound_flash());
        fx.node.boot(Instant::now()).unwrap();

        let exit = fx.node.on_command(Command::FactoryReset, Instant::now());
        assert_eq!(exit, Some(Exit::Shutdown));
        assert!(!fx.node.store().is_bound());
        assert!(fx.node.next_deadline().is_none());
        assert_eq!(fx.handle.listening(), None);
    }

    #[test]
    fn test_factory_reset_erase_failure_restarts() {
        let mut fx = fixture(bound_flash());
        fx.flash.set_fail_erase(true);

        let exit = fx.node.on_command(Command::FactoryReset, Instant::now());
        assert_eq!(exit, Some(Exit::Restart));
        assert_eq!(
            fx.indications.try_recv().unwrap(),
            Indication::RestartRequired
        );
    }

    #[test]
    fn test_remote_frame_reaches_downlink() {
        struct Recorder(std::sync::Arc<std::sync::Mutex<Vec<Vec<u8>>>>);
        impl DownlinkHandler for Recorder {
            fn handle_remote(&mut self, payload: &[u8]) {
                self.0.lock().unwrap().push(payload.to_vec());
            }
        }

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let fx = fixture(MemoryFlash::new());
        let mut node = fx.node.with_downlink(Recorder(seen.clone()));

        fx.handle.deliver(ShortAddress(1), vec![0x04, 0x10, 0x20]);
        let mut events = fx.events;
        let event = events.try_recv().unwrap();
        assert_eq!(node.on_event(event, Instant::now()), None);
        assert_eq!(*seen.lock().unwrap(), vec![vec![0x10, 0x20]]);
    }

    #[test]
    fn test_sampler_uses_configured_retention() {
        let (link, handle, _events) = SimLink::new();
        handle.set_network_time(500_000);
        let config = NodeConfig {
            measurement_retention: 2,
            ..NodeConfig::default()
        };
        let (node, _indications) = SmartCell::new(
            config,
            link,
            Box::new(MemoryFlash::new()),
            Box::new(FixedHardwareId(HW_ID)),
        )
        .unwrap();
        let mut n = 0u8;
        let mut node = node.with_sampler(move || {
            n += 1;
            Some(Bytes::from(vec![n]))
        });

        for _ in 0..3 {
            assert!(node.source.perform_measurement());
        }
        let record = node.source.get_measurement().unwrap();
        assert_eq!(&record.value[..], &[2]);
        assert_eq!(record.timestamp, 500_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_on_shutdown_command() {
        let fx = fixture(MemoryFlash::new());
        let mut node = fx.node;
        let (tx, rx) = mpsc::channel(4);
        tx.send(Command::Shutdown).await.unwrap();

        let exit = node.run(fx.events, rx).await.unwrap();
        assert_eq!(exit, Exit::Shutdown);
    }
}
