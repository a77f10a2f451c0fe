//! The reconciliation engine.
//!
//! [`HealthManager`] owns the registry, the harmonizer and the scheduler and
//! runs every handler to completion on one task. Bus messages and fetch
//! results arrive through an input channel; scheduler tasks arrive through
//! the scheduler's own channel (real time) or are pulled when the virtual
//! clock is advanced.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};
use vigil_scheduler::{Scheduler, TokioScheduler, VirtualScheduler};
use vigil_state::{DropletRegistry, DropletSummary};
use vigil_types::{
    decode, decode_heartbeat, AdvanceTime, AnomalyEvent, DesiredState, DropletId, ExitMessage,
    Timestamp, UpdateMessage, ValidationError,
};

use crate::bus::{BusMessage, MessageBus};
use crate::config::{ManagerConfig, ShadowMode};
use crate::error::{ControlError, ControlResult, ProviderError, ProviderResult};
use crate::harmonizer::{Followup, Harmonizer, PolicyTable, Task};
use crate::nudger::NudgerStats;
use crate::provider::DesiredStateProvider;
use crate::reporter::Reporter;

/// Something for the engine to handle.
#[derive(Debug)]
pub enum Input {
    /// A message received on one of the inbound subjects.
    Message(BusMessage),
    /// Result of a desired-state fetch.
    Refreshed(ProviderResult<Vec<(DropletId, DesiredState)>>),
}

/// Read-only view of the engine for external consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub now: Timestamp,
    pub droplets: usize,
    pub queue_depth: usize,
    pub desired_state_available: bool,
    pub last_refresh: Timestamp,
    pub refresh_in_flight: bool,
    pub skipped_analysis_passes: u64,
    pub completed_analysis_passes: u64,
    pub shadow_mode: ShadowMode,
    pub commands: NudgerStats,
}

type BoxedScheduler = Box<dyn Scheduler<Task> + Send>;

/// Single-task health reconciliation engine.
pub struct HealthManager {
    config: Arc<ManagerConfig>,
    registry: DropletRegistry,
    harmonizer: Harmonizer,
    reporter: Reporter,
    scheduler: BoxedScheduler,
    tasks: Option<mpsc::UnboundedReceiver<Task>>,
    bus: Arc<dyn MessageBus>,
    provider: Arc<dyn DesiredStateProvider>,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: Option<mpsc::UnboundedReceiver<Input>>,
    refresh: Option<JoinHandle<()>>,
    forwarders: Vec<JoinHandle<()>>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    prepared: bool,
}

impl HealthManager {
    /// Engine on the wall clock.
    pub fn realtime(
        config: ManagerConfig,
        bus: Arc<dyn MessageBus>,
        provider: Arc<dyn DesiredStateProvider>,
    ) -> Self {
        let (scheduler, tasks) = TokioScheduler::channel();
        Self::build(config, bus, provider, Box::new(scheduler), Some(tasks))
    }

    /// Engine on a virtual clock starting at `start`; time moves only through
    /// [`HealthManager::advance_time`].
    pub fn virtual_time(
        config: ManagerConfig,
        bus: Arc<dyn MessageBus>,
        provider: Arc<dyn DesiredStateProvider>,
        start: Timestamp,
    ) -> Self {
        let scheduler = VirtualScheduler::starting_at(start);
        Self::build(config, bus, provider, Box::new(scheduler), None)
    }

    fn build(
        config: ManagerConfig,
        bus: Arc<dyn MessageBus>,
        provider: Arc<dyn DesiredStateProvider>,
        scheduler: BoxedScheduler,
        tasks: Option<mpsc::UnboundedReceiver<Task>>,
    ) -> Self {
        let config = Arc::new(config);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(EngineSnapshot::default());

        Self {
            registry: DropletRegistry::new(config.state.clone()),
            harmonizer: Harmonizer::new(Arc::clone(&config), Arc::clone(&bus)),
            reporter: Reporter::new(),
            config,
            scheduler,
            tasks,
            bus,
            provider,
            inputs_tx,
            inputs_rx: Some(inputs_rx),
            refresh: None,
            forwarders: Vec::new(),
            snapshot_tx,
            prepared: false,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.scheduler.now()
    }

    pub fn registry(&self) -> &DropletRegistry {
        &self.registry
    }

    pub fn harmonizer(&self) -> &Harmonizer {
        &self.harmonizer
    }

    pub fn set_policy(&mut self, policy: PolicyTable) {
        self.harmonizer.set_policy(policy);
    }

    /// Sender for injecting inputs from outside the engine task.
    pub fn sender(&self) -> mpsc::UnboundedSender<Input> {
        self.inputs_tx.clone()
    }

    /// Receiver of engine snapshots, updated after every task.
    pub fn snapshots(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let now = self.now();
        EngineSnapshot {
            now,
            droplets: self.registry.len(),
            queue_depth: self.harmonizer.nudger().queue_len(),
            desired_state_available: self.harmonizer.is_desired_state_available(now),
            last_refresh: self.harmonizer.availability().last_success(),
            refresh_in_flight: self.harmonizer.refresh_gate().is_in_flight(),
            skipped_analysis_passes: self.harmonizer.skipped_analysis_passes(),
            completed_analysis_passes: self.harmonizer.completed_analysis_passes(),
            shadow_mode: self.harmonizer.nudger().mode(),
            commands: self.harmonizer.nudger().stats().clone(),
        }
    }

    pub fn summaries(&self) -> Vec<DropletSummary> {
        self.registry.summaries()
    }

    /// Register periodic work. Idempotent.
    pub fn prepare(&mut self) -> ControlResult<()> {
        if self.prepared {
            return Ok(());
        }
        self.harmonizer.prepare(self.scheduler.as_mut())?;
        self.prepared = true;
        Ok(())
    }

    /// Subscribe to every inbound subject and forward messages into the engine.
    pub fn attach_bus(&mut self) -> ControlResult<()> {
        for topic in self.config.topics.inbound() {
            let rx = self.bus.subscribe(topic)?;
            let tx = self.inputs_tx.clone();
            let topic = topic.to_string();
            self.forwarders
                .push(tokio::spawn(forward_messages(rx, tx, topic)));
        }
        info!(topics = self.forwarders.len(), "Attached to bus");
        Ok(())
    }

    /// Run until `shutdown` resolves.
    pub async fn run<F>(mut self, shutdown: F) -> ControlResult<()>
    where
        F: Future<Output = ()>,
    {
        self.prepare()?;
        let mut inputs = self.inputs_rx.take().ok_or(ControlError::AlreadyStarted)?;
        let mut tasks = self.tasks.take();
        tokio::pin!(shutdown);

        info!(virtual_time = tasks.is_none(), "Health manager running");
        loop {
            while let Some(task) = self.ready_task() {
                self.run_task(task);
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                Some(input) = inputs.recv() => self.handle_input(input),
                Some(task) = next_task(&mut tasks) => self.run_task(task),
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Handle everything that is ready right now without waiting.
    ///
    /// On the virtual clock this includes tasks due at the current time.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Some(input) = self.inputs_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
                self.handle_input(input);
                handled += 1;
                continue;
            }
            if let Some(task) = self.ready_task() {
                self.run_task(task);
                handled += 1;
                continue;
            }
            return handled;
        }
    }

    fn ready_task(&mut self) -> Option<Task> {
        if let Some(rx) = self.tasks.as_mut() {
            return rx.try_recv().ok();
        }
        let now = self.scheduler.now();
        self.scheduler.as_virtual().and_then(|v| v.next_due(now))
    }

    /// Move the virtual clock forward, running every task that falls due.
    #[instrument(skip(self))]
    pub fn advance_time(&mut self, by: Duration) -> ControlResult<usize> {
        let Some(until) = self.scheduler.as_virtual().map(|v| v.deadline(by)) else {
            warn!("Advance-time ignored on the real-time scheduler");
            return Ok(0);
        };

        let mut ran = 0;
        while let Some(task) = self.scheduler.as_virtual().and_then(|v| v.next_due(until)) {
            self.run_task(task);
            ran += 1;
        }
        if let Some(virtual_clock) = self.scheduler.as_virtual() {
            virtual_clock.settle(until)?;
        }
        self.publish_snapshot();
        Ok(ran)
    }

    /// Wait for the in-flight desired-state fetch, if any, and apply it.
    pub async fn join_refresh(&mut self) -> bool {
        let Some(handle) = self.refresh.take() else {
            return false;
        };
        if let Err(err) = handle.await {
            warn!(error = %err, "Desired state fetch task failed");
        }
        self.pump();
        true
    }

    pub fn handle_input(&mut self, input: Input) {
        match input {
            Input::Message(message) => self.handle_message(message),
            Input::Refreshed(outcome) => {
                let now = self.now();
                self.refresh = None;
                self.harmonizer
                    .apply_refresh(outcome, &mut self.registry, now);
                self.publish_snapshot();
            }
        }
    }

    /// Dispatch one bus message by subject. Bad messages are logged and dropped.
    pub fn handle_message(&mut self, message: BusMessage) {
        let config = Arc::clone(&self.config);
        let topics = &config.topics;
        let result = if message.topic == topics.heartbeat {
            self.on_heartbeat(&message)
        } else if message.topic == topics.exited {
            self.on_exit(&message)
        } else if message.topic == topics.updated {
            self.on_update(&message)
        } else if message.topic == topics.advance_time {
            self.on_advance_time(&message)
        } else if message.topic == topics.status {
            self.on_status(&message)
        } else if message.topic == topics.health {
            self.on_health(&message)
        } else {
            debug!(topic = %message.topic, "No handler for subject");
            Ok(())
        };

        if let Err(err) = result {
            warn!(topic = %message.topic, error = %err, "Dropping message");
        }
    }

    fn on_heartbeat(&mut self, message: &BusMessage) -> ControlResult<()> {
        let decoded = decode_heartbeat(&message.payload)?;
        let heartbeat = decoded.heartbeat;
        for (position, err) in &decoded.rejected {
            warn!(executor = %heartbeat.executor_id, position, error = %err, "Dropping malformed heartbeat entry");
        }
        let now = self.now();
        let count = self.registry.process_heartbeat(&heartbeat, now);
        trace!(executor = %heartbeat.executor_id, instances = count, "Heartbeat processed");
        Ok(())
    }

    fn on_exit(&mut self, message: &BusMessage) -> ControlResult<()> {
        let exit: ExitMessage = decode(&message.payload)?;
        let now = self.now();
        debug!(droplet = %exit.droplet_id, index = exit.index, reason = ?exit.reason, "Exit received");
        let events = self.registry.process_exit(&exit, now);
        self.dispatch(events);
        Ok(())
    }

    fn on_update(&mut self, message: &BusMessage) -> ControlResult<()> {
        let update: UpdateMessage = decode(&message.payload)?;
        let now = self.now();
        debug!(droplet = %update.droplet_id, "Droplet updated");
        let events = self.registry.process_update(&update, now);
        self.dispatch(events);
        Ok(())
    }

    fn on_advance_time(&mut self, message: &BusMessage) -> ControlResult<()> {
        let advance: AdvanceTime = decode(&message.payload)?;
        let by = Duration::try_from_secs_f64(advance.seconds).map_err(|err| {
            ValidationError::InvalidValue {
                field: "seconds",
                reason: err.to_string(),
            }
        })?;
        self.advance_time(by)?;
        Ok(())
    }

    fn on_status(&mut self, message: &BusMessage) -> ControlResult<()> {
        if let Some(reply) = self.reporter.reply_status(message, &self.registry)? {
            self.bus.publish(reply)?;
        }
        Ok(())
    }

    fn on_health(&mut self, message: &BusMessage) -> ControlResult<()> {
        let now = self.now();
        if let Some(reply) = self.reporter.reply_health(message, &self.registry, now)? {
            self.bus.publish(reply)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, events: Vec<AnomalyEvent>) {
        for event in events {
            let followup =
                self.harmonizer
                    .handle_event(event, &mut self.registry, self.scheduler.as_mut());
            self.follow(followup);
        }
    }

    fn run_task(&mut self, task: Task) {
        trace!(task = ?task, "Running task");
        let followup = self
            .harmonizer
            .run_task(task, &mut self.registry, self.scheduler.as_mut());
        self.follow(followup);
        self.publish_snapshot();
    }

    fn follow(&mut self, followup: Followup) {
        if followup == Followup::FetchDesiredState {
            self.spawn_refresh();
        }
    }

    fn spawn_refresh(&mut self) {
        let provider = Arc::clone(&self.provider);
        let tx = self.inputs_tx.clone();
        debug!("Fetching desired state");

        self.refresh = Some(tokio::spawn(async move {
            let mut report = RefreshReport { tx: Some(tx) };
            let mut fetched: Vec<(DropletId, DesiredState)> = Vec::new();
            let mut collect = |id: DropletId, desired: DesiredState| fetched.push((id, desired));
            let result = provider.each_droplet(&mut collect).await;
            report.send(result.map(|_| fetched));
        }));
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn shutdown(&mut self) {
        self.harmonizer.shutdown(self.scheduler.as_mut());
        for handle in self.forwarders.drain(..) {
            handle.abort();
        }
        if let Some(handle) = self.refresh.take() {
            handle.abort();
        }
        info!("Health manager stopped");
    }
}

/// Delivers the outcome of a desired-state fetch exactly once.
///
/// If the fetch task unwinds or is aborted first, the engine still hears
/// about it as [`ProviderError::Interrupted`] so the refresh gate reopens.
struct RefreshReport {
    tx: Option<mpsc::UnboundedSender<Input>>,
}

impl RefreshReport {
    fn send(&mut self, outcome: ProviderResult<Vec<(DropletId, DesiredState)>>) {
        if let Some(tx) = self.tx.take() {
            if tx.send(Input::Refreshed(outcome)).is_err() {
                debug!("Engine gone before desired state arrived");
            }
        }
    }
}

impl Drop for RefreshReport {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("Desired state fetch ended without a result");
            self.send(Err(ProviderError::Interrupted));
        }
    }
}

async fn next_task(tasks: &mut Option<mpsc::UnboundedReceiver<Task>>) -> Option<Task> {
    match tasks {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Copy messages from a bus subscription into the engine's input channel.
async fn forward_messages(
    mut rx: broadcast::Receiver<BusMessage>,
    tx: mpsc::UnboundedSender<Input>,
    topic: String,
) {
    loop {
        match rx.recv().await {
            Ok(message) => {
                if tx.send(Input::Message(message)).is_err() {
                    debug!(topic = %topic, "Engine gone, stopping forwarder");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(topic = %topic, lagged = n, "Forwarder lagged behind bus");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!(topic = %topic, "Subscription closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::provider::InMemoryDesiredStateProvider;
    use vigil_types::{AppState, PackageState};

    fn manager() -> (HealthManager, Arc<InMemoryBus>, Arc<InMemoryDesiredStateProvider>) {
        let bus = Arc::new(InMemoryBus::new());
        let provider = Arc::new(InMemoryDesiredStateProvider::new());
        let manager = HealthManager::virtual_time(
            ManagerConfig::default(),
            bus.clone(),
            provider.clone(),
            Timestamp::from_secs(1_000.0),
        );
        (manager, bus, provider)
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (mut manager, _bus, _provider) = manager();
        manager.handle_message(BusMessage::new("dea.heartbeat", b"garbage".to_vec()));
        manager.handle_message(BusMessage::new(
            "droplet.exited",
            br#"{"droplet": "", "version": "v1", "index": 0, "instance": "g", "reason": "CRASHED"}"#.to_vec(),
        ));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_bad_heartbeat_entry_does_not_hide_good_ones() {
        let (mut manager, _bus, _provider) = manager();
        manager.handle_message(BusMessage::new(
            "dea.heartbeat",
            br#"{"dea": "dea-1", "droplets": [
                {"droplet": "app", "version": "v1", "index": 0, "instance": "", "state": "RUNNING"},
                {"droplet": "app", "version": "v1", "index": 1, "instance": "g1", "state": "RUNNING"}
            ]}"#
            .to_vec(),
        ));

        let droplet = manager.registry().get(&DropletId::new("app")).unwrap();
        assert!(droplet.instance("v1", 0).is_none());
        let instance = droplet.instance("v1", 1).unwrap();
        assert_eq!(instance.guid().map(|g| g.as_str()), Some("g1"));
        assert_eq!(instance.last_heartbeat_time(), Timestamp::from_secs(1_000.0));
    }

    #[tokio::test]
    async fn test_advance_time_message_moves_clock() {
        let (mut manager, _bus, _provider) = manager();
        manager.handle_message(BusMessage::new(
            "healthmanager.advance_time",
            br#"{"seconds": 12.5}"#.to_vec(),
        ));
        assert_eq!(manager.now(), Timestamp::from_secs(1_012.5));

        manager.handle_message(BusMessage::new(
            "healthmanager.advance_time",
            br#"{"seconds": -1}"#.to_vec(),
        ));
        assert_eq!(manager.now(), Timestamp::from_secs(1_012.5));
    }

    #[tokio::test]
    async fn test_initial_refresh_populates_registry() {
        let (mut manager, _bus, provider) = manager();
        provider
            .set(
                DropletId::new("app"),
                DesiredState {
                    num_instances: 2,
                    state: AppState::Started,
                    live_version: "v1".to_string(),
                    package_state: PackageState::Staged,
                    last_updated: Timestamp::from_secs(1.0),
                },
            )
            .await;

        manager.prepare().unwrap();
        manager.pump();
        assert!(manager.snapshot().refresh_in_flight);

        assert!(manager.join_refresh().await);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.droplets, 1);
        assert!(snapshot.desired_state_available);
        assert!(!snapshot.refresh_in_flight);
        assert_eq!(*manager.snapshots().borrow(), snapshot);
    }

    struct PanickingProvider;

    #[async_trait::async_trait]
    impl DesiredStateProvider for PanickingProvider {
        async fn each_droplet(
            &self,
            _sink: &mut crate::provider::DropletSink<'_>,
        ) -> ProviderResult<usize> {
            panic!("provider blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_fetch_reopens_refresh_gate() {
        let mut manager = HealthManager::virtual_time(
            ManagerConfig::default(),
            Arc::new(InMemoryBus::new()),
            Arc::new(PanickingProvider),
            Timestamp::from_secs(1_000.0),
        );

        manager.prepare().unwrap();
        manager.pump();
        assert!(manager.snapshot().refresh_in_flight);

        assert!(manager.join_refresh().await);
        let snapshot = manager.snapshot();
        assert!(!snapshot.refresh_in_flight);
        assert!(!snapshot.desired_state_available);
        assert_eq!(
            manager.harmonizer().availability().last_error(),
            Some("Fetch interrupted")
        );

        // the next scheduled refresh starts a fresh fetch instead of postponing
        let postponed = manager.harmonizer().refresh_gate().postponements();
        manager.advance_time(Duration::from_secs(60)).unwrap();
        assert!(manager.snapshot().refresh_in_flight);
        assert_eq!(manager.harmonizer().refresh_gate().postponements(), postponed);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (manager, _bus, _provider) = manager();
        manager.run(async {}).await.unwrap();
    }
}
