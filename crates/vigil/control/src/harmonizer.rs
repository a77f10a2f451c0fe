//! Policy engine: binds droplet anomalies to corrective actions and drives
//! the time-based reconciliation work.
//!
//! The harmonizer never sleeps and never performs I/O of its own beyond the
//! nudger's publish step. Anything asynchronous (the desired-state fetch) is
//! handed back to the caller as a [`Followup`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};
use vigil_scheduler::{Receipt, Scheduler};
use vigil_state::DropletRegistry;
use vigil_types::{AnomalyEvent, AnomalyKind, DesiredState, DropletId, Priority, Timestamp};

use crate::bus::MessageBus;
use crate::config::ManagerConfig;
use crate::error::{ControlResult, ProviderResult};
use crate::nudger::Nudger;

/// Name of the analysis pass in the scheduler's running-task guard.
pub const ANALYSIS_TASK: &str = "droplets_analysis";

/// Work the scheduler hands back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    DrainNudger,
    RefreshDesiredState,
    PostponedRefresh,
    Analyze,
    AnalyzeChunk,
    GarbageCollect,
}

/// What to do when an anomaly of a given kind is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    /// Queue a START for the indices named by the event.
    Start(Priority),
    /// Like [`PolicyAction::Start`], but not for flapping instances.
    StartUnlessFlapping(Priority),
    /// Queue one STOP per instance named by the event.
    Stop(Priority),
    /// Publish a STOP for the instances named by the event, bypassing the queue.
    StopImmediately,
    /// Fetch desired state out of band.
    RefreshDesiredState,
    Ignore,
}

/// Anomaly → action bindings owned by one harmonizer.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    bindings: BTreeMap<AnomalyKind, PolicyAction>,
}

impl PolicyTable {
    /// A table that ignores everything.
    pub fn empty() -> Self {
        Self {
            bindings: BTreeMap::new(),
        }
    }

    /// The production bindings.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        table.bind(AnomalyKind::MissingInstances, PolicyAction::Start(Priority::Normal));
        table.bind(AnomalyKind::ExtraInstances, PolicyAction::StopImmediately);
        table.bind(AnomalyKind::ExitDea, PolicyAction::Start(Priority::High));
        table.bind(
            AnomalyKind::ExitCrashed,
            PolicyAction::StartUnlessFlapping(Priority::Low),
        );
        table.bind(AnomalyKind::DropletUpdated, PolicyAction::RefreshDesiredState);
        table
    }

    /// Bind `kind` to `action`, returning the previous binding.
    pub fn bind(&mut self, kind: AnomalyKind, action: PolicyAction) -> Option<PolicyAction> {
        self.bindings.insert(kind, action)
    }

    pub fn action_for(&self, kind: AnomalyKind) -> PolicyAction {
        self.bindings
            .get(&kind)
            .copied()
            .unwrap_or(PolicyAction::Ignore)
    }

    pub fn iter(&self) -> impl Iterator<Item = (AnomalyKind, PolicyAction)> + '_ {
        self.bindings.iter().map(|(k, a)| (*k, *a))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Asynchronous work the caller must start on the harmonizer's behalf.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Followup {
    Nothing,
    FetchDesiredState,
}

impl Followup {
    pub fn merge(self, other: Followup) -> Followup {
        match (self, other) {
            (Followup::Nothing, Followup::Nothing) => Followup::Nothing,
            _ => Followup::FetchDesiredState,
        }
    }
}

/// Keeps desired-state refreshes from overlapping.
///
/// At most one fetch is in flight. A request arriving meanwhile schedules a
/// single postponed retry; further requests are folded into it.
#[derive(Debug, Default)]
pub struct RefreshGate {
    in_flight: bool,
    started_at: Timestamp,
    postponed: Option<Receipt>,
    postponements: u64,
}

impl RefreshGate {
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn postponed(&self) -> Option<Receipt> {
        self.postponed
    }

    /// Postponed retries scheduled so far.
    pub fn postponements(&self) -> u64 {
        self.postponements
    }

    fn request(
        &mut self,
        scheduler: &mut dyn Scheduler<Task>,
        postpone: std::time::Duration,
    ) -> Followup {
        if !self.in_flight {
            self.in_flight = true;
            self.started_at = scheduler.now();
            return Followup::FetchDesiredState;
        }

        if self.postponed.is_none() {
            self.postponed = Some(scheduler.after(postpone, Task::PostponedRefresh));
            self.postponements += 1;
            debug!(delay = ?postpone, "Refresh in flight, postponing");
        }
        Followup::Nothing
    }

    fn postponed_fired(&mut self) {
        self.postponed = None;
    }

    fn finish(&mut self) -> Timestamp {
        self.in_flight = false;
        self.started_at
    }
}

/// Whether desired state can currently be trusted.
#[derive(Debug, Default, Clone)]
pub struct Availability {
    last_success: Timestamp,
    last_error: Option<String>,
}

impl Availability {
    pub fn last_success(&self) -> Timestamp {
        self.last_success
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn is_available(&self, now: Timestamp, lost: std::time::Duration) -> bool {
        self.last_error.is_none()
            && self.last_success.is_set()
            && !self.last_success.is_older_than(lost, now)
    }
}

/// The policy engine.
pub struct Harmonizer {
    config: Arc<ManagerConfig>,
    policy: PolicyTable,
    nudger: Nudger,
    refresh: RefreshGate,
    availability: Availability,
    analysis_queue: VecDeque<DropletId>,
    skipped_analysis: u64,
    completed_analysis: u64,
    receipts: Vec<Receipt>,
}

impl Harmonizer {
    pub fn new(config: Arc<ManagerConfig>, bus: Arc<dyn MessageBus>) -> Self {
        let nudger = Nudger::new(bus, &config);
        Self {
            config,
            policy: PolicyTable::standard(),
            nudger,
            refresh: RefreshGate::default(),
            availability: Availability::default(),
            analysis_queue: VecDeque::new(),
            skipped_analysis: 0,
            completed_analysis: 0,
            receipts: Vec::new(),
        }
    }

    /// Replace the anomaly bindings.
    pub fn set_policy(&mut self, policy: PolicyTable) {
        self.policy = policy;
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    pub fn nudger(&self) -> &Nudger {
        &self.nudger
    }

    pub fn nudger_mut(&mut self) -> &mut Nudger {
        &mut self.nudger
    }

    pub fn refresh_gate(&self) -> &RefreshGate {
        &self.refresh
    }

    pub fn availability(&self) -> &Availability {
        &self.availability
    }

    pub fn is_desired_state_available(&self, now: Timestamp) -> bool {
        self.availability
            .is_available(now, self.config.intervals.desired_state_lost())
    }

    pub fn skipped_analysis_passes(&self) -> u64 {
        self.skipped_analysis
    }

    pub fn completed_analysis_passes(&self) -> u64 {
        self.completed_analysis
    }

    /// Register the periodic work. The first refresh runs on the next tick.
    pub fn prepare(&mut self, scheduler: &mut dyn Scheduler<Task>) -> ControlResult<()> {
        let intervals = &self.config.intervals;
        let analysis_delay = self.config.state.droplet_lost();

        self.receipts
            .push(scheduler.every(intervals.request_queue(), Task::DrainNudger)?);
        self.receipts
            .push(scheduler.immediately(Task::RefreshDesiredState));
        self.receipts.push(scheduler.every(
            intervals.desired_state_update(),
            Task::RefreshDesiredState,
        )?);
        self.receipts.push(scheduler.every_after(
            analysis_delay,
            intervals.droplets_analysis(),
            Task::Analyze,
        )?);
        self.receipts
            .push(scheduler.every(intervals.gc(), Task::GarbageCollect)?);

        info!(
            analysis_delay = ?analysis_delay,
            drain_every = ?intervals.request_queue(),
            "Harmonizer prepared"
        );
        Ok(())
    }

    /// Cancel everything registered by [`Harmonizer::prepare`].
    pub fn shutdown(&mut self, scheduler: &mut dyn Scheduler<Task>) {
        for receipt in self.receipts.drain(..) {
            scheduler.cancel(receipt);
        }
        if let Some(receipt) = self.refresh.postponed.take() {
            scheduler.cancel(receipt);
        }
    }

    /// Run a task handed back by the scheduler.
    pub fn run_task(
        &mut self,
        task: Task,
        registry: &mut DropletRegistry,
        scheduler: &mut dyn Scheduler<Task>,
    ) -> Followup {
        match task {
            Task::DrainNudger => {
                self.nudger.deque_batch_of_requests();
                Followup::Nothing
            }
            Task::RefreshDesiredState => self.request_refresh(scheduler),
            Task::PostponedRefresh => {
                self.refresh.postponed_fired();
                self.request_refresh(scheduler)
            }
            Task::Analyze => {
                self.begin_analysis(registry, scheduler);
                Followup::Nothing
            }
            Task::AnalyzeChunk => self.analyze_chunk(registry, scheduler),
            Task::GarbageCollect => {
                self.collect_garbage(registry, scheduler.now());
                Followup::Nothing
            }
        }
    }

    /// Ask for a desired-state refresh, respecting the single-flight rule.
    pub fn request_refresh(&mut self, scheduler: &mut dyn Scheduler<Task>) -> Followup {
        let postpone = self.config.intervals.postpone();
        self.refresh.request(scheduler, postpone)
    }

    /// Apply the outcome of a fetch started for a [`Followup::FetchDesiredState`].
    #[instrument(skip_all)]
    pub fn apply_refresh(
        &mut self,
        outcome: ProviderResult<Vec<(DropletId, DesiredState)>>,
        registry: &mut DropletRegistry,
        now: Timestamp,
    ) {
        let started = self.refresh.finish();

        match outcome {
            Ok(droplets) => {
                let count = droplets.len();
                let mut confirmed = HashSet::with_capacity(count);
                for (id, desired) in droplets {
                    registry.update_desired(&id, desired, now);
                    confirmed.insert(id);
                }
                let stale = registry.mark_unconfirmed(&confirmed);

                self.availability.last_success = now;
                self.availability.last_error = None;
                info!(
                    droplets = count,
                    unconfirmed = stale,
                    took_secs = now.seconds_since(started),
                    "Desired state refreshed"
                );
            }
            Err(err) => {
                error!(error = %err, "Desired state refresh failed");
                self.availability.last_error = Some(err.to_string());
            }
        }
    }

    /// React to one anomaly according to the policy table.
    pub fn handle_event(
        &mut self,
        event: AnomalyEvent,
        registry: &mut DropletRegistry,
        scheduler: &mut dyn Scheduler<Task>,
    ) -> Followup {
        let droplet_id = event.droplet_id().clone();
        match self.apply_policy(event, registry, scheduler) {
            Ok(followup) => followup,
            Err(err) => {
                error!(droplet = %droplet_id, error = %err, "Corrective action failed");
                Followup::Nothing
            }
        }
    }

    fn apply_policy(
        &mut self,
        event: AnomalyEvent,
        registry: &mut DropletRegistry,
        scheduler: &mut dyn Scheduler<Task>,
    ) -> ControlResult<Followup> {
        let now = scheduler.now();
        let action = self.policy.action_for(event.kind());

        match action {
            PolicyAction::Ignore => Ok(Followup::Nothing),
            PolicyAction::RefreshDesiredState => Ok(self.request_refresh(scheduler)),
            PolicyAction::Start(priority) => {
                self.start(&event, false, priority, registry, now)?;
                Ok(Followup::Nothing)
            }
            PolicyAction::StartUnlessFlapping(priority) => {
                self.start(&event, true, priority, registry, now)?;
                Ok(Followup::Nothing)
            }
            PolicyAction::Stop(priority) => {
                self.stop(&event, Some(priority), registry, now)?;
                Ok(Followup::Nothing)
            }
            PolicyAction::StopImmediately => {
                self.stop(&event, None, registry, now)?;
                Ok(Followup::Nothing)
            }
        }
    }

    fn start(
        &mut self,
        event: &AnomalyEvent,
        skip_flapping: bool,
        priority: Priority,
        registry: &mut DropletRegistry,
        now: Timestamp,
    ) -> ControlResult<()> {
        let (version, indices) = match event {
            AnomalyEvent::MissingInstances { indices, .. } => (None, indices.clone()),
            AnomalyEvent::ExitDea { version, index, .. } => (Some(version.as_str()), vec![*index]),
            AnomalyEvent::ExitCrashed { message, .. } => {
                (Some(message.version.as_str()), vec![message.index])
            }
            AnomalyEvent::ExtraInstances { .. } | AnomalyEvent::DropletUpdated { .. } => {
                return Ok(());
            }
        };

        let droplet_id = event.droplet_id();
        let Some(droplet) = registry.get_mut(droplet_id) else {
            debug!(droplet = %droplet_id, "Start requested for unknown droplet");
            return Ok(());
        };
        let desired = droplet.require_desired()?.clone();

        if !desired.wants_instances() {
            debug!(droplet = %droplet_id, "Droplet does not want instances, not starting");
            return Ok(());
        }
        if version.is_some_and(|v| v != desired.live_version) {
            debug!(droplet = %droplet_id, version = ?version, "Exit of non-live version, not restarting");
            return Ok(());
        }

        let live = desired.live_version.as_str();
        let indices: Vec<u32> = indices
            .into_iter()
            .filter(|index| *index < desired.num_instances)
            .filter(|index| {
                let flapping = droplet
                    .instance(live, *index)
                    .is_some_and(|i| i.is_flapping());
                if skip_flapping && flapping {
                    info!(droplet = %droplet_id, index, "Instance is flapping, not restarting");
                }
                !(skip_flapping && flapping)
            })
            .collect();
        if indices.is_empty() {
            return Ok(());
        }

        self.nudger
            .start_missing_instances(droplet_id, &desired, &indices, priority);
        for index in &indices {
            droplet.add_pending_restart(*index, now);
        }
        Ok(())
    }

    /// Stop extra instances, queued at `priority` or published right away.
    fn stop(
        &mut self,
        event: &AnomalyEvent,
        priority: Option<Priority>,
        registry: &mut DropletRegistry,
        now: Timestamp,
    ) -> ControlResult<()> {
        let AnomalyEvent::ExtraInstances {
            droplet_id,
            instances,
        } = event
        else {
            return Ok(());
        };

        if !self.is_desired_state_available(now) {
            warn!(
                droplet = %droplet_id,
                count = instances.len(),
                "Desired state unavailable, not stopping extra instances"
            );
            return Ok(());
        }

        let last_updated = registry
            .get(droplet_id)
            .and_then(|d| d.desired())
            .map(|d| d.last_updated)
            .unwrap_or(Timestamp::NEVER);
        for (guid, reason) in instances {
            info!(droplet = %droplet_id, guid = %guid, reason = %reason, "Stopping extra instance");
        }
        match priority {
            Some(priority) => {
                for guid in instances.keys() {
                    self.nudger
                        .stop_instance(droplet_id, last_updated, guid.clone(), priority);
                }
            }
            None => self.nudger.stop_instances_immediately(
                droplet_id,
                last_updated,
                instances.keys().cloned().collect(),
            )?,
        }
        Ok(())
    }

    /// Start a paced pass over the whole registry unless one is still running.
    pub fn begin_analysis(
        &mut self,
        registry: &DropletRegistry,
        scheduler: &mut dyn Scheduler<Task>,
    ) -> bool {
        let now = scheduler.now();
        if !scheduler.running().try_begin(ANALYSIS_TASK, now) {
            self.skipped_analysis += 1;
            warn!(
                remaining = self.analysis_queue.len(),
                skipped = self.skipped_analysis,
                "Previous analysis still running, skipping pass"
            );
            return false;
        }

        self.analysis_queue = registry.ids().into();
        debug!(droplets = self.analysis_queue.len(), "Analysis pass started");
        scheduler.immediately(Task::AnalyzeChunk);
        true
    }

    /// Analyze the next batch of droplets of the current pass.
    pub fn analyze_chunk(
        &mut self,
        registry: &mut DropletRegistry,
        scheduler: &mut dyn Scheduler<Task>,
    ) -> Followup {
        let now = scheduler.now();
        let batch = self.config.analysis_batch_size.max(1);
        let mut followup = Followup::Nothing;

        for _ in 0..batch {
            let Some(id) = self.analysis_queue.pop_front() else {
                break;
            };
            let events = match registry.get_mut(&id) {
                Some(droplet) => droplet.analyze(now),
                None => continue,
            };
            for event in events {
                followup = followup.merge(self.handle_event(event, registry, scheduler));
            }
        }

        if self.analysis_queue.is_empty() {
            if let Some(started) = scheduler.running().finish(ANALYSIS_TASK) {
                self.completed_analysis += 1;
                debug!(took_secs = now.seconds_since(started), "Analysis pass finished");
            }
        } else {
            scheduler.immediately(Task::AnalyzeChunk);
        }
        followup
    }

    /// Remove droplets ripe for GC, unless desired state cannot be trusted.
    pub fn collect_garbage(&mut self, registry: &mut DropletRegistry, now: Timestamp) -> Vec<DropletId> {
        if !self.is_desired_state_available(now) {
            debug!("Desired state unavailable, skipping garbage collection");
            return Vec::new();
        }
        registry.sweep_garbage(now)
    }
}
