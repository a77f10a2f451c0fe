//! Droplet aggregate: every instance of one application across versions.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};
use vigil_types::{
    AnomalyEvent, DesiredState, DropletId, ExitMessage, ExtraReason, InstanceGuid,
    InstanceHeartbeat, Timestamp,
};

use crate::config::StateConfig;
use crate::error::{StateError, StateResult};
use crate::instance::{Instance, InstanceState};

/// Bookkeeping for one observed crash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrashRecord {
    pub detected_at: Timestamp,
    pub crash_timestamp: Timestamp,
}

/// A start command issued for an index and not yet confirmed by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestartReceipt {
    pub issued_at: Timestamp,
}

/// Point-in-time view of one instance, for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub version: String,
    pub index: u32,
    pub guid: Option<InstanceGuid>,
    pub state: InstanceState,
    pub crash_count: u32,
}

/// Point-in-time view of a droplet, for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct DropletSummary {
    pub droplet: DropletId,
    pub desired: Option<DesiredState>,
    pub instances: Vec<InstanceSummary>,
    pub pending_restarts: Vec<u32>,
    pub crashes: usize,
    pub desired_state_update_required: bool,
}

/// All instances of one application plus its desired state.
#[derive(Debug, Clone)]
pub struct Droplet {
    id: DropletId,
    config: Arc<StateConfig>,
    desired: Option<DesiredState>,
    versions: BTreeMap<String, BTreeMap<u32, Instance>>,
    crashes: HashMap<InstanceGuid, CrashRecord>,
    pending_restarts: BTreeMap<u32, RestartReceipt>,
    pending_extras: BTreeMap<InstanceGuid, ExtraReason>,
    extra_instances: BTreeMap<InstanceGuid, ExtraReason>,
    desired_state_update_required: bool,
    desired_state_update_timestamp: Timestamp,
    reset_at: Timestamp,
    created_at: Timestamp,
}

impl Droplet {
    pub fn new(id: DropletId, config: Arc<StateConfig>, now: Timestamp) -> Self {
        Self {
            id,
            config,
            desired: None,
            versions: BTreeMap::new(),
            crashes: HashMap::new(),
            pending_restarts: BTreeMap::new(),
            pending_extras: BTreeMap::new(),
            extra_instances: BTreeMap::new(),
            desired_state_update_required: false,
            desired_state_update_timestamp: now,
            reset_at: Timestamp::NEVER,
            created_at: now,
        }
    }

    pub fn id(&self) -> &DropletId {
        &self.id
    }

    pub fn desired(&self) -> Option<&DesiredState> {
        self.desired.as_ref()
    }

    /// Desired state, or an error when none has been fetched yet.
    pub fn require_desired(&self) -> StateResult<&DesiredState> {
        self.desired
            .as_ref()
            .ok_or_else(|| StateError::MissingDesiredState(self.id.clone()))
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn desired_state_update_required(&self) -> bool {
        self.desired_state_update_required
    }

    pub fn desired_state_update_timestamp(&self) -> Timestamp {
        self.desired_state_update_timestamp
    }

    pub fn instance(&self, version: &str, index: u32) -> Option<&Instance> {
        self.versions.get(version).and_then(|v| v.get(&index))
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    pub fn crash(&self, guid: &InstanceGuid) -> Option<&CrashRecord> {
        self.crashes.get(guid)
    }

    pub fn crash_count(&self) -> usize {
        self.crashes.len()
    }

    /// Guids stopped by the last [`Droplet::update_extra_instances`] call.
    pub fn extra_instances(&self) -> &BTreeMap<InstanceGuid, ExtraReason> {
        &self.extra_instances
    }

    /// Record a desired state confirmed by the provider at `now`.
    pub fn set_desired_state(&mut self, desired: DesiredState, now: Timestamp) {
        if self.desired.as_ref() != Some(&desired) {
            debug!(
                droplet = %self.id,
                instances = desired.num_instances,
                version = %desired.live_version,
                "Desired state changed"
            );
        }
        self.desired = Some(desired);
        self.desired_state_update_required = false;
        self.desired_state_update_timestamp = now;
    }

    /// The provider did not confirm this droplet in its last complete pass.
    pub fn mark_desired_state_stale(&mut self) {
        self.desired_state_update_required = true;
    }

    pub fn process_heartbeat(&mut self, beat: &InstanceHeartbeat, now: Timestamp) {
        let running = beat.state.is_running();
        if !running && self.instance(&beat.version, beat.index).is_none() {
            trace!(droplet = %self.id, index = beat.index, state = ?beat.state, "Ignoring heartbeat for untracked instance");
            return;
        }

        let config = Arc::clone(&self.config);
        let instance = self
            .versions
            .entry(beat.version.clone())
            .or_default()
            .entry(beat.index)
            .or_default();

        if running && instance.state() == InstanceState::Running && instance.is_alive(now, &config) {
            if let Some(resident) = instance.guid().cloned() {
                if resident != beat.instance_guid {
                    debug!(
                        droplet = %self.id,
                        index = beat.index,
                        resident = %resident,
                        incoming = %beat.instance_guid,
                        "Duplicate instance at index"
                    );
                    instance.forget_guid(&resident);
                    self.pending_extras.insert(resident, ExtraReason::ExtraInstance);
                }
            }
        }

        instance.receive_heartbeat(beat, now);

        if running
            && self.is_live_version(&beat.version)
            && self.pending_restarts.remove(&beat.index).is_some()
        {
            trace!(droplet = %self.id, index = beat.index, "Restart confirmed");
        }
    }

    /// Apply a crash exit. Returns whether the instance is now flapping.
    pub fn process_exit_crash(&mut self, message: &ExitMessage, now: Timestamp) -> bool {
        let crash_timestamp = message.crash_timestamp.unwrap_or(now);
        let config = Arc::clone(&self.config);
        let instance = self
            .versions
            .entry(message.version.clone())
            .or_default()
            .entry(message.index)
            .or_default();

        instance.crash(&message.instance_guid, crash_timestamp, &config);
        let flapping = instance.is_flapping();

        self.crashes.insert(
            message.instance_guid.clone(),
            CrashRecord {
                detected_at: now,
                crash_timestamp,
            },
        );
        self.pending_restarts.remove(&message.index);

        debug!(
            droplet = %self.id,
            index = message.index,
            crash_count = instance.crash_count(),
            flapping,
            "Instance crashed"
        );
        flapping
    }

    /// Mark an instance DOWN if `guid` is still the resident one.
    pub fn mark_instance_as_down(
        &mut self,
        version: &str,
        index: u32,
        guid: &InstanceGuid,
    ) -> StateResult<()> {
        let instance = self
            .versions
            .get_mut(version)
            .and_then(|v| v.get_mut(&index))
            .ok_or_else(|| StateError::InstanceNotFound {
                droplet: self.id.clone(),
                version: version.to_string(),
                index,
            })?;

        if instance.mark_down_for_guid(guid) {
            Ok(())
        } else {
            warn!(droplet = %self.id, index, guid = %guid, "Ignoring down for non-resident guid");
            Err(StateError::GuidMismatch {
                droplet: self.id.clone(),
                index,
                resident: instance.guid().cloned(),
                received: guid.clone(),
            })
        }
    }

    /// Suppress missing-instance detection for the reset window starting at `now`.
    pub fn reset_missing_indices(&mut self, now: Timestamp) {
        self.reset_at = now;
    }

    pub fn in_reset_window(&self, now: Timestamp) -> bool {
        self.reset_at.is_set() && !self.reset_at.is_older_than(self.config.reset_window(), now)
    }

    pub fn add_pending_restart(&mut self, index: u32, now: Timestamp) {
        self.pending_restarts
            .insert(index, RestartReceipt { issued_at: now });
    }

    pub fn has_pending_restart(&self, index: u32, now: Timestamp) -> bool {
        self.pending_restarts
            .get(&index)
            .is_some_and(|r| !r.issued_at.is_older_than(self.config.restart_timeout(), now))
    }

    /// Drop receipts older than the restart timeout, returning their indices.
    pub fn expire_pending_restarts(&mut self, now: Timestamp) -> Vec<u32> {
        let timeout = self.config.restart_timeout();
        let expired: Vec<u32> = self
            .pending_restarts
            .iter()
            .filter(|(_, r)| r.issued_at.is_older_than(timeout, now))
            .map(|(index, _)| *index)
            .collect();
        for index in &expired {
            self.pending_restarts.remove(index);
        }
        if !expired.is_empty() {
            debug!(droplet = %self.id, indices = ?expired, "Restart receipts expired");
        }
        expired
    }

    /// Desired indices of the live version with no recent heartbeat and no restart in flight.
    ///
    /// A flapping index is left alone until the flapping restart delay has
    /// passed since its last crash.
    pub fn missing_indices(&self, now: Timestamp) -> Vec<u32> {
        let Some(desired) = self.desired.as_ref() else {
            return Vec::new();
        };
        if !desired.wants_instances() || self.in_reset_window(now) {
            return Vec::new();
        }

        let live = self.versions.get(&desired.live_version);
        (0..desired.num_instances)
            .filter(|index| {
                let pending = self.has_pending_restart(*index, now);
                match live.and_then(|v| v.get(index)) {
                    None => !pending,
                    Some(instance) => {
                        !instance.is_backing_off(now, &self.config)
                            && instance.is_missing(now, &self.config, pending)
                    }
                }
            })
            .collect()
    }

    /// Decide which running instances must be stopped and forget them.
    ///
    /// Consumes duplicates recorded by heartbeats, then prunes by desired
    /// state, version and index. Versions left empty are dropped except the
    /// live version of a droplet that is not stopped.
    pub fn update_extra_instances(&mut self, now: Timestamp) -> BTreeMap<InstanceGuid, ExtraReason> {
        let mut extras = std::mem::take(&mut self.pending_extras);
        let config = Arc::clone(&self.config);
        let desired = self.desired.clone();

        for (version, instances) in self.versions.iter_mut() {
            let version_reason = desired.as_ref().and_then(|d| {
                if d.is_stopped() {
                    Some(ExtraReason::DropletStopped)
                } else if d.live_version != *version {
                    Some(ExtraReason::NotLiveVersion)
                } else {
                    None
                }
            });

            instances.retain(|index, instance| {
                let reason = version_reason.or_else(|| match desired.as_ref() {
                    Some(d) if *index >= d.num_instances => Some(ExtraReason::ExtraInstance),
                    _ => None,
                });

                match reason {
                    Some(reason) => {
                        if instance.is_running(now, &config) {
                            if let Some(guid) = instance.guid() {
                                extras.insert(guid.clone(), reason);
                            }
                        }
                        false
                    }
                    None => {
                        if let Some(guid) = instance.extra_guid_to_prune() {
                            extras.insert(guid, ExtraReason::ExtraInstance);
                        }
                        true
                    }
                }
            });
        }

        let keep_live = desired
            .as_ref()
            .filter(|d| !d.is_stopped())
            .map(|d| d.live_version.clone());
        self.versions
            .retain(|version, instances| !instances.is_empty() || keep_live.as_ref() == Some(version));

        if !extras.is_empty() {
            debug!(droplet = %self.id, count = extras.len(), "Extra instances found");
        }
        self.extra_instances = extras.clone();
        extras
    }

    /// Forget crash records older than the retention window.
    pub fn prune_crashes(&mut self, now: Timestamp) -> usize {
        let retention = self.config.crash_retention();
        let before = self.crashes.len();
        self.crashes
            .retain(|_, record| !record.detected_at.is_older_than(retention, now));
        before - self.crashes.len()
    }

    /// No desired-state confirmation for longer than the GC grace period.
    pub fn ripe_for_gc(&self, now: Timestamp) -> bool {
        self.desired_state_update_timestamp
            .is_older_than(self.config.gc_grace_period(), now)
    }

    /// Indices of the live version currently in `state`.
    pub fn indices_in_state(&self, state: InstanceState) -> Vec<u32> {
        let Some(desired) = self.desired.as_ref() else {
            return Vec::new();
        };
        self.versions
            .get(&desired.live_version)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|(_, i)| i.state() == state)
                    .map(|(index, _)| *index)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn flapping_indices(&self) -> Vec<u32> {
        self.indices_in_state(InstanceState::Flapping)
    }

    pub fn alive_count(&self, version: &str, now: Timestamp) -> usize {
        self.versions
            .get(version)
            .map(|instances| {
                instances
                    .values()
                    .filter(|i| i.is_alive(now, &self.config))
                    .count()
            })
            .unwrap_or(0)
    }

    /// One analysis step: expire receipts, prune crashes, detect missing and extra instances.
    pub fn analyze(&mut self, now: Timestamp) -> Vec<AnomalyEvent> {
        self.expire_pending_restarts(now);
        self.prune_crashes(now);

        let mut events = Vec::new();
        let missing = self.missing_indices(now);
        if !missing.is_empty() {
            events.push(AnomalyEvent::MissingInstances {
                droplet_id: self.id.clone(),
                indices: missing,
            });
        }

        let extras = self.update_extra_instances(now);
        if !extras.is_empty() {
            events.push(AnomalyEvent::ExtraInstances {
                droplet_id: self.id.clone(),
                instances: extras,
            });
        }
        events
    }

    pub fn summary(&self) -> DropletSummary {
        let instances = self
            .versions
            .iter()
            .flat_map(|(version, instances)| {
                instances.iter().map(move |(index, i)| InstanceSummary {
                    version: version.clone(),
                    index: *index,
                    guid: i.guid().cloned(),
                    state: i.state(),
                    crash_count: i.crash_count(),
                })
            })
            .collect();

        DropletSummary {
            droplet: self.id.clone(),
            desired: self.desired.clone(),
            instances,
            pending_restarts: self.pending_restarts.keys().copied().collect(),
            crashes: self.crashes.len(),
            desired_state_update_required: self.desired_state_update_required,
        }
    }

    fn is_live_version(&self, version: &str) -> bool {
        self.desired
            .as_ref()
            .map_or(true, |d| d.live_version == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{AppState, ExitReason, HeartbeatState, PackageState};

    const T0: f64 = 1_000.0;

    fn ts(offset: f64) -> Timestamp {
        Timestamp::from_secs(T0 + offset)
    }

    fn desired(num_instances: u32) -> DesiredState {
        DesiredState {
            num_instances,
            state: AppState::Started,
            live_version: "v1".to_string(),
            package_state: PackageState::Staged,
            last_updated: Timestamp::from_secs(500.0),
        }
    }

    fn droplet_with(num_instances: u32) -> Droplet {
        let mut droplet = Droplet::new(DropletId::new("app"), Arc::new(StateConfig::default()), ts(0.0));
        droplet.set_desired_state(desired(num_instances), ts(0.0));
        droplet
    }

    fn beat(version: &str, index: u32, guid: &str, state: HeartbeatState) -> InstanceHeartbeat {
        InstanceHeartbeat {
            droplet_id: DropletId::new("app"),
            version: version.to_string(),
            index,
            instance_guid: InstanceGuid::new(guid),
            state,
            state_timestamp: ts(0.0),
        }
    }

    fn running(index: u32, guid: &str) -> InstanceHeartbeat {
        beat("v1", index, guid, HeartbeatState::Running)
    }

    fn exit(index: u32, guid: &str, reason: ExitReason) -> ExitMessage {
        ExitMessage {
            droplet_id: DropletId::new("app"),
            version: "v1".to_string(),
            index,
            instance_guid: InstanceGuid::new(guid),
            reason,
            crash_timestamp: None,
        }
    }

    fn guids(extras: &BTreeMap<InstanceGuid, ExtraReason>) -> Vec<(&str, String)> {
        extras
            .iter()
            .map(|(g, r)| (g.as_str(), r.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_indices_for_unreported_indices() {
        let mut droplet = droplet_with(4);
        droplet.process_heartbeat(&running(0, "a"), ts(1.0));
        droplet.process_heartbeat(&running(2, "c"), ts(1.0));

        assert_eq!(droplet.missing_indices(ts(2.0)), vec![1, 3]);
    }

    #[test]
    fn test_missing_indices_empty_unless_started_and_staged() {
        let mut droplet = droplet_with(2);
        droplet.set_desired_state(
            DesiredState {
                package_state: PackageState::Pending,
                ..desired(2)
            },
            ts(0.0),
        );
        assert!(droplet.missing_indices(ts(1.0)).is_empty());

        let fresh = Droplet::new(DropletId::new("other"), Arc::new(StateConfig::default()), ts(0.0));
        assert!(fresh.missing_indices(ts(1.0)).is_empty());
    }

    #[test]
    fn test_lost_instance_missing_until_restart_issued() {
        let mut droplet = droplet_with(1);
        droplet.process_heartbeat(&beat("v1", 0, "a", HeartbeatState::Starting), ts(0.0));
        droplet.process_heartbeat(&running(0, "a"), ts(5.0));
        assert!(droplet.missing_indices(ts(30.0)).is_empty());

        assert_eq!(droplet.missing_indices(ts(40.0)), vec![0]);

        droplet.add_pending_restart(0, ts(40.0));
        assert!(droplet.missing_indices(ts(45.0)).is_empty());

        // receipt expires after the restart timeout
        assert_eq!(droplet.missing_indices(ts(61.0)), vec![0]);
        assert_eq!(droplet.expire_pending_restarts(ts(61.0)), vec![0]);
    }

    #[test]
    fn test_heartbeat_confirms_pending_restart() {
        let mut droplet = droplet_with(1);
        droplet.add_pending_restart(0, ts(0.0));
        droplet.process_heartbeat(&beat("v1", 0, "a", HeartbeatState::Starting), ts(3.0));
        assert!(droplet.summary().pending_restarts.is_empty());
    }

    #[test]
    fn test_reset_window_suppresses_missing() {
        let mut droplet = droplet_with(2);
        droplet.reset_missing_indices(ts(10.0));
        assert!(droplet.missing_indices(ts(20.0)).is_empty());
        assert_eq!(droplet.missing_indices(ts(26.0)), vec![0, 1]);
    }

    #[test]
    fn test_flapping_instance_not_missing() {
        let mut droplet = droplet_with(1);
        assert!(!droplet.process_exit_crash(&exit(0, "a", ExitReason::Crashed), ts(1.0)));
        assert_eq!(droplet.missing_indices(ts(2.0)), vec![0]);

        assert!(droplet.process_exit_crash(&exit(0, "a", ExitReason::Crashed), ts(3.0)));
        assert!(droplet.missing_indices(ts(4.0)).is_empty());
        assert_eq!(droplet.flapping_indices(), vec![0]);
    }

    #[test]
    fn test_flapping_instance_missing_again_after_restart_delay() {
        let mut droplet = droplet_with(1);
        droplet.process_exit_crash(&exit(0, "a", ExitReason::Crashed), ts(1.0));
        droplet.process_exit_crash(&exit(0, "a", ExitReason::Crashed), ts(3.0));

        assert!(droplet.missing_indices(ts(60.0)).is_empty());
        assert_eq!(droplet.missing_indices(ts(64.0)), vec![0]);
        assert_eq!(droplet.missing_indices(ts(86_400.0)), vec![0]);

        // a confirmed restart that crashes again backs off again
        droplet.process_heartbeat(&running(0, "b"), ts(70.0));
        assert!(droplet.missing_indices(ts(71.0)).is_empty());
        assert!(droplet.process_exit_crash(&exit(0, "b", ExitReason::Crashed), ts(80.0)));
        assert!(droplet.missing_indices(ts(100.0)).is_empty());
        assert_eq!(droplet.missing_indices(ts(141.0)), vec![0]);
    }

    #[test]
    fn test_duplicate_guids_reported_once_each() {
        let mut droplet = droplet_with(1);

        droplet.process_heartbeat(&running(0, "alpha"), ts(1.0));
        droplet.process_heartbeat(&running(0, "beta"), ts(2.0));
        let extras = droplet.update_extra_instances(ts(2.0));
        assert_eq!(guids(&extras), vec![("alpha", "Extra instance".to_string())]);

        droplet.process_heartbeat(&running(0, "gamma"), ts(3.0));
        let extras = droplet.update_extra_instances(ts(3.0));
        assert_eq!(guids(&extras), vec![("beta", "Extra instance".to_string())]);

        let resident = droplet.instance("v1", 0).and_then(Instance::guid).cloned();
        assert_eq!(resident, Some(InstanceGuid::new("gamma")));
        assert!(droplet.update_extra_instances(ts(4.0)).is_empty());
    }

    #[test]
    fn test_extra_by_index_version_and_stop() {
        let mut droplet = droplet_with(1);
        droplet.process_heartbeat(&running(0, "keep"), ts(1.0));
        droplet.process_heartbeat(&running(1, "surplus"), ts(1.0));
        droplet.process_heartbeat(&beat("v0", 0, "old", HeartbeatState::Running), ts(1.0));

        let extras = droplet.update_extra_instances(ts(2.0));
        assert_eq!(
            guids(&extras),
            vec![
                ("old", "Not live version".to_string()),
                ("surplus", "Extra instance".to_string()),
            ]
        );
        assert_eq!(droplet.versions().collect::<Vec<_>>(), vec!["v1"]);

        droplet.set_desired_state(
            DesiredState {
                state: AppState::Stopped,
                ..desired(1)
            },
            ts(2.0),
        );
        let extras = droplet.update_extra_instances(ts(3.0));
        assert_eq!(guids(&extras), vec![("keep", "Droplet stopped".to_string())]);
        assert_eq!(droplet.versions().count(), 0);
    }

    #[test]
    fn test_without_desired_only_duplicates_pruned() {
        let mut droplet = Droplet::new(DropletId::new("app"), Arc::new(StateConfig::default()), ts(0.0));
        droplet.process_heartbeat(&running(5, "a"), ts(1.0));
        droplet.process_heartbeat(&running(5, "b"), ts(2.0));

        let extras = droplet.update_extra_instances(ts(2.0));
        assert_eq!(guids(&extras), vec![("a", "Extra instance".to_string())]);
        assert!(droplet.instance("v1", 5).is_some());
    }

    #[test]
    fn test_mark_down_guid_gated() {
        let mut droplet = droplet_with(1);
        droplet.process_heartbeat(&running(0, "a"), ts(1.0));

        let err = droplet
            .mark_instance_as_down("v1", 0, &InstanceGuid::new("stale"))
            .unwrap_err();
        assert!(matches!(err, StateError::GuidMismatch { .. }));

        assert!(matches!(
            droplet.mark_instance_as_down("v9", 0, &InstanceGuid::new("a")),
            Err(StateError::InstanceNotFound { .. })
        ));

        droplet
            .mark_instance_as_down("v1", 0, &InstanceGuid::new("a"))
            .unwrap();
        assert_eq!(
            droplet.instance("v1", 0).map(Instance::state),
            Some(InstanceState::Down)
        );
    }

    #[test]
    fn test_crash_records_pruned_by_age() {
        let mut droplet = droplet_with(1);
        droplet.process_exit_crash(&exit(0, "a", ExitReason::Crashed), ts(1.0));
        assert!(droplet.crash(&InstanceGuid::new("a")).is_some());

        assert_eq!(droplet.prune_crashes(ts(100.0)), 0);
        assert_eq!(droplet.prune_crashes(ts(182.0)), 1);
        assert_eq!(droplet.crash_count(), 0);
    }

    #[test]
    fn test_gc_timer_reset_by_desired_update() {
        let mut droplet = droplet_with(1);
        assert!(!droplet.ripe_for_gc(ts(240.0)));
        assert!(droplet.ripe_for_gc(ts(241.0)));

        droplet.set_desired_state(desired(1), ts(120.0));
        assert!(!droplet.ripe_for_gc(ts(241.0)));
        assert!(!droplet.ripe_for_gc(ts(360.0)));
        assert!(droplet.ripe_for_gc(ts(361.0)));
    }

    #[test]
    fn test_heartbeats_do_not_delay_gc() {
        let mut droplet = droplet_with(1);
        for t in (0..300).step_by(10) {
            droplet.process_heartbeat(&running(0, "a"), ts(t as f64));
        }
        assert!(droplet.ripe_for_gc(ts(300.0)));
    }

    #[test]
    fn test_analyze_reports_missing_and_extra() {
        let mut droplet = droplet_with(2);
        droplet.process_heartbeat(&running(0, "a"), ts(1.0));
        droplet.process_heartbeat(&running(3, "x"), ts(1.0));

        let events = droplet.analyze(ts(2.0));
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            AnomalyEvent::MissingInstances { indices, .. } if indices == &vec![1]
        ));
        assert!(matches!(&events[1], AnomalyEvent::ExtraInstances { .. }));
    }
}
