//! Process-wide map of droplets, created lazily on first reference.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};
use vigil_types::{
    AnomalyEvent, DesiredState, DropletId, ExitMessage, ExitReason, Heartbeat, Timestamp,
    UpdateMessage,
};

use crate::config::StateConfig;
use crate::droplet::{Droplet, DropletSummary};
use crate::error::StateError;

/// All droplets known to the engine.
#[derive(Debug, Default)]
pub struct DropletRegistry {
    config: Arc<StateConfig>,
    droplets: BTreeMap<DropletId, Droplet>,
}

impl DropletRegistry {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config: Arc::new(config),
            droplets: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.droplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.droplets.is_empty()
    }

    pub fn contains(&self, id: &DropletId) -> bool {
        self.droplets.contains_key(id)
    }

    pub fn ids(&self) -> Vec<DropletId> {
        self.droplets.keys().cloned().collect()
    }

    pub fn get(&self, id: &DropletId) -> Option<&Droplet> {
        self.droplets.get(id)
    }

    pub fn get_mut(&mut self, id: &DropletId) -> Option<&mut Droplet> {
        self.droplets.get_mut(id)
    }

    pub fn get_or_create(&mut self, id: &DropletId, now: Timestamp) -> &mut Droplet {
        let config = &self.config;
        self.droplets.entry(id.clone()).or_insert_with(|| {
            debug!(droplet = %id, "Tracking new droplet");
            Droplet::new(id.clone(), Arc::clone(config), now)
        })
    }

    pub fn remove(&mut self, id: &DropletId) -> Option<Droplet> {
        self.droplets.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Droplet> {
        self.droplets.values()
    }

    /// Route every entry of an executor heartbeat to its droplet.
    pub fn process_heartbeat(&mut self, heartbeat: &Heartbeat, now: Timestamp) -> usize {
        for beat in &heartbeat.droplets {
            self.get_or_create(&beat.droplet_id, now)
                .process_heartbeat(beat, now);
        }
        heartbeat.droplets.len()
    }

    /// Apply an exit event and return the anomalies it raises.
    pub fn process_exit(&mut self, message: &ExitMessage, now: Timestamp) -> Vec<AnomalyEvent> {
        let config = Arc::clone(&self.config);
        let droplet = self.get_or_create(&message.droplet_id, now);
        droplet.reset_missing_indices(now);

        match message.reason {
            ExitReason::Crashed => {
                let stale = droplet
                    .instance(&message.version, message.index)
                    .is_some_and(|i| {
                        i.is_running(now, &config)
                            && i.guid().is_some_and(|g| *g != message.instance_guid)
                    });
                if stale {
                    warn!(
                        droplet = %message.droplet_id,
                        index = message.index,
                        guid = %message.instance_guid,
                        "Ignoring crash of replaced instance"
                    );
                    return Vec::new();
                }

                droplet.process_exit_crash(message, now);
                vec![AnomalyEvent::ExitCrashed {
                    droplet_id: message.droplet_id.clone(),
                    message: message.clone(),
                }]
            }
            ExitReason::Stopped => {
                if let Err(err) =
                    droplet.mark_instance_as_down(&message.version, message.index, &message.instance_guid)
                {
                    debug!(error = %err, "Stopped exit not applied");
                }
                Vec::new()
            }
            ExitReason::DeaShutdown | ExitReason::DeaEvacuation => {
                match droplet.mark_instance_as_down(
                    &message.version,
                    message.index,
                    &message.instance_guid,
                ) {
                    Ok(()) | Err(StateError::InstanceNotFound { .. }) => {
                        vec![AnomalyEvent::ExitDea {
                            droplet_id: message.droplet_id.clone(),
                            version: message.version.clone(),
                            index: message.index,
                            reason: message.reason,
                        }]
                    }
                    Err(err) => {
                        debug!(error = %err, "Executor exit for replaced instance");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Apply an externally triggered update: reset the droplet and ask for fresh desired state.
    pub fn process_update(&mut self, message: &UpdateMessage, now: Timestamp) -> Vec<AnomalyEvent> {
        let droplet = self.get_or_create(&message.droplet_id, now);
        droplet.reset_missing_indices(now);
        droplet.mark_desired_state_stale();
        vec![AnomalyEvent::DropletUpdated {
            droplet_id: message.droplet_id.clone(),
        }]
    }

    pub fn update_desired(&mut self, id: &DropletId, desired: DesiredState, now: Timestamp) {
        self.get_or_create(id, now).set_desired_state(desired, now);
    }

    /// Flag droplets the provider did not return in its last complete pass.
    pub fn mark_unconfirmed(&mut self, confirmed: &HashSet<DropletId>) -> usize {
        let mut stale = 0;
        for (id, droplet) in self.droplets.iter_mut() {
            if !confirmed.contains(id) {
                droplet.mark_desired_state_stale();
                stale += 1;
            }
        }
        stale
    }

    /// Remove every droplet ripe for garbage collection.
    pub fn sweep_garbage(&mut self, now: Timestamp) -> Vec<DropletId> {
        let ripe: Vec<DropletId> = self
            .droplets
            .values()
            .filter(|d| d.ripe_for_gc(now))
            .map(|d| d.id().clone())
            .collect();

        for id in &ripe {
            self.droplets.remove(id);
            info!(droplet = %id, "Collected droplet without desired state");
        }
        ripe
    }

    pub fn summaries(&self) -> Vec<DropletSummary> {
        self.droplets.values().map(Droplet::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::{AppState, ExecutorId, HeartbeatState, InstanceGuid, InstanceHeartbeat, PackageState};

    fn ts(offset: f64) -> Timestamp {
        Timestamp::from_secs(1_000.0 + offset)
    }

    fn heartbeat(entries: &[(&str, u32, &str)]) -> Heartbeat {
        Heartbeat {
            executor_id: ExecutorId::new("dea-1"),
            droplets: entries
                .iter()
                .map(|(droplet, index, guid)| InstanceHeartbeat {
                    droplet_id: DropletId::new(*droplet),
                    version: "v1".to_string(),
                    index: *index,
                    instance_guid: InstanceGuid::new(*guid),
                    state: HeartbeatState::Running,
                    state_timestamp: ts(0.0),
                })
                .collect(),
        }
    }

    fn exit(droplet: &str, guid: &str, reason: ExitReason) -> ExitMessage {
        ExitMessage {
            droplet_id: DropletId::new(droplet),
            version: "v1".to_string(),
            index: 0,
            instance_guid: InstanceGuid::new(guid),
            reason,
            crash_timestamp: None,
        }
    }

    fn desired() -> DesiredState {
        DesiredState {
            num_instances: 1,
            state: AppState::Started,
            live_version: "v1".to_string(),
            package_state: PackageState::Staged,
            last_updated: ts(0.0),
        }
    }

    #[test]
    fn test_heartbeat_creates_droplets_lazily() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        let processed = registry.process_heartbeat(&heartbeat(&[("a", 0, "g1"), ("b", 0, "g2")]), ts(1.0));

        assert_eq!(processed, 2);
        assert_eq!(registry.ids(), vec![DropletId::new("a"), DropletId::new("b")]);
    }

    #[test]
    fn test_crash_exit_emits_event() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        let events = registry.process_exit(&exit("a", "g1", ExitReason::Crashed), ts(1.0));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], AnomalyEvent::ExitCrashed { .. }));
        let droplet = registry.get(&DropletId::new("a")).unwrap();
        assert!(droplet.crash(&InstanceGuid::new("g1")).is_some());
    }

    #[test]
    fn test_crash_of_replaced_instance_ignored() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        registry.process_heartbeat(&heartbeat(&[("a", 0, "new")]), ts(1.0));

        let events = registry.process_exit(&exit("a", "old", ExitReason::Crashed), ts(2.0));
        assert!(events.is_empty());
    }

    #[test]
    fn test_dea_exit_requires_matching_guid() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        registry.process_heartbeat(&heartbeat(&[("a", 0, "g1")]), ts(1.0));

        let stale = registry.process_exit(&exit("a", "g0", ExitReason::DeaShutdown), ts(2.0));
        assert!(stale.is_empty());

        let events = registry.process_exit(&exit("a", "g1", ExitReason::DeaEvacuation), ts(3.0));
        assert!(matches!(
            events.as_slice(),
            [AnomalyEvent::ExitDea { index: 0, reason: ExitReason::DeaEvacuation, .. }]
        ));
    }

    #[test]
    fn test_stopped_exit_downs_without_event() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        registry.process_heartbeat(&heartbeat(&[("a", 0, "g1")]), ts(1.0));

        assert!(registry
            .process_exit(&exit("a", "g1", ExitReason::Stopped), ts(2.0))
            .is_empty());
    }

    #[test]
    fn test_update_marks_stale_and_emits() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        let message = UpdateMessage {
            droplet_id: DropletId::new("a"),
            version: None,
            index: None,
            instance_guid: None,
        };
        let events = registry.process_update(&message, ts(1.0));

        assert!(matches!(events.as_slice(), [AnomalyEvent::DropletUpdated { .. }]));
        assert!(registry
            .get(&DropletId::new("a"))
            .unwrap()
            .desired_state_update_required());
    }

    #[test]
    fn test_sweep_removes_only_ripe() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        registry.update_desired(&DropletId::new("old"), desired(), ts(0.0));
        registry.update_desired(&DropletId::new("fresh"), desired(), ts(200.0));

        let collected = registry.sweep_garbage(ts(250.0));
        assert_eq!(collected, vec![DropletId::new("old")]);
        assert_eq!(registry.ids(), vec![DropletId::new("fresh")]);
    }

    #[test]
    fn test_mark_unconfirmed() {
        let mut registry = DropletRegistry::new(StateConfig::default());
        registry.update_desired(&DropletId::new("a"), desired(), ts(0.0));
        registry.update_desired(&DropletId::new("b"), desired(), ts(0.0));

        let confirmed: HashSet<_> = [DropletId::new("a")].into_iter().collect();
        assert_eq!(registry.mark_unconfirmed(&confirmed), 1);
        assert!(registry.get(&DropletId::new("b")).unwrap().desired_state_update_required());
    }
}
