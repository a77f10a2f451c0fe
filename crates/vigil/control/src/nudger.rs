//! Priority-ordered, deduplicating queue of corrective commands.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info};
use vigil_types::{CommandKey, DesiredState, DropletId, HealthCommand, InstanceGuid, Priority, Timestamp};

use crate::bus::{BusMessage, MessageBus};
use crate::config::{ManagerConfig, ShadowMode};
use crate::error::BusResult;

/// Counters describing what the nudger has done so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NudgerStats {
    pub queued: u64,
    pub deduplicated: u64,
    pub published: u64,
    pub suppressed: u64,
    pub mirrored: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
struct Slot {
    command: HealthCommand,
    priority: Priority,
    seq: i64,
}

type OrderKey = (Reverse<Priority>, i64);

/// Issues START/STOP commands to the control plane.
pub struct Nudger {
    bus: Arc<dyn MessageBus>,
    commands_topic: String,
    shadow_topic: String,
    mode: ShadowMode,
    batch_size: usize,
    order: BTreeMap<OrderKey, CommandKey>,
    slots: HashMap<CommandKey, Slot>,
    next_seq: i64,
    front_seq: i64,
    stats: NudgerStats,
}

impl Nudger {
    pub fn new(bus: Arc<dyn MessageBus>, config: &ManagerConfig) -> Self {
        Self {
            bus,
            commands_topic: config.topics.commands.clone(),
            shadow_topic: config.topics.shadow_commands.clone(),
            mode: config.shadow_mode,
            batch_size: config.queue_batch_size.max(1),
            order: BTreeMap::new(),
            slots: HashMap::new(),
            next_seq: 0,
            front_seq: -1,
            stats: NudgerStats::default(),
        }
    }

    pub fn mode(&self) -> ShadowMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ShadowMode) {
        info!(from = ?self.mode, to = ?mode, "Shadow mode changed");
        self.mode = mode;
    }

    pub fn stats(&self) -> &NudgerStats {
        &self.stats
    }

    pub fn queue_len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Queued commands in drain order.
    pub fn queued(&self) -> Vec<(Priority, HealthCommand)> {
        self.order
            .values()
            .filter_map(|key| self.slots.get(key))
            .map(|slot| (slot.priority, slot.command.clone()))
            .collect()
    }

    /// Queue one START covering every missing index.
    pub fn start_missing_instances(
        &mut self,
        droplet_id: &DropletId,
        desired: &DesiredState,
        indices: &[u32],
        priority: Priority,
    ) {
        if indices.is_empty() {
            return;
        }
        let command = HealthCommand::start(
            droplet_id.clone(),
            desired.live_version.clone(),
            desired.last_updated,
            indices.to_vec(),
        );
        self.enqueue(command, priority);
    }

    pub fn start_instance(
        &mut self,
        droplet_id: &DropletId,
        desired: &DesiredState,
        index: u32,
        priority: Priority,
    ) {
        self.start_missing_instances(droplet_id, desired, &[index], priority);
    }

    pub fn stop_instance(
        &mut self,
        droplet_id: &DropletId,
        last_updated: Timestamp,
        guid: InstanceGuid,
        priority: Priority,
    ) {
        let command = HealthCommand::stop(droplet_id.clone(), last_updated, vec![guid]);
        self.enqueue(command, priority);
    }

    /// Publish a STOP right away, bypassing the queue.
    pub fn stop_instances_immediately(
        &mut self,
        droplet_id: &DropletId,
        last_updated: Timestamp,
        instances: Vec<InstanceGuid>,
    ) -> BusResult<()> {
        if instances.is_empty() {
            return Ok(());
        }
        let command = HealthCommand::stop(droplet_id.clone(), last_updated, instances);
        self.publish(&command)
    }

    /// Insert `command`, merging with a queued duplicate.
    ///
    /// A duplicate keeps its place in line, takes the newer payload and the
    /// more urgent of the two priorities.
    pub fn enqueue(&mut self, command: HealthCommand, priority: Priority) {
        let key = command.dedup_key();

        if let Some(slot) = self.slots.get_mut(&key) {
            if priority > slot.priority {
                self.order.remove(&(Reverse(slot.priority), slot.seq));
                self.order.insert((Reverse(priority), slot.seq), key.clone());
                slot.priority = priority;
            }
            slot.command = command;
            self.stats.deduplicated += 1;
            debug!(droplet = %key_droplet(&key), priority = %slot.priority, "Merged duplicate command");
            return;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(
            droplet = %command.droplet_id(),
            op = ?command.op(),
            priority = %priority,
            "Queued command"
        );
        self.order.insert((Reverse(priority), seq), key.clone());
        self.slots.insert(
            key,
            Slot {
                command,
                priority,
                seq,
            },
        );
        self.stats.queued += 1;
    }

    /// Publish up to one batch of the most urgent commands.
    ///
    /// A failed publish puts its command back at the head of the line and
    /// ends the batch; the rest waits for the next drain.
    pub fn deque_batch_of_requests(&mut self) -> usize {
        let mut sent = 0;
        while sent < self.batch_size {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            let Some(slot) = self.slots.remove(&key) else {
                continue;
            };

            if let Err(err) = self.publish(&slot.command) {
                error!(
                    droplet = %slot.command.droplet_id(),
                    error = %err,
                    "Failed to publish command, will retry"
                );
                self.stats.failed += 1;
                self.requeue_front(key, slot);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, remaining = self.order.len(), "Drained command queue");
        }
        sent
    }

    fn requeue_front(&mut self, key: CommandKey, mut slot: Slot) {
        slot.seq = self.front_seq;
        self.front_seq -= 1;
        self.order.insert((Reverse(slot.priority), slot.seq), key.clone());
        self.slots.insert(key, slot);
    }

    fn publish(&mut self, command: &HealthCommand) -> BusResult<()> {
        match self.mode {
            ShadowMode::Live => {
                self.bus
                    .publish(BusMessage::json(self.commands_topic.as_str(), command)?)?;
                self.stats.published += 1;
                info!(droplet = %command.droplet_id(), op = ?command.op(), "Published command");
            }
            ShadowMode::Shadow => {
                self.stats.suppressed += 1;
                info!(droplet = %command.droplet_id(), op = ?command.op(), "Shadow mode, command not published");
            }
            ShadowMode::Mirror => {
                self.bus
                    .publish(BusMessage::json(self.shadow_topic.as_str(), command)?)?;
                self.stats.mirrored += 1;
                debug!(droplet = %command.droplet_id(), op = ?command.op(), "Mirrored command");
            }
        }
        Ok(())
    }
}

fn key_droplet(key: &CommandKey) -> &DropletId {
    match key {
        CommandKey::Start { droplet_id, .. } | CommandKey::Stop { droplet_id, .. } => droplet_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use tokio::sync::broadcast;
    use vigil_types::{AppState, PackageState};

    fn desired(updated: f64) -> DesiredState {
        DesiredState {
            num_instances: 3,
            state: AppState::Started,
            live_version: "v1".to_string(),
            package_state: PackageState::Staged,
            last_updated: Timestamp::from_secs(updated),
        }
    }

    fn nudger_with(mode: ShadowMode, batch: usize) -> (Nudger, Arc<InMemoryBus>) {
        let bus = Arc::new(InMemoryBus::new());
        let config = ManagerConfig {
            shadow_mode: mode,
            queue_batch_size: batch,
            ..ManagerConfig::default()
        };
        (Nudger::new(bus.clone(), &config), bus)
    }

    fn drain(rx: &mut broadcast::Receiver<BusMessage>) -> Vec<HealthCommand> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message.decode().unwrap());
        }
        out
    }

    fn indices(command: &HealthCommand) -> Vec<u32> {
        match command {
            HealthCommand::Start { indices, .. } => indices.clone(),
            HealthCommand::Stop { .. } => Vec::new(),
        }
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let (mut nudger, bus) = nudger_with(ShadowMode::Live, 10);
        let mut rx = bus.subscribe("cloudcontrollers.hm.requests.default").unwrap();
        let app = DropletId::new("app");

        nudger.start_instance(&app, &desired(1.0), 0, Priority::Low);
        nudger.start_instance(&app, &desired(1.0), 1, Priority::Normal);
        nudger.start_instance(&app, &desired(1.0), 2, Priority::High);
        nudger.start_instance(&app, &desired(1.0), 3, Priority::Normal);

        assert_eq!(nudger.deque_batch_of_requests(), 4);
        let order: Vec<Vec<u32>> = drain(&mut rx).iter().map(indices).collect();
        assert_eq!(order, vec![vec![2], vec![1], vec![3], vec![0]]);
    }

    #[test]
    fn test_duplicate_supersedes_in_place() {
        let (mut nudger, _bus) = nudger_with(ShadowMode::Live, 10);
        let app = DropletId::new("app");

        nudger.start_instance(&app, &desired(1.0), 0, Priority::Low);
        nudger.start_instance(&app, &desired(1.0), 1, Priority::Low);
        nudger.start_instance(&app, &desired(2.0), 0, Priority::Low);

        let queued = nudger.queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(indices(&queued[0].1), vec![0]);
        assert!(matches!(
            queued[0].1,
            HealthCommand::Start { last_updated, .. } if last_updated == Timestamp::from_secs(2.0)
        ));
        assert_eq!(nudger.stats().deduplicated, 1);
    }

    #[test]
    fn test_duplicate_raises_priority() {
        let (mut nudger, _bus) = nudger_with(ShadowMode::Live, 10);
        let app = DropletId::new("app");

        nudger.start_instance(&app, &desired(1.0), 1, Priority::Normal);
        nudger.start_instance(&app, &desired(1.0), 0, Priority::Low);
        nudger.start_instance(&app, &desired(1.0), 0, Priority::High);

        let queued = nudger.queued();
        assert_eq!(queued[0].0, Priority::High);
        assert_eq!(indices(&queued[0].1), vec![0]);
    }

    #[test]
    fn test_batch_bound() {
        let (mut nudger, _bus) = nudger_with(ShadowMode::Live, 2);
        let app = DropletId::new("app");
        for index in 0..5 {
            nudger.start_instance(&app, &desired(1.0), index, Priority::Normal);
        }

        assert_eq!(nudger.deque_batch_of_requests(), 2);
        assert_eq!(nudger.queue_len(), 3);
        assert_eq!(nudger.deque_batch_of_requests(), 2);
        assert_eq!(nudger.deque_batch_of_requests(), 1);
        assert_eq!(nudger.deque_batch_of_requests(), 0);
    }

    #[test]
    fn test_publish_failure_requeues_at_front() {
        let (mut nudger, bus) = nudger_with(ShadowMode::Live, 10);
        let app = DropletId::new("app");
        nudger.start_instance(&app, &desired(1.0), 0, Priority::Normal);
        nudger.start_instance(&app, &desired(1.0), 1, Priority::Normal);

        bus.close();
        assert_eq!(nudger.deque_batch_of_requests(), 0);
        assert_eq!(nudger.queue_len(), 2);
        assert_eq!(indices(&nudger.queued()[0].1), vec![0]);
        assert_eq!(nudger.stats().failed, 1);

        bus.reopen();
        assert_eq!(nudger.deque_batch_of_requests(), 2);
    }

    #[test]
    fn test_shadow_mode_keeps_queue_semantics() {
        let (mut nudger, bus) = nudger_with(ShadowMode::Shadow, 10);
        let mut live = bus.subscribe("cloudcontrollers.hm.requests.default").unwrap();
        let app = DropletId::new("app");
        nudger.start_instance(&app, &desired(1.0), 0, Priority::Normal);

        assert_eq!(nudger.deque_batch_of_requests(), 1);
        assert!(nudger.is_empty());
        assert!(drain(&mut live).is_empty());
        assert_eq!(nudger.stats().suppressed, 1);
    }

    #[test]
    fn test_mirror_mode_uses_shadow_subject() {
        let (mut nudger, bus) = nudger_with(ShadowMode::Mirror, 10);
        let mut live = bus.subscribe("cloudcontrollers.hm.requests.default").unwrap();
        let mut shadow = bus.subscribe("healthmanager.shadow.requests").unwrap();

        nudger
            .stop_instances_immediately(
                &DropletId::new("app"),
                Timestamp::from_secs(1.0),
                vec![InstanceGuid::new("g1")],
            )
            .unwrap();

        assert!(drain(&mut live).is_empty());
        assert_eq!(drain(&mut shadow).len(), 1);
    }

    #[test]
    fn test_stop_immediately_bypasses_queue() {
        let (mut nudger, bus) = nudger_with(ShadowMode::Live, 10);
        let mut rx = bus.subscribe("cloudcontrollers.hm.requests.default").unwrap();

        nudger
            .stop_instances_immediately(
                &DropletId::new("app"),
                Timestamp::from_secs(1.0),
                vec![InstanceGuid::new("b"), InstanceGuid::new("a")],
            )
            .unwrap();

        assert!(nudger.is_empty());
        let sent = drain(&mut rx);
        assert!(matches!(
            &sent[..],
            [HealthCommand::Stop { instances, .. }] if instances == &vec![InstanceGuid::new("a"), InstanceGuid::new("b")]
        ));
    }

    #[test]
    fn test_queued_stop() {
        let (mut nudger, _bus) = nudger_with(ShadowMode::Live, 10);
        nudger.stop_instance(
            &DropletId::new("app"),
            Timestamp::from_secs(1.0),
            InstanceGuid::new("g"),
            Priority::Low,
        );
        assert_eq!(nudger.queue_len(), 1);
    }
}
