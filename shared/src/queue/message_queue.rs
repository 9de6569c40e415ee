use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    messages::{
        handle::SendableHandle,
        sendable::{MessageOutput, ParallelFlags, Sendable, SendableStateUpdate, WriteOutcome},
    },
    queue::{
        accounting::{AccountingGroup, GroupStats},
        dependency::{DependencyList, DependencyNodes},
        ordering::{latency_class_for, scheduling_weight, LatencyClass, OrderingInfo},
        queue_config::{QueueConfig, QueueConfigSource, QueueSettings},
        slot_pool::{SlotError, SlotPool, SlotState},
        sorter::{IncrementalSorter, SortEntry},
    },
    types::{GroupKey, ObjectKey, Reliability, SequenceNumber, SlotIndex, Vec3},
};

/// Priority of messages outside any accounting group
const DEFAULT_PRIORITY: f32 = 8.0;
const MAX_PRIORITY: f32 = 16.0;
/// Bump applied to drawn messages beyond their draw distance
const OUT_OF_VIEW_BUMP: f32 = -32.0;
/// Field of view the draw distances are tuned for, in degrees
const REFERENCE_FOV_DEGREES: f32 = 60.0;
const DEFAULT_SEND_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Could not allocate a queue slot: {reason}")]
    AllocationFailed { reason: SlotError },
    #[error("Ran out of dependency nodes while queueing `{description}`. The message was not queued.")]
    DependencyAllocationFailed { description: String },
    #[error("The queue is being emptied and rejected `{description}`")]
    EmptyMode { description: String },
}

/// Inputs to one scheduling pass
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulingParams {
    pub now: Instant,
    /// Expected time of the send opportunity after this one
    pub next: Instant,
    /// One way latency added to every message's age when judging deadlines
    pub transport_latency: Duration,
    /// Sequence number the packet will go out under
    pub seq: SequenceNumber,
    /// Soft byte budget; writing stops once the output reaches it
    pub target_bytes: usize,
    pub witness_position: Option<Vec3>,
    pub witness_direction: Option<Vec3>,
    /// Witness field of view in radians
    pub witness_fov: Option<f32>,
}

impl SchedulingParams {
    pub fn new(now: Instant, seq: SequenceNumber, target_bytes: usize) -> Self {
        Self {
            now,
            next: now + DEFAULT_SEND_INTERVAL,
            transport_latency: Duration::ZERO,
            seq,
            target_bytes,
            witness_position: None,
            witness_direction: None,
            witness_fov: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    pub handle: SendableHandle,
    /// The queue went from having nothing that wakes the connection to having something
    pub became_alerted: bool,
}

/// What one `build_packet` call put into the output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub header_written: bool,
    pub messages_written: usize,
    /// At least one written message may wake the connection
    pub urgent: bool,
}

/// Queue occupancy, last packet usage and accounting group usage
#[derive(Clone, Debug, PartialEq)]
pub struct QueueStats {
    pub messages: usize,
    pub blocking_messages: usize,
    pub alerted_messages: usize,
    pub used_packet_size: usize,
    pub sent_messages: usize,
    pub unsent_messages: usize,
    pub groups: Vec<GroupStats>,
}

/// Per-frame outcome of a message, reset when the frame is prepared
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Liveness {
    Fresh,
    Alive,
    Sent,
    Rotten,
    Discarded,
}

enum Candidate {
    Stop,
    Skip,
    Write { traditional: bool },
}

struct MessageSlot {
    sendable: Box<dyn Sendable>,
    reliability: Reliability,
    flags: ParallelFlags,
    group_key: GroupKey,
    group: Option<usize>,
    inserted: Instant,
    traditional_reliable: bool,
    accumulated_weight: f32,
    liveness: Liveness,
    deps: DependencyList,
    nacks: u32,

    // per-frame scheduling data
    ordering: OrderingInfo,
    depth: i32,
    sort_ordering_slot: SlotIndex,
    child_count: u32,
    children_patched: u32,
    next_in_object: Option<SlotIndex>,
}

impl MessageSlot {
    fn new(sendable: Box<dyn Sendable>, inserted: Instant) -> Self {
        Self {
            reliability: sendable.reliability(),
            flags: sendable.parallel_flags(),
            group_key: sendable.group(),
            sendable,
            group: None,
            inserted,
            traditional_reliable: false,
            accumulated_weight: 0.0,
            liveness: Liveness::Fresh,
            deps: DependencyList::default(),
            nacks: 0,
            ordering: OrderingInfo::default(),
            depth: 0,
            sort_ordering_slot: 0,
            child_count: 0,
            children_patched: 0,
            next_in_object: None,
        }
    }

    fn blocks_state_change(&self) -> bool {
        self.flags.contains(ParallelFlags::BLOCKS_STATE_CHANGE)
    }

    fn wakes(&self) -> bool {
        !self.flags.contains(ParallelFlags::DONT_AWAKE)
    }
}

/// Outbound message queue for one connection. Decides which messages go
/// into each packet and tracks them until they are acked, nacked or dropped.
pub struct MessageQueue {
    slots: SlotPool<MessageSlot>,
    dependencies: DependencyNodes,
    groups: Vec<AccountingGroup>,
    config_source: Option<Arc<dyn QueueConfigSource>>,
    config_version: Option<u32>,
    settings: QueueSettings,
    rng: fastrand::Rng,

    messages: usize,
    blocking_messages: usize,
    alerted_messages: usize,

    empty_mode: bool,
    after_spawning: bool,
    in_write: bool,
    /// Output sequence of the traditional reliable message in flight
    reliable_seq: Option<SequenceNumber>,
    last_ordered: SendableHandle,
    state_change: SendableHandle,
    object_heads: HashMap<ObjectKey, SlotIndex>,

    used_packet_size: usize,
    sent_messages: usize,
    unsent_messages: usize,
}

impl MessageQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let rng = fastrand::Rng::with_seed(settings.seed);
        Self {
            slots: SlotPool::new(),
            dependencies: DependencyNodes::new(),
            groups: Vec::new(),
            config_source: None,
            config_version: None,
            settings,
            rng,
            messages: 0,
            blocking_messages: 0,
            alerted_messages: 0,
            empty_mode: false,
            after_spawning: false,
            in_write: false,
            reliable_seq: None,
            last_ordered: SendableHandle::default(),
            state_change: SendableHandle::default(),
            object_heads: HashMap::new(),
            used_packet_size: 0,
            sent_messages: 0,
            unsent_messages: 0,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    // Configuration

    /// Accounting groups are read from `source` whenever its version changes
    pub fn set_config_source(&mut self, source: Arc<dyn QueueConfigSource>) {
        self.config_source = Some(source);
        self.config_version = None;
        self.regular_cleanup();
    }

    /// Rebuilds every accounting group from `config`. Usage history is reset.
    pub fn set_config(&mut self, config: &QueueConfig) {
        self.apply_config(config, None);
    }

    fn apply_config(&mut self, config: &QueueConfig, version: Option<u32>) {
        // BTreeMap iteration keeps the groups sorted by key
        self.groups = config
            .groups
            .iter()
            .map(|(key, policy)| AccountingGroup::new(*key, policy.clone()))
            .collect();
        self.config_version = version;

        for state in [
            SlotState::Active,
            SlotState::Waiting,
            SlotState::JustQueued,
            SlotState::Limbo,
        ] {
            for index in self.slots.indices(state) {
                let Some(key) = self.slots.value(index).map(|slot| slot.group_key) else {
                    continue;
                };
                let group = self.group_index(key);
                if let Some(slot) = self.slots.value_mut(index) {
                    slot.group = group;
                }
            }
        }
        debug!("message queue now has {} accounting groups", self.groups.len());
    }

    fn group_index(&self, key: GroupKey) -> Option<usize> {
        if key.is_none() {
            return None;
        }
        self.groups.binary_search_by_key(&key, |group| group.id).ok()
    }

    fn regular_cleanup(&mut self) {
        let Some(source) = self.config_source.clone() else {
            return;
        };
        let version = source.version();
        if self.config_version == Some(version) {
            return;
        }
        match source.config() {
            Some(config) => self.apply_config(&config, Some(version)),
            None => {
                warn!("queue configuration version {} has no data", version);
                self.config_version = Some(version);
            }
        }
    }

    /// Messages flagged `AFTER_SPAWNING` are held until this is set
    pub fn set_after_spawning(&mut self, after_spawning: bool) {
        self.after_spawning = after_spawning;
    }

    /// While set, new messages are rejected and nacked reliable messages are dropped
    pub fn set_empty_mode(&mut self, empty_mode: bool) {
        self.empty_mode = empty_mode;
    }

    pub fn is_empty_mode(&self) -> bool {
        self.empty_mode
    }

    // Queueing

    /// Queues a message behind the messages named in `after`. Handles in
    /// `after` that no longer resolve are ignored.
    pub fn add_sendable(
        &mut self,
        now: Instant,
        sendable: Box<dyn Sendable>,
        after: &[SendableHandle],
    ) -> Result<AddOutcome, QueueError> {
        let state = if self.in_write {
            SlotState::JustQueued
        } else {
            SlotState::Active
        };
        self.add_in_state(now, sendable, after, state)
    }

    /// Replaces a queued message. A message still waiting to be written is
    /// swapped in place and keeps its handle; one already in flight is
    /// retired and the replacement queued behind `after`.
    pub fn substitute_sendable(
        &mut self,
        now: Instant,
        handle: SendableHandle,
        sendable: Box<dyn Sendable>,
        after: &[SendableHandle],
    ) -> Result<AddOutcome, QueueError> {
        match self.slots.state_of(handle) {
            Some(SlotState::Active | SlotState::JustQueued) => {
                let was_alerted = self.alerted_messages > 0;
                let group_key = sendable.group();
                let group = self.group_index(group_key);
                let Some(slot) = self.slots.value_mut(handle.index) else {
                    return self.add_sendable(now, sendable, after);
                };

                self.blocking_messages -= usize::from(slot.blocks_state_change());
                self.alerted_messages -= usize::from(slot.wakes());

                slot.reliability = sendable.reliability();
                slot.flags = sendable.parallel_flags();
                slot.group_key = group_key;
                slot.group = group;
                slot.sendable = sendable;

                self.blocking_messages += usize::from(slot.blocks_state_change());
                self.alerted_messages += usize::from(slot.wakes());
                debug!("substituted {} in place", handle);

                self.verify_counters();
                Ok(AddOutcome {
                    handle,
                    became_alerted: !was_alerted && self.alerted_messages > 0,
                })
            }
            Some(SlotState::Waiting) => {
                self.slots.set_state(handle.index, SlotState::Limbo);
                self.add_sendable(now, sendable, after)
            }
            _ => self.add_sendable(now, sendable, after),
        }
    }

    fn add_in_state(
        &mut self,
        now: Instant,
        mut sendable: Box<dyn Sendable>,
        after: &[SendableHandle],
        state: SlotState,
    ) -> Result<AddOutcome, QueueError> {
        let description = sendable.description();
        if self.empty_mode {
            warn!("rejecting {} while the queue is emptied", description);
            sendable.update_state(0, SendableStateUpdate::Rejected);
            return Err(QueueError::EmptyMode { description });
        }

        let was_alerted = self.alerted_messages > 0;
        let mut slot = MessageSlot::new(sendable, now);
        slot.group = self.group_index(slot.group_key);
        let reliability = slot.reliability;
        let is_state_change = slot.flags.contains(ParallelFlags::STATE_CHANGE);
        if is_state_change && self.blocking_messages > 0 {
            warn!(
                "state change {} queued while {} messages still block state changes",
                description, self.blocking_messages
            );
        }

        let (index, handle) = self
            .slots
            .allocate(state, slot)
            .map_err(|reason| QueueError::AllocationFailed { reason })?;

        let mut linked = true;
        for target in after {
            linked &= self.add_dependency(index, *target);
        }
        if !self.state_change.is_null() {
            linked &= self.add_dependency(index, self.state_change);
        }
        let mut traditional_reliable = false;
        if reliability.is_ordered() && after.is_empty() {
            if !self.last_ordered.is_null() {
                linked &= self.add_dependency(index, self.last_ordered);
            }
            traditional_reliable = self.settings.legacy_ordered && reliability.is_reliable();
        }

        if !linked {
            if let Some(mut slot) = self.slots.free(index) {
                self.dependencies.free_list(&mut slot.deps);
            }
            warn!("dropping {}: no dependency nodes left", description);
            return Err(QueueError::DependencyAllocationFailed { description });
        }

        let Some(slot) = self.slots.value_mut(index) else {
            return Err(QueueError::AllocationFailed {
                reason: SlotError::Free { index },
            });
        };
        slot.traditional_reliable = traditional_reliable;
        if reliability.is_ordered() {
            self.last_ordered = handle;
        }
        if is_state_change {
            self.state_change = handle;
        }
        self.blocking_messages += usize::from(slot.blocks_state_change());
        self.alerted_messages += usize::from(slot.wakes());
        self.messages += 1;

        trace!("queued {} as {} in {:?}", description, handle, state);
        self.verify_counters();
        Ok(AddOutcome {
            handle,
            became_alerted: !was_alerted && self.alerted_messages > 0,
        })
    }

    /// Makes `index` wait for `target`. When the target is unreliable its
    /// reliable dependencies are added too, so a lost unreliable message
    /// never leaves the dependent ahead of what that message waited for.
    /// Returns false if a dependency node could not be allocated.
    fn add_dependency(&mut self, index: SlotIndex, target: SendableHandle) -> bool {
        let Some(target_slot) = self.slots.get(target) else {
            // already resolved
            return true;
        };

        let mut targets = vec![target];
        if !target_slot.reliability.is_reliable() {
            for ancestor in self.dependencies.iter(&target_slot.deps) {
                let reliable = self
                    .slots
                    .get(ancestor)
                    .is_some_and(|slot| slot.reliability.is_reliable());
                if reliable {
                    targets.push(ancestor);
                }
            }
        }

        let Some(mut deps) = self.slots.value(index).map(|slot| slot.deps) else {
            return false;
        };
        let mut linked = true;
        for target in targets {
            if self.dependencies.iter(&deps).any(|existing| existing == target) {
                continue;
            }
            if !self.dependencies.push(&mut deps, target) {
                linked = false;
                break;
            }
        }
        if let Some(slot) = self.slots.value_mut(index) {
            slot.deps = deps;
        }
        linked
    }

    /// Withdraws a message. One still waiting to be written is rejected now;
    /// one in flight is held in limbo until its packet resolves.
    pub fn remove_sendable(&mut self, handle: SendableHandle) -> bool {
        let removed = match self.slots.state_of(handle) {
            Some(SlotState::Active | SlotState::JustQueued) => {
                if let Some(slot) = self.slots.value_mut(handle.index) {
                    slot.sendable.update_state(0, SendableStateUpdate::Rejected);
                }
                self.slots.set_state(handle.index, SlotState::Dead)
            }
            Some(SlotState::Waiting) => self.slots.set_state(handle.index, SlotState::Limbo),
            _ => false,
        };
        if removed && handle == self.state_change {
            self.state_change = SendableHandle::default();
        }
        removed
    }

    pub fn find_sendable(&self, handle: SendableHandle) -> Option<&dyn Sendable> {
        self.slots.get(handle).map(|slot| slot.sendable.as_ref())
    }

    /// Lifecycle state of a queued message, `None` once the handle is stale
    pub fn state_of(&self, handle: SendableHandle) -> Option<SlotState> {
        self.slots.state_of(handle)
    }

    // Packet building

    /// Whether `build_packet` would write at least one message
    pub fn are_messages_to_write(&mut self, params: &SchedulingParams) -> bool {
        self.regular_cleanup();
        self.reclaim_dead();
        self.prepare_message_list(params);

        for index in IncrementalSorter::new(self.sort_entries()) {
            match self.candidate(index, params) {
                Candidate::Stop => return false,
                Candidate::Skip => continue,
                Candidate::Write { traditional } => {
                    if traditional && self.reliable_seq.is_some() {
                        continue;
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Writes as many messages as the packet allows into `output`.
    /// `finish_frame` must follow once the packet's fate is known.
    pub fn build_packet(
        &mut self,
        output: &mut dyn MessageOutput,
        params: &SchedulingParams,
    ) -> WriteSummary {
        self.in_write = true;
        self.regular_cleanup();
        self.reclaim_dead();
        self.prepare_message_list(params);
        let summary = self.write_messages(output, params);
        self.in_write = false;
        self.verify_counters();
        summary
    }

    fn prepare_message_list(&mut self, params: &SchedulingParams) {
        self.object_heads.clear();
        for group in &mut self.groups {
            group.begin_frame();
        }

        let active = self.slots.indices(SlotState::Active);
        for index in &active {
            if let Some(slot) = self.slots.value_mut(*index) {
                slot.child_count = 0;
                slot.children_patched = 0;
                slot.next_in_object = None;
            }
        }

        self.calculate_per_frame_data(params, &active);
        self.patch_object_groupings();
        self.patch_ordered_priorities(&active);
    }

    fn calculate_per_frame_data(&mut self, params: &SchedulingParams, active: &[SlotIndex]) {
        let draw_distance_scale = params
            .witness_fov
            .map(|fov| 0.05 + 0.95 * (fov.to_degrees() / REFERENCE_FOV_DEGREES))
            .unwrap_or(1.0);
        let latency = params.transport_latency.as_secs_f32();

        for &index in active {
            let Some(slot) = self.slots.value(index) else {
                continue;
            };
            let group = slot.group.and_then(|group| self.groups.get(group));

            let age_now = params.now.saturating_duration_since(slot.inserted).as_secs_f32();
            let age_next = params.next.saturating_duration_since(slot.inserted).as_secs_f32();
            let mut latency_class = latency_class_for(
                group.map(|group| &group.policy),
                age_now + latency,
                age_next + latency,
            );
            let bandwidth_exceeded =
                group.is_some_and(|group| group.bandwidth_exceeded(params.now, false, &self.rng));
            if bandwidth_exceeded {
                latency_class = LatencyClass::DontBother;
            }
            if !self.after_spawning && slot.flags.contains(ParallelFlags::AFTER_SPAWNING) {
                latency_class = LatencyClass::CantSend;
            }

            let object = slot.sendable.position_info().object;
            let priority = message_priority(slot, group, params, draw_distance_scale);
            let increment = scheduling_weight(priority, self.rng.f32());
            let deps = slot.deps;

            let mut blocked = false;
            for parent in self.dependencies.iter(&deps) {
                match self.slots.state_of(parent) {
                    Some(SlotState::Active) => {
                        if let Some(parent) = self.slots.value_mut(parent.index) {
                            parent.child_count += 1;
                        }
                    }
                    Some(
                        SlotState::Waiting
                        | SlotState::Limbo
                        | SlotState::Dead
                        | SlotState::JustQueued,
                    ) => blocked = true,
                    _ => {}
                }
            }
            if blocked {
                latency_class = LatencyClass::CantSend;
            }

            let Some(slot) = self.slots.value_mut(index) else {
                continue;
            };
            slot.accumulated_weight += increment;
            slot.ordering = OrderingInfo {
                latency_class,
                bandwidth_exceeded,
                scheduling_order: slot.accumulated_weight,
            };
            slot.depth = 0;
            slot.sort_ordering_slot = index;
            slot.liveness = Liveness::Alive;
            if let Some(object) = object {
                slot.next_in_object = self.object_heads.insert(object, index);
            }
        }
    }

    fn ordering_of(&self, index: SlotIndex) -> OrderingInfo {
        self.slots
            .value(index)
            .map(|slot| slot.ordering)
            .unwrap_or_default()
    }

    /// Every message about one object is scheduled with the best ordering among them
    fn patch_object_groupings(&mut self) {
        let heads: Vec<SlotIndex> = self.object_heads.values().copied().collect();
        for head in heads {
            let mut best = head;
            let mut current = self.slots.value(head).and_then(|slot| slot.next_in_object);
            while let Some(index) = current {
                if self.ordering_of(index).compare(&self.ordering_of(best)).is_lt() {
                    best = index;
                }
                current = self.slots.value(index).and_then(|slot| slot.next_in_object);
            }

            let mut current = Some(head);
            while let Some(index) = current {
                current = match self.slots.value_mut(index) {
                    Some(slot) => {
                        slot.sort_ordering_slot = best;
                        slot.next_in_object
                    }
                    None => None,
                };
            }
        }
    }

    /// Walks the dependency graph from its leaves up. Parents inherit a
    /// blocked child's `CantSend`, sit strictly shallower than their children
    /// and adopt a child's better ordering, so nothing is scheduled ahead of
    /// what it waits for.
    fn patch_ordered_priorities(&mut self, active: &[SlotIndex]) {
        let mut worklist: Vec<SlotIndex> = active
            .iter()
            .copied()
            .filter(|index| {
                self.slots
                    .value(*index)
                    .is_some_and(|slot| slot.child_count == 0 && !slot.deps.is_empty())
            })
            .collect();

        while let Some(child) = worklist.pop() {
            let Some(deps) = self.slots.value(child).map(|slot| slot.deps) else {
                continue;
            };
            for parent_handle in self.dependencies.iter(&deps) {
                if self.slots.state_of(parent_handle) != Some(SlotState::Active) {
                    continue;
                }
                let parent = parent_handle.index;
                let (Some(child_slot), Some(parent_slot)) =
                    (self.slots.value(child), self.slots.value(parent))
                else {
                    continue;
                };

                let parent_blocked = parent_slot.ordering.latency_class == LatencyClass::CantSend;
                let child_depth = child_slot.depth;
                let child_sort = child_slot.sort_ordering_slot;
                let adopt = self
                    .ordering_of(child_sort)
                    .compare(&self.ordering_of(parent_slot.sort_ordering_slot))
                    .is_lt();

                if parent_blocked {
                    if let Some(child_slot) = self.slots.value_mut(child) {
                        child_slot.ordering.latency_class = LatencyClass::CantSend;
                    }
                }
                let Some(parent_slot) = self.slots.value_mut(parent) else {
                    continue;
                };
                if parent_slot.depth >= child_depth {
                    parent_slot.depth = child_depth - 1;
                }
                if adopt {
                    parent_slot.sort_ordering_slot = child_sort;
                }
                parent_slot.children_patched += 1;
                if parent_slot.children_patched == parent_slot.child_count {
                    worklist.push(parent);
                }
            }
        }
    }

    fn sort_entries(&self) -> Vec<SortEntry> {
        self.slots
            .iter(SlotState::Active)
            .filter_map(|index| {
                let slot = self.slots.value(index)?;
                let sort = self.ordering_of(slot.sort_ordering_slot);
                Some(SortEntry {
                    index,
                    bucket: sort.latency_bucket(),
                    order_key: sort.order_key(),
                    depth: slot.depth,
                })
            })
            .collect()
    }

    /// Decides what the writer does with the next sorted message
    fn candidate(&mut self, index: SlotIndex, params: &SchedulingParams) -> Candidate {
        let Some(slot) = self.slots.value(index) else {
            return Candidate::Skip;
        };
        if slot.ordering.latency_class == LatencyClass::CantSend {
            return Candidate::Stop;
        }
        let sort_class = self.ordering_of(slot.sort_ordering_slot).latency_class;
        match sort_class {
            LatencyClass::DontBother => return Candidate::Skip,
            LatencyClass::Discardable if !slot.reliability.is_reliable() => {
                if let Some(slot) = self.slots.value_mut(index) {
                    trace!("discarding late {}", slot.sendable.description());
                    slot.liveness = Liveness::Discarded;
                }
                return Candidate::Skip;
            }
            _ => {}
        }

        if slot.liveness != Liveness::Alive {
            return Candidate::Skip;
        }
        if !self.after_spawning && slot.flags.contains(ParallelFlags::AFTER_SPAWNING) {
            return Candidate::Skip;
        }
        if sort_class == LatencyClass::DontCare {
            let group = slot.group.and_then(|group| self.groups.get(group));
            if group.is_some_and(|group| group.bandwidth_exceeded(params.now, true, &self.rng)) {
                return Candidate::Skip;
            }
        }

        for parent in self.dependencies.iter(&slot.deps) {
            let Some(parent_slot) = self.slots.get(parent) else {
                continue;
            };
            let written = matches!(parent_slot.liveness, Liveness::Sent | Liveness::Discarded);
            let in_flight = matches!(
                self.slots.state_of(parent),
                Some(SlotState::Waiting | SlotState::Limbo)
            );
            if !written || in_flight {
                return Candidate::Skip;
            }
        }

        Candidate::Write {
            traditional: slot.traditional_reliable,
        }
    }

    fn write_messages(
        &mut self,
        output: &mut dyn MessageOutput,
        params: &SchedulingParams,
    ) -> WriteSummary {
        let mut summary = WriteSummary::default();
        let mut new_reliable_seq = self.reliable_seq;

        for index in IncrementalSorter::new(self.sort_entries()) {
            match self.candidate(index, params) {
                Candidate::Stop => break,
                Candidate::Skip => continue,
                Candidate::Write { traditional } => {
                    if traditional {
                        if self.reliable_seq.is_some() {
                            continue;
                        }
                        new_reliable_seq = Some(params.seq);
                    }
                }
            }

            if !summary.header_written {
                match output.write_header() {
                    WriteOutcome::OkFinish | WriteOutcome::FailFinish => return summary,
                    WriteOutcome::Delay => {
                        debug_assert!(false, "message headers cannot be delayed");
                    }
                    _ => {}
                }
                summary.header_written = true;
            }

            let handle = self.slots.handle_for(index);
            let size_before = output.approximate_size();
            let Some(slot) = self.slots.value_mut(index) else {
                continue;
            };
            let outcome = output.write_message(slot.sendable.as_mut(), handle);
            let size_after = output.approximate_size();

            slot.liveness = match outcome {
                WriteOutcome::Delay => Liveness::Fresh,
                WriteOutcome::FailContinue | WriteOutcome::FailFinish => Liveness::Rotten,
                WriteOutcome::OkContinue | WriteOutcome::OkFinish => Liveness::Sent,
            };
            let mut follow_ups = Vec::new();
            if slot.liveness == Liveness::Sent {
                slot.sendable.update_state(params.seq, SendableStateUpdate::Sent);
                summary.messages_written += 1;
                summary.urgent |= slot.wakes();
                follow_ups = slot.sendable.take_follow_ups();
            } else if slot.liveness == Liveness::Rotten {
                warn!("failed to write {}", slot.sendable.description());
            }
            let group = slot.group;

            if size_after > size_before {
                if let Some(group) = group.and_then(|group| self.groups.get_mut(group)) {
                    group.push_send(params.now, size_after - size_before);
                }
            }
            for follow_up in follow_ups {
                if let Err(err) = self.add_sendable(params.now, follow_up, &[]) {
                    warn!("could not queue a follow up message: {}", err);
                }
            }

            if outcome.is_finish() || output.approximate_size() >= params.target_bytes {
                break;
            }
        }

        if summary.header_written {
            output.write_footer();
        }
        self.reliable_seq = new_reliable_seq;

        self.used_packet_size = output.approximate_size();
        self.sent_messages = summary.messages_written;
        self.unsent_messages = self
            .slots
            .iter(SlotState::Active)
            .filter(|index| {
                self.slots
                    .value(*index)
                    .is_some_and(|slot| matches!(slot.liveness, Liveness::Alive | Liveness::Fresh))
            })
            .count();
        summary
    }

    /// Settles the packet just built. Written messages start waiting for an
    /// ack, failed or discarded ones are rejected, messages queued during the
    /// write become schedulable and dead slots are reclaimed.
    pub fn finish_frame(&mut self, seq: Option<SequenceNumber>) {
        let mut changes = Vec::new();
        for index in self.slots.iter(SlotState::Active) {
            let Some(slot) = self.slots.value(index) else {
                continue;
            };
            match slot.liveness {
                Liveness::Rotten | Liveness::Discarded => {
                    changes.push((index, SlotState::Dead, true))
                }
                Liveness::Sent => changes.push((index, SlotState::Waiting, false)),
                Liveness::Fresh | Liveness::Alive => {}
            }
        }
        for index in self.slots.iter(SlotState::JustQueued) {
            changes.push((index, SlotState::Active, false));
        }

        for (index, state, reject) in changes {
            if reject {
                if let Some(slot) = self.slots.value_mut(index) {
                    debug!("rejecting {}", slot.sendable.description());
                    slot.sendable
                        .update_state(seq.unwrap_or(0), SendableStateUpdate::Rejected);
                }
            }
            self.slots.set_state(index, state);
        }

        self.reclaim_dead();
        self.verify_counters();
    }

    fn reclaim_dead(&mut self) {
        for index in self.slots.indices(SlotState::Dead) {
            let Some(mut slot) = self.slots.free(index) else {
                continue;
            };
            self.blocking_messages = self
                .blocking_messages
                .saturating_sub(usize::from(slot.blocks_state_change()));
            self.alerted_messages = self
                .alerted_messages
                .saturating_sub(usize::from(slot.wakes()));
            self.messages = self.messages.saturating_sub(1);
            self.dependencies.free_list(&mut slot.deps);
        }
    }

    // Delivery

    /// Resolves the messages sent under output sequence `seq`. Returns the
    /// descriptions of reliable messages that ran out of retries.
    pub fn ack_messages(
        &mut self,
        now: Instant,
        handles: &[SendableHandle],
        seq: SequenceNumber,
        ack: bool,
    ) -> Vec<String> {
        if self.reliable_seq == Some(seq) {
            self.reliable_seq = None;
        }

        let mut exhausted = Vec::new();
        let mut resolved = Vec::new();
        if ack {
            // newest first, so a later state change clears before an earlier one
            for handle in handles.iter().rev() {
                if !matches!(
                    self.slots.state_of(*handle),
                    Some(SlotState::Waiting | SlotState::Limbo)
                ) {
                    trace!("ack for {} which is no longer in flight", handle);
                    continue;
                }
                if let Some(slot) = self.slots.value_mut(handle.index) {
                    slot.sendable.update_state(seq, SendableStateUpdate::Acked);
                }
                self.slots.set_state(handle.index, SlotState::Dead);
                if *handle == self.state_change {
                    self.state_change = SendableHandle::default();
                }
                resolved.push(handle.index);
            }
        } else {
            let budget = self.settings.reliable_retry_budget;
            for handle in handles {
                let state = match self.slots.state_of(*handle) {
                    Some(state @ (SlotState::Waiting | SlotState::Limbo)) => state,
                    _ => {
                        trace!("nack for {} which is no longer in flight", handle);
                        continue;
                    }
                };
                let empty_mode = self.empty_mode;
                let Some(slot) = self.slots.value_mut(handle.index) else {
                    continue;
                };
                let (next_state, update) = if state == SlotState::Limbo
                    || empty_mode
                    || !slot.reliability.is_reliable()
                {
                    (SlotState::Dead, SendableStateUpdate::Nacked)
                } else {
                    slot.nacks += 1;
                    if budget.is_some_and(|budget| slot.nacks > budget) {
                        let description = slot.sendable.description();
                        warn!("{} was lost {} times, giving up", description, slot.nacks);
                        exhausted.push(description);
                        (SlotState::Dead, SendableStateUpdate::Rejected)
                    } else {
                        slot.liveness = Liveness::Fresh;
                        (SlotState::Active, SendableStateUpdate::Requeued)
                    }
                };
                slot.sendable.update_state(seq, update);
                self.slots.set_state(handle.index, next_state);
                resolved.push(handle.index);
            }
        }

        for index in resolved {
            let follow_ups = match self.slots.value_mut(index) {
                Some(slot) => slot.sendable.take_follow_ups(),
                None => continue,
            };
            for follow_up in follow_ups {
                if let Err(err) = self.add_sendable(now, follow_up, &[]) {
                    warn!("could not queue a follow up message: {}", err);
                }
            }
        }
        self.verify_counters();
        exhausted
    }

    /// Drops every message. Messages not yet written are rejected.
    pub fn empty(&mut self) {
        for state in [
            SlotState::Active,
            SlotState::JustQueued,
            SlotState::Waiting,
            SlotState::Limbo,
            SlotState::Dead,
        ] {
            for index in self.slots.indices(state) {
                let Some(mut slot) = self.slots.free(index) else {
                    continue;
                };
                if matches!(state, SlotState::Active | SlotState::JustQueued) {
                    slot.sendable.update_state(0, SendableStateUpdate::Rejected);
                }
                self.dependencies.free_list(&mut slot.deps);
            }
        }
        self.messages = 0;
        self.blocking_messages = 0;
        self.alerted_messages = 0;
        self.reliable_seq = None;
        self.last_ordered = SendableHandle::default();
        self.state_change = SendableHandle::default();
        self.object_heads.clear();
    }

    // Queries

    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    /// No queued message would wake the connection
    pub fn is_idle(&self) -> bool {
        self.alerted_messages == 0
    }

    pub fn is_blocking_state_change(&self) -> bool {
        self.blocking_messages > 0
    }

    pub fn len(&self) -> usize {
        self.messages
    }

    pub fn bandwidth_statistics(&self, now: Instant) -> QueueStats {
        QueueStats {
            messages: self.messages,
            blocking_messages: self.blocking_messages,
            alerted_messages: self.alerted_messages,
            used_packet_size: self.used_packet_size,
            sent_messages: self.sent_messages,
            unsent_messages: self.unsent_messages,
            groups: self.groups.iter().map(|group| group.stats(now)).collect(),
        }
    }

    #[cfg(debug_assertions)]
    fn verify_counters(&self) {
        let mut messages = 0;
        let mut blocking = 0;
        let mut alerted = 0;
        for state in [
            SlotState::Active,
            SlotState::Waiting,
            SlotState::JustQueued,
            SlotState::Limbo,
            SlotState::Dead,
        ] {
            for index in self.slots.iter(state) {
                if let Some(slot) = self.slots.value(index) {
                    messages += 1;
                    blocking += usize::from(slot.blocks_state_change());
                    alerted += usize::from(slot.wakes());
                }
            }
        }
        debug_assert_eq!(messages, self.messages, "message count drifted");
        debug_assert_eq!(blocking, self.blocking_messages, "blocking count drifted");
        debug_assert_eq!(alerted, self.alerted_messages, "alerted count drifted");
    }

    #[cfg(not(debug_assertions))]
    fn verify_counters(&self) {}
}

/// Base priority plus spatial and pulse bumps, clamped to the valid range
fn message_priority(
    slot: &MessageSlot,
    group: Option<&AccountingGroup>,
    params: &SchedulingParams,
    draw_distance_scale: f32,
) -> f32 {
    let mut priority = DEFAULT_PRIORITY;
    if let Some(group) = group {
        let policy = &group.policy;
        priority = policy.priority;

        let info = slot.sendable.position_info();
        if let (Some(position), Some(witness)) = (info.position, params.witness_position) {
            let distance = position.distance(&witness);
            priority += policy.distance.bump(distance);
            if let Some(facing) = params.witness_direction {
                let direction = position.sub(&witness).normalized_or(facing);
                priority += policy.direction.bump(facing.dot(&direction));
            }
            if policy.drawn {
                if let Some(draw_distance) = info.draw_distance {
                    if distance > draw_distance * draw_distance_scale {
                        priority += OUT_OF_VIEW_BUMP;
                    }
                }
            }
        }

        // both sides are sorted by key
        let mut curves = policy.pulses.iter().peekable();
        for pulse in slot.sendable.pulses() {
            while curves.peek().is_some_and(|(key, _)| *key < pulse.key) {
                curves.next();
            }
            if let Some((key, scaler)) = curves.peek() {
                if *key == pulse.key {
                    let age = params.now.saturating_duration_since(pulse.time);
                    priority += scaler.bump(age.as_secs_f32());
                }
            }
        }
    }
    (priority + slot.sendable.priority_delta()).clamp(0.0, MAX_PRIORITY)
}
