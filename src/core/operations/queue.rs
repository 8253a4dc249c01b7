//! Priority queue of pending execution attempts
//!
//! Items live in one FIFO lane per priority tier. Dequeue scans the lanes from
//! `urgent` down to `low` and takes the first eligible item, which gives strict
//! tier ordering with insertion order inside a tier without ever sorting.

use super::types::{OperationId, Priority, QueueItem, QueueItemId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    lanes: [VecDeque<QueueItem>; 4],
    next_sequence: u64,
}

/// Thread-safe priority queue
#[derive(Debug, Default)]
pub struct PriorityQueue {
    state: Mutex<QueueState>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the lane of its priority tier
    pub fn enqueue(&self, mut item: QueueItem) -> QueueItemId {
        let mut state = self.state.lock();
        item.sequence = state.next_sequence;
        state.next_sequence += 1;

        let id = item.id;
        debug!(
            "Enqueued item {} for operation {} (priority {}, attempt {})",
            id,
            item.operation_id,
            item.priority,
            item.attempt()
        );
        state.lanes[item.priority.tier()].push_back(item);
        id
    }

    /// Remove and return the highest-priority item, FIFO within a tier
    pub fn dequeue(&self) -> Option<QueueItem> {
        let mut state = self.state.lock();
        state.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    /// Remove and return the highest-priority item that is due at `now` and
    /// accepted by `eligible`
    pub fn dequeue_eligible<F>(&self, now: DateTime<Utc>, eligible: F) -> Option<QueueItem>
    where
        F: Fn(&QueueItem) -> bool,
    {
        let mut state = self.state.lock();
        for lane in state.lanes.iter_mut() {
            if let Some(index) = lane
                .iter()
                .position(|item| item.is_due(now) && eligible(item))
            {
                return lane.remove(index);
            }
        }
        None
    }

    /// Earliest `scheduled_at` among items accepted by `eligible`
    pub fn next_scheduled_at<F>(&self, eligible: F) -> Option<DateTime<Utc>>
    where
        F: Fn(&QueueItem) -> bool,
    {
        let state = self.state.lock();
        state
            .lanes
            .iter()
            .flatten()
            .filter(|item| eligible(item))
            .map(|item| item.scheduled_at)
            .min()
    }

    /// Remove every item matching `predicate`, returning them in queue order
    pub fn remove_where<F>(&self, predicate: F) -> Vec<QueueItem>
    where
        F: Fn(&QueueItem) -> bool,
    {
        let mut state = self.state.lock();
        let mut removed = Vec::new();
        for lane in state.lanes.iter_mut() {
            let mut kept = VecDeque::with_capacity(lane.len());
            for item in lane.drain(..) {
                if predicate(&item) {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *lane = kept;
        }
        removed
    }

    pub fn contains(&self, id: &QueueItemId) -> bool {
        self.state
            .lock()
            .lanes
            .iter()
            .flatten()
            .any(|item| item.id == *id)
    }

    pub fn count_for(&self, operation_id: &OperationId) -> usize {
        self.state
            .lock()
            .lanes
            .iter()
            .flatten()
            .filter(|item| item.operation_id == *operation_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued items per tier, in tier order
    pub fn depth_by_priority(&self) -> Vec<(Priority, usize)> {
        let state = self.state.lock();
        Priority::ALL
            .into_iter()
            .map(|p| (p, state.lanes[p.tier()].len()))
            .collect()
    }

    /// Copy of all queued items in dequeue order (ignoring schedules)
    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.state.lock().lanes.iter().flatten().cloned().collect()
    }
}
