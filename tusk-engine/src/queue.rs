//! Bounded FIFO admission control
//!
//! An upload id lives in exactly one of two collections: the `active` set,
//! never larger than `max_concurrent`, or the `waiting` FIFO. A slot freed by
//! [`AdmissionQueue::finish_upload`] is handed to the head of the FIFO;
//! [`AdmissionQueue::remove`] frees a slot without promoting anyone.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Outcome of [`AdmissionQueue::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Took a free slot
    Admitted,
    /// Appended to the waiting list at this 1-based position
    Queued(usize),
    AlreadyActive,
    AlreadyQueued,
}

impl Admission {
    pub fn is_active(&self) -> bool {
        matches!(self, Admission::Admitted | Admission::AlreadyActive)
    }
}

/// Where an upload stands in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Active,
    /// 1-based position in the waiting list
    Waiting(usize),
    Absent,
}

impl QueuePosition {
    /// Wire form: `0` active, `n` waiting, `-1` unknown
    pub fn as_i64(&self) -> i64 {
        match self {
            QueuePosition::Active => 0,
            QueuePosition::Waiting(n) => *n as i64,
            QueuePosition::Absent => -1,
        }
    }
}

/// Point-in-time copy of the queue contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Active ids, sorted
    pub active: Vec<String>,
    /// Waiting ids, head first
    pub waiting: Vec<String>,
    pub max_concurrent: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    active: HashSet<String>,
    waiting: VecDeque<String>,
}

impl QueueState {
    fn contains(&self, id: &str) -> bool {
        self.active.contains(id) || self.waiting.iter().any(|w| w == id)
    }
}

#[derive(Debug)]
pub struct AdmissionQueue {
    max_concurrent: usize,
    state: RwLock<QueueState>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        AdmissionQueue {
            max_concurrent,
            state: RwLock::new(QueueState::default()),
        }
    }

    // Every mutation leaves both collections consistent; poisoned locks are recovered.
    fn read(&self) -> RwLockReadGuard<'_, QueueState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Admit `id` if a slot is free, otherwise append it to the waiting list
    pub fn add(&self, id: &str) -> Admission {
        let mut state = self.write();

        if state.active.contains(id) {
            return Admission::AlreadyActive;
        }
        if state.waiting.iter().any(|w| w == id) {
            return Admission::AlreadyQueued;
        }

        if state.active.len() < self.max_concurrent {
            state.active.insert(id.to_string());
            debug!("Admitted upload {} ({}/{})", id, state.active.len(), self.max_concurrent);
            Admission::Admitted
        } else {
            state.waiting.push_back(id.to_string());
            debug!("Queued upload {} at position {}", id, state.waiting.len());
            Admission::Queued(state.waiting.len())
        }
    }

    /// Drop `id` from whichever collection holds it; never promotes
    pub fn remove(&self, id: &str) -> bool {
        let mut state = self.write();

        if state.active.remove(id) {
            return true;
        }
        match state.waiting.iter().position(|w| w == id) {
            Some(index) => {
                state.waiting.remove(index);
                true
            }
            None => false,
        }
    }

    /// Release an active slot and promote the head of the waiting list
    ///
    /// Returns the promoted id. A waiting `id` is dropped from the waiting
    /// list without promoting anyone, so callers can release an upload
    /// without first checking where it sits.
    pub fn finish_upload(&self, id: &str) -> Option<String> {
        let mut state = self.write();

        if !state.active.remove(id) {
            // Only queued (or unknown): leave the line as it is
            if let Some(index) = state.waiting.iter().position(|w| w == id) {
                state.waiting.remove(index);
            }
            return None;
        }

        let next = state.waiting.pop_front()?;
        state.active.insert(next.clone());
        info!("Upload {} finished, promoted {}", id, next);
        Some(next)
    }

    pub fn queue_position(&self, id: &str) -> QueuePosition {
        let state = self.read();

        if state.active.contains(id) {
            return QueuePosition::Active;
        }
        match state.waiting.iter().position(|w| w == id) {
            Some(index) => QueuePosition::Waiting(index + 1),
            None => QueuePosition::Absent,
        }
    }

    pub fn can_accept_upload(&self) -> bool {
        self.read().active.len() < self.max_concurrent
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.read().active.contains(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains(id)
    }

    /// Rebuild from previously active ids, e.g. after a restart
    ///
    /// Duplicates are dropped; the first `max_concurrent` distinct ids become
    /// active and the rest wait in their original order.
    pub fn load_from<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.write();
        state.active.clear();
        state.waiting.clear();

        for id in ids {
            let id = id.as_ref();
            if id.is_empty() || state.contains(id) {
                continue;
            }
            if state.active.len() < self.max_concurrent {
                state.active.insert(id.to_string());
            } else {
                state.waiting.push_back(id.to_string());
            }
        }

        info!(
            "Restored upload queue: {} active, {} waiting",
            state.active.len(),
            state.waiting.len()
        );
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.active.clear();
        state.waiting.clear();
    }

    pub fn active_len(&self) -> usize {
        self.read().active.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.read().waiting.len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.read().active.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.read();
        let mut active: Vec<_> = state.active.iter().cloned().collect();
        active.sort();

        QueueSnapshot {
            active,
            waiting: state.waiting.iter().cloned().collect(),
            max_concurrent: self.max_concurrent,
        }
    }
}
