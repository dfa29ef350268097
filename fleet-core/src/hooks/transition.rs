//! Edge detection over polled VM state.
//!
//! The pool reports the current state of a VM on every poll. The detector
//! remembers the last state pair it emitted for each VM and only reports a
//! [`Transition`] when the observed pair differs.

use crate::types::TransitionKey;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SHARDS: usize = 16;

/// A state change of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub vm_id: i64,
    /// Last emitted pair, `None` on the first observation
    pub previous: Option<TransitionKey>,
    pub current: TransitionKey,
}

/// Per-VM compare-and-set of the last emitted state pair.
///
/// VM ids are spread over a fixed number of shards so that observations of
/// unrelated VMs rarely contend.
pub struct TransitionDetector {
    shards: Vec<Mutex<HashMap<i64, TransitionKey>>>,
}

impl Default for TransitionDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl TransitionDetector {
    pub fn new() -> Self {
        Self { shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect() }
    }

    fn shard(&self, vm_id: i64) -> MutexGuard<'_, HashMap<i64, TransitionKey>> {
        let index = vm_id.rem_euclid(SHARDS as i64) as usize;
        self.shards[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an observation. Returns the edge when `key` differs from the
    /// last emitted pair for this VM.
    pub fn observe(&self, vm_id: i64, key: TransitionKey) -> Option<Transition> {
        let mut shard = self.shard(vm_id);

        match shard.insert(vm_id, key) {
            Some(previous) if previous == key => None,
            previous => Some(Transition { vm_id, previous, current: key }),
        }
    }

    /// Seed the last emitted pair without producing an edge.
    pub fn prime(&self, vm_id: i64, key: TransitionKey) {
        self.shard(vm_id).insert(vm_id, key);
    }

    /// Drop the entry of a VM that will not be observed again.
    pub fn forget(&self, vm_id: i64) -> Option<TransitionKey> {
        self.shard(vm_id).remove(&vm_id)
    }

    /// Ids of every tracked VM, in no particular order.
    pub fn tracked(&self) -> Vec<i64> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            ids.extend(shard.lock().unwrap_or_else(PoisonError::into_inner).keys().copied());
        }
        ids
    }

    pub fn last(&self, vm_id: i64) -> Option<TransitionKey> {
        self.shard(vm_id).get(&vm_id).copied()
    }

    /// Number of tracked VMs.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
