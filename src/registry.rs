//! Capacity registry tracking worker capabilities, load and performance.
//!
//! All mutation goes through one mutex so that `reserve` is a
//! compare-and-increment: two concurrent reservations never both take the
//! last free slot on a worker.

use crate::errors::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Default history weight for the performance score moving average.
pub const DEFAULT_SCORE_DECAY: f64 = 0.8;

/// Default oversubscription factor.
pub const DEFAULT_OVERSUBSCRIPTION: f64 = 1.0;

/// Score given to a freshly registered worker.
const INITIAL_SCORE: f64 = 1.0;

/// Declared shape of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    /// Capability tags this worker can serve
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Relative throughput; also the base of its slot count
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl WorkerSpec {
    pub fn new(id: &str, capabilities: &[&str], weight: f64) -> Self {
        Self {
            id: id.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            weight,
        }
    }

    /// Check if this worker advertises the given capability.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub capabilities: BTreeSet<String>,
    pub weight: f64,
    /// Maximum concurrent reservations
    pub capacity: usize,
    /// Current in-flight reservations
    pub load: usize,
    /// Moving average of success, in [0, 1]
    pub score: f64,
    pub completed: u64,
    pub failed: u64,
}

impl WorkerSnapshot {
    /// Check if at least one slot is free.
    pub fn has_capacity(&self) -> bool {
        self.load < self.capacity
    }
}

#[derive(Debug)]
struct WorkerEntry {
    spec: WorkerSpec,
    capacity: usize,
    reserved: HashSet<String>,
    score: f64,
    completed: u64,
    failed: u64,
}

impl WorkerEntry {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.spec.id.clone(),
            capabilities: self.spec.capabilities.clone(),
            weight: self.spec.weight,
            capacity: self.capacity,
            load: self.reserved.len(),
            score: self.score,
            completed: self.completed,
            failed: self.failed,
        }
    }
}

/// Registry of workers and their live load.
#[derive(Debug)]
pub struct CapacityRegistry {
    workers: Mutex<BTreeMap<String, WorkerEntry>>,
    oversubscription_factor: f64,
    score_decay: f64,
}

impl Default for CapacityRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OVERSUBSCRIPTION, DEFAULT_SCORE_DECAY)
    }
}

impl CapacityRegistry {
    /// Create an empty registry.
    ///
    /// `score_decay` is the weight given to history when folding in a new
    /// outcome; it is clamped to [0, 1].
    pub fn new(oversubscription_factor: f64, score_decay: f64) -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            oversubscription_factor,
            score_decay: score_decay.clamp(0.0, 1.0),
        }
    }

    pub fn oversubscription_factor(&self) -> f64 {
        self.oversubscription_factor
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, WorkerEntry>>, RegistryError> {
        self.workers.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Slot count for a weight: `floor(weight * oversubscription_factor)`.
    pub fn capacity_for(&self, weight: f64) -> usize {
        let slots = weight * self.oversubscription_factor;
        if !slots.is_finite() || slots <= 0.0 {
            return 0;
        }
        // Absorb float noise such as 3 * 1.1 / 1.1
        (slots + 1e-9).floor() as usize
    }

    /// Add a worker.
    pub fn register(&self, spec: WorkerSpec) -> Result<(), RegistryError> {
        if spec.id.is_empty() {
            return Err(RegistryError::InvalidWorker {
                worker: spec.id,
                reason: "id must not be empty".into(),
            });
        }
        if !(spec.weight.is_finite() && spec.weight > 0.0) {
            return Err(RegistryError::InvalidWorker {
                reason: format!("weight must be positive, got {}", spec.weight),
                worker: spec.id,
            });
        }
        let capacity = self.capacity_for(spec.weight);
        if capacity == 0 {
            return Err(RegistryError::InvalidWorker {
                reason: format!(
                    "weight {} with oversubscription {} yields no slots",
                    spec.weight, self.oversubscription_factor
                ),
                worker: spec.id,
            });
        }

        let mut workers = self.lock()?;
        if workers.contains_key(&spec.id) {
            return Err(RegistryError::DuplicateWorker(spec.id));
        }

        info!(
            worker = %spec.id,
            capacity,
            capabilities = ?spec.capabilities,
            "Worker registered"
        );
        workers.insert(
            spec.id.clone(),
            WorkerEntry {
                spec,
                capacity,
                reserved: HashSet::new(),
                score: INITIAL_SCORE,
                completed: 0,
                failed: 0,
            },
        );
        Ok(())
    }

    /// Remove a worker, returning its final snapshot.
    ///
    /// Removing an unknown worker is an error, not a no-op.
    pub fn deregister(&self, worker: &str) -> Result<WorkerSnapshot, RegistryError> {
        let mut workers = self.lock()?;
        let entry = workers
            .remove(worker)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker.to_string()))?;
        info!(worker, in_flight = entry.reserved.len(), "Worker deregistered");
        Ok(entry.snapshot())
    }

    /// Take one slot on `worker` for `task`.
    pub fn reserve(&self, worker: &str, task: &str) -> Result<(), RegistryError> {
        let mut workers = self.lock()?;
        let entry = workers
            .get_mut(worker)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker.to_string()))?;

        if entry.reserved.contains(task) {
            return Err(RegistryError::AlreadyReserved {
                worker: worker.to_string(),
                task: task.to_string(),
            });
        }
        if entry.reserved.len() >= entry.capacity {
            return Err(RegistryError::CapacityExceeded {
                worker: worker.to_string(),
                load: entry.reserved.len(),
                capacity: entry.capacity,
            });
        }

        entry.reserved.insert(task.to_string());
        debug!(worker, task, load = entry.reserved.len(), "Slot reserved");
        Ok(())
    }

    /// Give back the slot `task` holds on `worker`.
    pub fn release(&self, worker: &str, task: &str) -> Result<(), RegistryError> {
        let mut workers = self.lock()?;
        let entry = workers
            .get_mut(worker)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker.to_string()))?;

        if !entry.reserved.remove(task) {
            return Err(RegistryError::NotReserved {
                worker: worker.to_string(),
                task: task.to_string(),
            });
        }
        debug!(worker, task, load = entry.reserved.len(), "Slot released");
        Ok(())
    }

    /// Fold a completion into the worker's performance score; returns the new score.
    pub fn record_outcome(&self, worker: &str, success: bool) -> Result<f64, RegistryError> {
        let mut workers = self.lock()?;
        let entry = workers
            .get_mut(worker)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker.to_string()))?;

        let sample = if success { 1.0 } else { 0.0 };
        entry.score =
            (self.score_decay * entry.score + (1.0 - self.score_decay) * sample).clamp(0.0, 1.0);
        if success {
            entry.completed += 1;
        } else {
            entry.failed += 1;
        }
        Ok(entry.score)
    }

    /// Snapshot of one worker.
    pub fn get(&self, worker: &str) -> Result<WorkerSnapshot, RegistryError> {
        let workers = self.lock()?;
        workers
            .get(worker)
            .map(WorkerEntry::snapshot)
            .ok_or_else(|| RegistryError::WorkerNotFound(worker.to_string()))
    }

    /// Snapshot of all workers, ordered by id.
    pub fn snapshot(&self) -> Result<Vec<WorkerSnapshot>, RegistryError> {
        let workers = self.lock()?;
        Ok(workers.values().map(WorkerEntry::snapshot).collect())
    }

    /// Snapshot of workers advertising `capability`, ordered by id.
    pub fn eligible(&self, capability: &str) -> Result<Vec<WorkerSnapshot>, RegistryError> {
        let workers = self.lock()?;
        Ok(workers
            .values()
            .filter(|entry| entry.spec.supports(capability))
            .map(WorkerEntry::snapshot)
            .collect())
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
