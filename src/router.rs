//! Worker selection for ready tasks.
//!
//! The router filters the registry down to workers advertising the task's
//! capability, applies the configured [`Strategy`], and reserves a slot on
//! the chosen worker before returning. The caller owns the resulting
//! [`Reservation`] and must hand it back through [`Router::complete`] or
//! [`Router::release`].

use crate::errors::{RegistryError, RouteError};
use crate::registry::{CapacityRegistry, WorkerSnapshot};
use crate::task::Task;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Virtual nodes per worker on the affinity ring.
pub const DEFAULT_VIRTUAL_NODES: usize = 64;

/// Distribution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Cycle through eligible workers
    RoundRobin,
    /// Random, proportional to remaining headroom
    Weighted,
    /// Fewest in-flight tasks, then best score, then lowest id
    #[default]
    LeastLoaded,
    /// Most specialised eligible worker
    CapabilityMatch,
    /// Consistent hash of the task's affinity key
    AffinityHash,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round-robin"),
            Strategy::Weighted => write!(f, "weighted"),
            Strategy::LeastLoaded => write!(f, "least-loaded"),
            Strategy::CapabilityMatch => write!(f, "capability-match"),
            Strategy::AffinityHash => write!(f, "affinity-hash"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(Strategy::RoundRobin),
            "weighted" => Ok(Strategy::Weighted),
            "least-loaded" => Ok(Strategy::LeastLoaded),
            "capability-match" => Ok(Strategy::CapabilityMatch),
            "affinity-hash" => Ok(Strategy::AffinityHash),
            _ => anyhow::bail!(
                "Invalid strategy '{}'. Valid values: round-robin, weighted, least-loaded, capability-match, affinity-hash",
                s
            ),
        }
    }
}

/// A slot held on a worker for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub task_id: String,
    pub worker_id: String,
}

/// Selects workers and reserves their capacity.
#[derive(Debug)]
pub struct Router {
    registry: Arc<CapacityRegistry>,
    strategy: Strategy,
    /// Round-robin position per capability
    cursors: Mutex<HashMap<String, usize>>,
    rng: Mutex<StdRng>,
    virtual_nodes: usize,
}

impl Router {
    pub fn new(registry: Arc<CapacityRegistry>, strategy: Strategy) -> Self {
        Self {
            registry,
            strategy,
            cursors: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }

    /// Make weighted selection reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_virtual_nodes(mut self, virtual_nodes: usize) -> Self {
        self.virtual_nodes = virtual_nodes.max(1);
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn registry(&self) -> &Arc<CapacityRegistry> {
        &self.registry
    }

    /// Pick a worker for `task` and reserve a slot on it.
    ///
    /// Fails with `NoEligibleWorker` when nothing advertises the capability and
    /// `CapacityExceeded` when every eligible worker is full. A reservation
    /// lost to a concurrent caller is retried against a fresh snapshot.
    pub fn route(&self, task: &Task) -> Result<Reservation, RouteError> {
        let mut eligible = self.registry.eligible(&task.capability)?;
        if eligible.is_empty() {
            return Err(RouteError::NoEligibleWorker {
                task: task.id.clone(),
                capability: task.capability.clone(),
            });
        }

        for _ in 0..=eligible.len() {
            let Some(worker) = self.select(task, &eligible)? else {
                break;
            };

            match self.registry.reserve(&worker, &task.id) {
                Ok(()) => {
                    debug!(
                        task = %task.id,
                        worker = %worker,
                        strategy = %self.strategy,
                        "Task routed"
                    );
                    return Ok(Reservation {
                        task_id: task.id.clone(),
                        worker_id: worker,
                    });
                }
                Err(RegistryError::CapacityExceeded { .. } | RegistryError::WorkerNotFound(_)) => {
                    eligible = self.registry.eligible(&task.capability)?;
                    if eligible.is_empty() {
                        return Err(RouteError::NoEligibleWorker {
                            task: task.id.clone(),
                            capability: task.capability.clone(),
                        });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(RouteError::CapacityExceeded {
            task: task.id.clone(),
            eligible: eligible.len(),
        })
    }

    /// Release a reservation after the executor reported an outcome.
    pub fn complete(&self, reservation: &Reservation, success: bool) -> Result<f64, RegistryError> {
        self.registry
            .release(&reservation.worker_id, &reservation.task_id)?;
        self.registry
            .record_outcome(&reservation.worker_id, success)
    }

    /// Release a reservation without scoring the worker (cancellation, abandonment).
    pub fn release(&self, reservation: &Reservation) -> Result<(), RegistryError> {
        self.registry
            .release(&reservation.worker_id, &reservation.task_id)
    }

    /// Apply the strategy; `None` when no eligible worker has a free slot.
    fn select(
        &self,
        task: &Task,
        eligible: &[WorkerSnapshot],
    ) -> Result<Option<String>, RegistryError> {
        if !eligible.iter().any(WorkerSnapshot::has_capacity) {
            return Ok(None);
        }

        let chosen = match self.strategy {
            Strategy::RoundRobin => self.select_round_robin(&task.capability, eligible)?,
            Strategy::Weighted => self.select_weighted(eligible)?,
            Strategy::LeastLoaded => select_least_loaded(eligible),
            Strategy::CapabilityMatch => select_capability_match(eligible),
            Strategy::AffinityHash => self.select_affinity(task.routing_key(), eligible),
        };

        Ok(chosen.map(|w| w.id.clone()))
    }

    fn select_round_robin<'a>(
        &self,
        capability: &str,
        eligible: &'a [WorkerSnapshot],
    ) -> Result<Option<&'a WorkerSnapshot>, RegistryError> {
        let mut cursors = self.cursors.lock().map_err(|_| RegistryError::LockPoisoned)?;
        let cursor = cursors.entry(capability.to_string()).or_insert(0);

        let n = eligible.len();
        let start = *cursor % n;
        for offset in 0..n {
            let idx = (start + offset) % n;
            if eligible[idx].has_capacity() {
                *cursor = idx + 1;
                return Ok(Some(&eligible[idx]));
            }
        }
        Ok(None)
    }

    fn select_weighted<'a>(
        &self,
        eligible: &'a [WorkerSnapshot],
    ) -> Result<Option<&'a WorkerSnapshot>, RegistryError> {
        let factor = self.registry.oversubscription_factor();
        let weights: Vec<(usize, f64)> = eligible
            .iter()
            .enumerate()
            .filter(|(_, w)| w.has_capacity())
            .map(|(i, w)| (i, (w.weight * factor - w.load as f64).max(0.0)))
            .filter(|(_, headroom)| *headroom > 0.0)
            .collect();

        let total: f64 = weights.iter().map(|(_, h)| h).sum();
        if weights.is_empty() || total <= 0.0 {
            return Ok(select_least_loaded(eligible));
        }

        let mut rng = self.rng.lock().map_err(|_| RegistryError::LockPoisoned)?;
        let mut point = rng.gen_range(0.0..total);
        for &(i, headroom) in &weights {
            if point < headroom {
                return Ok(Some(&eligible[i]));
            }
            point -= headroom;
        }
        Ok(weights.last().map(|&(i, _)| &eligible[i]))
    }

    fn select_affinity<'a>(
        &self,
        key: &str,
        eligible: &'a [WorkerSnapshot],
    ) -> Option<&'a WorkerSnapshot> {
        // Ring spans every eligible worker so the key→worker mapping does not
        // shift with load; full workers are skipped clockwise.
        let mut ring: Vec<(u64, usize)> = eligible
            .iter()
            .enumerate()
            .flat_map(|(i, w)| {
                (0..self.virtual_nodes).map(move |v| (hash64(&format!("{}#{}", w.id, v)), i))
            })
            .collect();
        ring.sort_unstable();

        let point = hash64(key);
        let start = ring.partition_point(|&(h, _)| h < point);
        (0..ring.len())
            .map(|offset| ring[(start + offset) % ring.len()].1)
            .map(|i| &eligible[i])
            .find(|w| w.has_capacity())
    }
}

fn select_least_loaded(eligible: &[WorkerSnapshot]) -> Option<&WorkerSnapshot> {
    eligible
        .iter()
        .filter(|w| w.has_capacity())
        .min_by(|a, b| {
            a.load
                .cmp(&b.load)
                .then(b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
                .then(a.id.cmp(&b.id))
        })
}

fn select_capability_match(eligible: &[WorkerSnapshot]) -> Option<&WorkerSnapshot> {
    eligible
        .iter()
        .filter(|w| w.has_capacity())
        .min_by(|a, b| {
            a.capabilities
                .len()
                .cmp(&b.capabilities.len())
                .then(a.load.cmp(&b.load))
                .then(a.id.cmp(&b.id))
        })
}

/// Stable 64-bit hash, identical across processes and platforms.
fn hash64(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerSpec;
    use std::collections::{HashMap, HashSet};

    fn registry(workers: &[(&str, &[&str], f64)]) -> Arc<CapacityRegistry> {
        let registry = CapacityRegistry::default();
        for (id, caps, weight) in workers {
            registry.register(WorkerSpec::new(id, caps, *weight)).unwrap();
        }
        Arc::new(registry)
    }

    fn task(id: &str) -> Task {
        Task::new(id, "rust")
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("least_loaded".parse::<Strategy>().unwrap(), Strategy::LeastLoaded);
        assert_eq!("AFFINITY-HASH".parse::<Strategy>().unwrap(), Strategy::AffinityHash);
        assert!("random".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_strategy_display_round_trips() {
        for s in [
            Strategy::RoundRobin,
            Strategy::Weighted,
            Strategy::LeastLoaded,
            Strategy::CapabilityMatch,
            Strategy::AffinityHash,
        ] {
            assert_eq!(s.to_string().parse::<Strategy>().unwrap(), s);
        }
    }

    #[test]
    fn test_no_eligible_worker() {
        let router = Router::new(registry(&[("w1", &["docs"], 1.0)]), Strategy::LeastLoaded);
        let err = router.route(&task("t1")).unwrap_err();
        assert_eq!(
            err,
            RouteError::NoEligibleWorker {
                task: "t1".into(),
                capability: "rust".into()
            }
        );
    }

    #[test]
    fn test_capacity_exceeded_when_all_full() {
        let router = Router::new(registry(&[("w1", &["rust"], 1.0)]), Strategy::LeastLoaded);
        router.route(&task("t1")).unwrap();
        let err = router.route(&task("t2")).unwrap_err();
        assert!(matches!(err, RouteError::CapacityExceeded { eligible: 1, .. }));
    }

    #[test]
    fn test_route_reserves_capacity() {
        let reg = registry(&[("w1", &["rust"], 2.0)]);
        let router = Router::new(Arc::clone(&reg), Strategy::LeastLoaded);
        let r = router.route(&task("t1")).unwrap();
        assert_eq!(r.worker_id, "w1");
        assert_eq!(reg.get("w1").unwrap().load, 1);

        router.complete(&r, true).unwrap();
        assert_eq!(reg.get("w1").unwrap().load, 0);
        assert_eq!(reg.get("w1").unwrap().completed, 1);
    }

    #[test]
    fn test_release_does_not_score() {
        let reg = registry(&[("w1", &["rust"], 1.0)]);
        let router = Router::new(Arc::clone(&reg), Strategy::LeastLoaded);
        let r = router.route(&task("t1")).unwrap();
        router.release(&r).unwrap();
        let snap = reg.get("w1").unwrap();
        assert_eq!(snap.load, 0);
        assert_eq!(snap.completed + snap.failed, 0);
    }

    #[test]
    fn test_round_robin_visits_each_worker_once() {
        let reg = registry(&[
            ("w1", &["rust"], 1.0),
            ("w2", &["rust"], 1.0),
            ("w3", &["rust"], 1.0),
        ]);
        let router = Router::new(reg, Strategy::RoundRobin);

        let picked: Vec<String> = (0..3)
            .map(|i| router.route(&task(&format!("t{i}"))).unwrap().worker_id)
            .collect();
        assert_eq!(picked, vec!["w1", "w2", "w3"]);
    }

    #[test]
    fn test_round_robin_persists_across_calls_with_releases() {
        let reg = registry(&[("a", &["rust"], 4.0), ("b", &["rust"], 4.0)]);
        let router = Router::new(reg, Strategy::RoundRobin);

        let mut picked = Vec::new();
        for i in 0..4 {
            let r = router.route(&task(&format!("t{i}"))).unwrap();
            router.complete(&r, true).unwrap();
            picked.push(r.worker_id);
        }
        assert_eq!(picked, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_round_robin_skips_full_worker() {
        let reg = registry(&[("w1", &["rust"], 1.0), ("w2", &["rust"], 2.0)]);
        let router = Router::new(reg, Strategy::RoundRobin);

        assert_eq!(router.route(&task("t1")).unwrap().worker_id, "w1");
        assert_eq!(router.route(&task("t2")).unwrap().worker_id, "w2");
        // w1 is full, cursor wraps to it and moves on
        assert_eq!(router.route(&task("t3")).unwrap().worker_id, "w2");
    }

    #[test]
    fn test_least_loaded_prefers_idle_then_score_then_id() {
        let reg = registry(&[
            ("w1", &["rust"], 2.0),
            ("w2", &["rust"], 2.0),
            ("w3", &["rust"], 2.0),
        ]);
        reg.reserve("w1", "busy").unwrap();
        reg.record_outcome("w2", false).unwrap();
        let router = Router::new(Arc::clone(&reg), Strategy::LeastLoaded);

        // w2 and w3 idle; w3 has the better score
        assert_eq!(router.route(&task("t1")).unwrap().worker_id, "w3");
        // now w2 is the only idle worker
        assert_eq!(router.route(&task("t2")).unwrap().worker_id, "w2");
    }

    #[test]
    fn test_least_loaded_tie_breaks_by_id() {
        let reg = registry(&[("b", &["rust"], 1.0), ("a", &["rust"], 1.0)]);
        let router = Router::new(reg, Strategy::LeastLoaded);
        assert_eq!(router.route(&task("t1")).unwrap().worker_id, "a");
    }

    #[test]
    fn test_capability_match_prefers_specialist() {
        let reg = registry(&[
            ("generalist", &["rust", "docs", "python"], 4.0),
            ("specialist", &["rust"], 1.0),
        ]);
        let router = Router::new(reg, Strategy::CapabilityMatch);
        assert_eq!(router.route(&task("t1")).unwrap().worker_id, "specialist");
        // specialist is full now
        assert_eq!(router.route(&task("t2")).unwrap().worker_id, "generalist");
    }

    #[test]
    fn test_weighted_distribution_follows_headroom() {
        let reg = registry(&[("big", &["rust"], 9.0), ("small", &["rust"], 1.0)]);
        let router = Router::new(reg, Strategy::Weighted).with_seed(7);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..1000 {
            let r = router.route(&task(&format!("t{i}"))).unwrap();
            router.complete(&r, true).unwrap();
            *counts.entry(r.worker_id).or_default() += 1;
        }
        let big = counts.get("big").copied().unwrap_or(0);
        let small = counts.get("small").copied().unwrap_or(0);
        assert_eq!(big + small, 1000);
        assert!(big > 800, "big={big} small={small}");
        assert!(small > 40, "big={big} small={small}");
    }

    #[test]
    fn test_weighted_never_picks_full_worker() {
        let reg = registry(&[("a", &["rust"], 1.0), ("b", &["rust"], 1.0)]);
        let router = Router::new(reg, Strategy::Weighted).with_seed(1);
        let first = router.route(&task("t1")).unwrap().worker_id;
        let second = router.route(&task("t2")).unwrap().worker_id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_affinity_keeps_group_together() {
        let reg = registry(&[
            ("w1", &["rust"], 100.0),
            ("w2", &["rust"], 100.0),
            ("w3", &["rust"], 100.0),
        ]);
        let router = Router::new(reg, Strategy::AffinityHash);

        let workers: HashSet<String> = (0..10)
            .map(|i| {
                router
                    .route(&task(&format!("t{i}")).with_affinity("group-a"))
                    .unwrap()
                    .worker_id
            })
            .collect();
        assert_eq!(workers.len(), 1);
    }

    #[test]
    fn test_affinity_is_consistent_when_worker_leaves() {
        let reg = registry(&[
            ("w1", &["rust"], 1000.0),
            ("w2", &["rust"], 1000.0),
            ("w3", &["rust"], 1000.0),
        ]);
        let router = Router::new(Arc::clone(&reg), Strategy::AffinityHash);

        let keys: Vec<String> = (0..200).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                let r = router
                    .route(&task(&format!("a{i}")).with_affinity(k))
                    .unwrap();
                router.release(&r).unwrap();
                r.worker_id
            })
            .collect();

        // Every worker should own some keys
        let owners: HashSet<&String> = before.iter().collect();
        assert_eq!(owners.len(), 3);

        reg.deregister("w3").unwrap();

        for (i, k) in keys.iter().enumerate() {
            let r = router
                .route(&task(&format!("b{i}")).with_affinity(k))
                .unwrap();
            router.release(&r).unwrap();
            if before[i] != "w3" {
                assert_eq!(r.worker_id, before[i], "key {k} moved");
            }
        }
    }

    #[test]
    fn test_affinity_spills_over_when_owner_full() {
        let reg = registry(&[("w1", &["rust"], 1.0), ("w2", &["rust"], 1.0)]);
        let router = Router::new(reg, Strategy::AffinityHash);
        let first = router
            .route(&task("t1").with_affinity("g"))
            .unwrap()
            .worker_id;
        let second = router
            .route(&task("t2").with_affinity("g"))
            .unwrap()
            .worker_id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_hash64_is_stable() {
        assert_eq!(hash64("conductor"), hash64("conductor"));
        assert_ne!(hash64("a"), hash64("b"));
    }
}
