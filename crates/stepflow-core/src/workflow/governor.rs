//! Ceiling on simultaneously running workflow executions.
//!
//! Admission is an immediate yes/no: there is no queue. The check and the
//! insert happen under one lock, so concurrent callers can never push the
//! in-flight count past the limit.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

/// Tracks admitted runs against a fixed limit.
#[derive(Debug)]
pub struct RunGovernor {
    limit: usize,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl RunGovernor {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admit `run_id` if below the limit. Re-admitting an admitted run is a no-op
    /// that returns `true`.
    pub fn try_admit(&self, run_id: Uuid) -> bool {
        let mut set = self.lock();
        if set.contains(&run_id) {
            return true;
        }
        if set.len() >= self.limit {
            return false;
        }
        set.insert(run_id);
        true
    }

    /// Release a run. Releasing an unknown run is a no-op.
    pub fn release(&self, run_id: Uuid) {
        self.lock().remove(&run_id);
    }

    /// Admit `run_id` and return a guard that releases it on drop.
    pub fn admit(self: &Arc<Self>, run_id: Uuid) -> Option<Admission> {
        self.try_admit(run_id).then(|| Admission {
            governor: Arc::clone(self),
            run_id,
        })
    }

    /// IDs of currently admitted runs.
    pub fn in_flight(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.lock().iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        // The set stays consistent even if a holder panicked
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// RAII admission: the run is released when this is dropped.
#[derive(Debug)]
pub struct Admission {
    governor: Arc<RunGovernor>,
    run_id: Uuid,
}

impl Admission {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.governor.release(self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit() {
        let gov = RunGovernor::new(2);
        assert!(gov.try_admit(Uuid::now_v7()));
        assert!(gov.try_admit(Uuid::now_v7()));
        assert!(!gov.try_admit(Uuid::now_v7()));
        assert_eq!(gov.in_flight_count(), 2);
    }

    #[test]
    fn test_release_frees_slot() {
        let gov = RunGovernor::new(1);
        let first = Uuid::now_v7();
        assert!(gov.try_admit(first));
        assert!(!gov.try_admit(Uuid::now_v7()));
        gov.release(first);
        assert!(gov.try_admit(Uuid::now_v7()));
    }

    #[test]
    fn test_readmit_same_run_is_idempotent() {
        let gov = RunGovernor::new(1);
        let id = Uuid::now_v7();
        assert!(gov.try_admit(id));
        assert!(gov.try_admit(id));
        assert_eq!(gov.in_flight(), vec![id]);
    }

    #[test]
    fn test_zero_limit_admits_nothing() {
        let gov = RunGovernor::new(0);
        assert!(!gov.try_admit(Uuid::now_v7()));
    }

    #[test]
    fn test_admission_guard_releases_on_drop() {
        let gov = Arc::new(RunGovernor::new(1));
        let id = Uuid::now_v7();
        {
            let admission = gov.admit(id).unwrap();
            assert_eq!(admission.run_id(), id);
            assert!(gov.admit(Uuid::now_v7()).is_none());
        }
        assert_eq!(gov.in_flight_count(), 0);
        assert!(gov.admit(Uuid::now_v7()).is_some());
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let gov = Arc::new(RunGovernor::new(5));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let gov = Arc::clone(&gov);
                std::thread::spawn(move || gov.try_admit(Uuid::now_v7()))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(gov.in_flight_count(), 5);
    }
}
