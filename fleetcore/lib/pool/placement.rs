use serde::{Deserialize, Serialize};

use crate::registry::Sandbox;

use super::WorkerStatus;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a sandbox was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Name of the worker running the sandbox.
    pub worker: String,

    /// Base URL of that worker's agent.
    pub address: String,

    /// The sandbox as the worker reported it.
    pub sandbox: Sandbox,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Orders the workers that accept a placement: least loaded first, equal loads starting at
/// `rotation` and wrapping around.
pub fn rank_candidates(workers: &[WorkerStatus], rotation: usize) -> Vec<usize> {
    let count = workers.len();
    let mut candidates: Vec<usize> = workers
        .iter()
        .enumerate()
        .filter(|(_, worker)| worker.accepts_placement())
        .map(|(index, _)| index)
        .collect();

    candidates.sort_by_key(|&index| {
        let distance = (index + count - rotation % count.max(1)) % count.max(1);
        (workers[index].vm_count, distance)
    });
    candidates
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, vm_count: usize, capacity: usize) -> WorkerStatus {
        let mut status = WorkerStatus::new(name, format!("http://{name}:8080"), capacity);
        status.vm_count = vm_count;
        status
    }

    #[test]
    fn test_least_loaded_first() {
        let workers = [worker("a", 5, 10), worker("b", 1, 10), worker("c", 3, 10)];
        assert_eq!(rank_candidates(&workers, 0), vec![1, 2, 0]);
    }

    #[test]
    fn test_ties_rotate() {
        let workers = [worker("a", 0, 10), worker("b", 0, 10), worker("c", 0, 10)];
        assert_eq!(rank_candidates(&workers, 0), vec![0, 1, 2]);
        assert_eq!(rank_candidates(&workers, 1), vec![1, 2, 0]);
        assert_eq!(rank_candidates(&workers, 5), vec![2, 0, 1]);
    }

    #[test]
    fn test_full_and_unhealthy_workers_are_skipped() {
        let mut down = worker("b", 0, 10);
        down.healthy = false;
        let workers = [worker("a", 10, 10), down, worker("c", 9, 10)];

        assert_eq!(rank_candidates(&workers, 0), vec![2]);
        assert!(rank_candidates(&[], 3).is_empty());
    }
}
