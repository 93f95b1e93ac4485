//! Pure backend-selection logic.
//!
//! Deliberately free of locking or I/O: the pool holds the lock and calls
//! straight into `select` with a snapshot of healthy backends, then applies
//! the result (increment in-flight, advance the rotation index) itself.

use crate::backend::BackendSnapshot;
use crate::config::Strategy;

/// Select a backend from `backends` (must be non-empty) using `strategy` and
/// the pool's current rotation `index`. Returns the chosen backend's
/// position in `backends` and the index to store for the next call. An
/// unrecognized strategy name falls back to the first backend, leaving the
/// rotation index untouched.
pub fn select(backends: &[BackendSnapshot], strategy: &Strategy, index: usize) -> (usize, usize) {
    assert!(!backends.is_empty(), "select called with no backends");

    match strategy {
        Strategy::RoundRobin => (index % backends.len(), index + 1),
        Strategy::LeastConnections => tie_broken(backends, index, |b| b.inflight as f64),
        Strategy::LeastLatency => tie_broken(backends, index, |b| b.avg_latency_ms),
        Strategy::LeastLoad => {
            tie_broken(backends, index, |b| (b.gpu_load + b.inflight) as f64)
        }
        Strategy::Unknown(_) => (0, index),
    }
}

/// Compute the minimum key across `backends`, collect the indices tied at
/// that minimum (preserving order), and pick among them by rotation index.
fn tie_broken(
    backends: &[BackendSnapshot],
    index: usize,
    key: impl Fn(&BackendSnapshot) -> f64,
) -> (usize, usize) {
    let min_key = backends
        .iter()
        .map(&key)
        .fold(f64::INFINITY, |a, b| a.min(b));

    let tied: Vec<usize> = backends
        .iter()
        .enumerate()
        .filter(|(_, b)| key(b) == min_key)
        .map(|(i, _)| i)
        .collect();

    let chosen = tied[index % tied.len()];
    (chosen, index + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(inflight: u32, latency: f64, gpu_load: u32) -> BackendSnapshot {
        BackendSnapshot {
            host: "h".to_string(),
            port: 0,
            inflight,
            avg_latency_ms: latency,
            gpu_load,
        }
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let backends = vec![snap(0, 0.0, 0), snap(0, 0.0, 0)];
        let (i0, idx) = select(&backends, &Strategy::RoundRobin, 0);
        let (i1, idx) = select(&backends, &Strategy::RoundRobin, idx);
        let (i2, _) = select(&backends, &Strategy::RoundRobin, idx);
        assert_eq!([i0, i1, i2], [0, 1, 0]);
    }

    #[test]
    fn least_connections_prefers_fewest_inflight() {
        let backends = vec![snap(3, 0.0, 0), snap(0, 0.0, 0), snap(1, 0.0, 0)];
        let (chosen, _) = select(&backends, &Strategy::LeastConnections, 0);
        assert_eq!(chosen, 1);
    }

    #[test]
    fn least_latency_prefers_fastest() {
        let backends = vec![snap(0, 50.0, 0), snap(0, 5.0, 0)];
        let (chosen, _) = select(&backends, &Strategy::LeastLatency, 0);
        assert_eq!(chosen, 1);
    }

    #[test]
    fn least_load_sums_remote_and_local() {
        // A: gpu_load=3, inflight=1 => 4; B: gpu_load=0, inflight=0 => 0
        let backends = vec![snap(1, 0.0, 3), snap(0, 0.0, 0)];
        let (chosen, _) = select(&backends, &Strategy::LeastLoad, 0);
        assert_eq!(chosen, 1);
    }

    #[test]
    fn ties_are_spread_by_rotation_index() {
        let backends = vec![snap(0, 10.0, 0), snap(0, 10.0, 0), snap(0, 10.0, 0)];
        let (i0, idx) = select(&backends, &Strategy::LeastLatency, 0);
        let (i1, idx) = select(&backends, &Strategy::LeastLatency, idx);
        let (i2, _) = select(&backends, &Strategy::LeastLatency, idx);
        assert_eq!([i0, i1, i2], [0, 1, 2]);
    }

    #[test]
    fn unknown_strategy_falls_back_to_first_backend_without_advancing_index() {
        let backends = vec![snap(0, 0.0, 0), snap(0, 0.0, 0)];
        let (chosen, next) = select(&backends, &Strategy::Unknown("bogus".to_string()), 5);
        assert_eq!(chosen, 0);
        assert_eq!(next, 5);
    }
}
