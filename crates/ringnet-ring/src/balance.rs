//! Load balancing across rings
//!
//! The balancer's list is replaced wholesale on resize; readers load it
//! without locking, so `pick` stays cheap on the accept path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Chooses the ring a new connection lands on
pub trait LoadBalance<T>: Send + Sync {
    /// Next target, `None` when there is nothing to pick from
    fn pick(&self) -> Option<Arc<T>>;

    /// Replace the set of targets
    fn rebalance(&self, targets: Vec<Arc<T>>);

    /// Targets currently in rotation
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `targets[counter++ % len]`
pub struct RoundRobin<T> {
    targets: ArcSwap<Vec<Arc<T>>>,
    accepted: AtomicUsize,
}

impl<T> RoundRobin<T> {
    pub fn new(targets: Vec<Arc<T>>) -> Self {
        RoundRobin {
            targets: ArcSwap::from_pointee(targets),
            accepted: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the current rotation
    pub fn targets(&self) -> Arc<Vec<Arc<T>>> {
        self.targets.load_full()
    }
}

impl<T> Default for RoundRobin<T> {
    fn default() -> Self {
        RoundRobin::new(Vec::new())
    }
}

impl<T: Send + Sync> LoadBalance<T> for RoundRobin<T> {
    fn pick(&self) -> Option<Arc<T>> {
        let targets = self.targets.load();
        if targets.is_empty() {
            return None;
        }
        let index = self.accepted.fetch_add(1, Ordering::Relaxed) % targets.len();
        Some(Arc::clone(&targets[index]))
    }

    fn rebalance(&self, targets: Vec<Arc<T>>) {
        self.targets.store(Arc::new(targets));
    }

    fn len(&self) -> usize {
        self.targets.load().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    #[test]
    fn test_cycles_with_period_n() {
        let lb = RoundRobin::new((0..3).map(Arc::new).collect());
        let picks: Vec<i32> = (0..9).map(|_| *lb.pick().unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_empty_picks_nothing() {
        let lb: RoundRobin<u8> = RoundRobin::default();
        assert!(lb.pick().is_none());
        assert!(lb.is_empty());
    }

    #[test]
    fn test_rebalance_swaps_targets() {
        let lb = RoundRobin::new(vec![Arc::new('a'), Arc::new('b')]);
        lb.pick();
        lb.rebalance(vec![Arc::new('z')]);
        assert_eq!(lb.len(), 1);
        assert_eq!(*lb.pick().unwrap(), 'z');
        assert_eq!(*lb.pick().unwrap(), 'z');
    }

    #[test]
    fn test_concurrent_picks_are_even() {
        let lb = Arc::new(RoundRobin::new((0..4).map(Arc::new).collect()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = Arc::clone(&lb);
                thread::spawn(move || (0..1000).map(|_| *lb.pick().unwrap()).collect::<Vec<usize>>())
            })
            .collect();

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for h in handles {
            for target in h.join().unwrap() {
                *counts.entry(target).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&c| c == 1000));
    }
}
