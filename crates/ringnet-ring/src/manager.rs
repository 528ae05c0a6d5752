//! Ring manager: opens, resizes and shuts down the set of rings
//!
//! There is no process-wide manager; whoever serves connections creates
//! one and shares it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use ringnet_core::{Error, Result};

use crate::balance::{LoadBalance, RoundRobin};
use crate::config::{default_num_loops, RingConfig};
use crate::ring::Ring;

pub struct RingManager {
    config: RingConfig,
    /// Serializes resize/shutdown; readers go through the balancer
    rings: Mutex<Vec<Arc<Ring>>>,
    balance: RoundRobin<Ring>,
    next_id: AtomicUsize,
    me: Weak<RingManager>,
}

impl RingManager {
    /// Open `num_loops` rings and put them in rotation
    pub fn new(num_loops: usize, config: RingConfig) -> Result<Arc<RingManager>> {
        if num_loops < 1 {
            return Err(Error::InvalidNumLoops(num_loops));
        }
        let manager = Arc::new_cyclic(|me| RingManager {
            config,
            rings: Mutex::new(Vec::new()),
            balance: RoundRobin::default(),
            next_id: AtomicUsize::new(0),
            me: me.clone(),
        });
        manager.resize(num_loops)?;
        Ok(manager)
    }

    /// `RINGNET_NUM_LOOPS` rings (or the CPU-derived default) with env config
    pub fn from_env() -> Result<Arc<RingManager>> {
        Self::new(default_num_loops(), RingConfig::from_env())
    }

    /// Ring for the next connection
    pub fn pick(&self) -> Result<Arc<Ring>> {
        self.balance.pick().ok_or(Error::NoRings)
    }

    /// Rings in rotation
    pub fn num_loops(&self) -> usize {
        self.balance.len()
    }

    /// Snapshot of the rings in rotation
    pub fn rings(&self) -> Vec<Arc<Ring>> {
        self.rings.lock().clone()
    }

    /// Grow or shrink to `num_loops` rings.
    ///
    /// Shrinking takes rings out of rotation first and then closes them
    /// gracefully; their connections keep working until they close.
    pub fn resize(&self, num_loops: usize) -> Result<()> {
        if num_loops < 1 {
            return Err(Error::InvalidNumLoops(num_loops));
        }
        let mut rings = self.rings.lock();
        let current = rings.len();

        if num_loops < current {
            let dropped = rings.split_off(num_loops);
            self.balance.rebalance(rings.clone());
            for ring in &dropped {
                ring.close();
            }
            info!(from = current, to = num_loops, "manager: shrank");
            return Ok(());
        }

        while rings.len() < num_loops {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match Ring::open(id, self.config.clone()) {
                Ok(ring) => {
                    self.install_failure_hook(&ring);
                    rings.push(ring);
                }
                Err(e) => {
                    error!(ring = id, error = %e, "manager: failed to open ring");
                    // keep what already works in rotation
                    self.balance.rebalance(rings.clone());
                    return Err(e);
                }
            }
        }
        self.balance.rebalance(rings.clone());
        if num_loops != current {
            info!(from = current, to = num_loops, "manager: grew");
        }
        Ok(())
    }

    /// Close every ring gracefully and empty the rotation
    pub fn shutdown(&self) {
        let mut rings = self.rings.lock();
        self.balance.rebalance(Vec::new());
        for ring in rings.drain(..) {
            ring.close();
        }
        info!("manager: shut down");
    }

    fn install_failure_hook(&self, ring: &Arc<Ring>) {
        let me = self.me.clone();
        ring.set_failure_hook(Box::new(move |id| {
            if let Some(manager) = me.upgrade() {
                manager.remove_failed(id);
            }
        }));
    }

    fn remove_failed(&self, id: usize) {
        let mut rings = self.rings.lock();
        let before = rings.len();
        rings.retain(|ring| ring.id() != id);
        if rings.len() != before {
            self.balance.rebalance(rings.clone());
            warn!(ring = id, remaining = rings.len(), "manager: removed failed ring");
        }
    }
}

impl std::fmt::Debug for RingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingManager")
            .field("num_loops", &self.num_loops())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingState;

    fn try_manager(n: usize) -> Option<Arc<RingManager>> {
        match RingManager::new(n, RingConfig::from_env().sq_entries(64)) {
            Ok(m) => Some(m),
            Err(e) => {
                eprintln!("skipping: io_uring unavailable ({})", e);
                None
            }
        }
    }

    #[test]
    fn test_zero_loops_rejected() {
        assert_eq!(
            RingManager::new(0, RingConfig::from_env()).unwrap_err(),
            Error::InvalidNumLoops(0)
        );
    }

    #[test]
    fn test_pick_round_robin() {
        let Some(manager) = try_manager(3) else { return };
        let ids: Vec<usize> = (0..6).map(|_| manager.pick().unwrap().id()).collect();
        assert_eq!(&ids[..3], &ids[3..]);
        let mut distinct = ids[..3].to_vec();
        distinct.sort_unstable();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
        manager.shutdown();
    }

    #[test]
    fn test_resize_grow_and_shrink() {
        let Some(manager) = try_manager(1) else { return };
        assert_eq!(manager.resize(0), Err(Error::InvalidNumLoops(0)));

        manager.resize(3).unwrap();
        assert_eq!(manager.num_loops(), 3);

        let dropped = manager.rings()[1..].to_vec();
        manager.resize(1).unwrap();
        assert_eq!(manager.num_loops(), 1);
        for ring in &dropped {
            ring.join();
            assert_eq!(ring.state(), RingState::Closed);
        }

        let kept = manager.pick().unwrap();
        assert!(kept.is_running());
        manager.shutdown();
        assert_eq!(manager.pick().unwrap_err(), Error::NoRings);
        kept.join();
    }
}
