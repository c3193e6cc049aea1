// Lazy cleanup of the in-process maps. No timers; the admission middleware drives it.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::clock::SharedClock;

// A store whose stale entries can be dropped in bulk.
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    // Drops everything expired at `now_ms` and returns how many entries went.
    fn sweep(&self, now_ms: u64) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepTrigger {
    // Sweep with probability `p` on each request.
    Probabilistic(f64),
    // Sweep on every n-th request.
    EveryNth(u64),
    Never,
}

impl Default for SweepTrigger {
    fn default() -> Self {
        SweepTrigger::Probabilistic(0.01)
    }
}

pub struct LazySweeper {
    trigger: SweepTrigger,
    requests: AtomicU64,
    targets: Vec<Arc<dyn Sweep>>,
    clock: SharedClock,
}

impl fmt::Debug for LazySweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.targets.iter().map(|t| t.name()).collect();
        f.debug_struct("LazySweeper")
            .field("trigger", &self.trigger)
            .field("targets", &names)
            .finish()
    }
}

impl LazySweeper {
    pub fn new(trigger: SweepTrigger, clock: SharedClock) -> Self {
        Self {
            trigger,
            requests: AtomicU64::new(0),
            targets: Vec::new(),
            clock,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn Sweep>) -> Self {
        self.targets.push(target);
        self
    }

    fn due(&self) -> bool {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        match self.trigger {
            SweepTrigger::Probabilistic(p) => p > 0.0 && rand::thread_rng().gen_bool(p.min(1.0)),
            SweepTrigger::EveryNth(every) => every > 0 && n % every == 0,
            SweepTrigger::Never => false,
        }
    }

    // Returns the number of evicted entries when a sweep ran.
    pub fn on_request(&self) -> Option<usize> {
        if !self.due() {
            return None;
        }
        Some(self.sweep_now())
    }

    pub fn sweep_now(&self) -> usize {
        let now = self.clock.now_ms();
        let mut total = 0;
        for target in &self.targets {
            let removed = target.sweep(now);
            if removed > 0 {
                debug!(store = target.name(), removed, "sweep evicted stale entries");
            }
            total += removed;
        }
        total
    }
}
