//! Barrier (spec §4.4 "Barrier").
//!
//! Built on this crate's own [`Mutex`] and [`Cond`], the same way the spec's
//! pseudocode for `reach` reads: "increment arrived counter; if < N, wait on
//! an internal cond; if == N, reset counter and broadcast." A generation
//! counter distinguishes one cycle's broadcast from the next, so a fiber that
//! calls `reach` again before every earlier waiter has woken up can't be
//! mistaken for having already cleared the barrier it just joined.

use crate::error::Result;
use crate::sync::cond::Cond;
use crate::sync::mutex::Mutex;

/// How a fiber's call to [`Barrier::reach`] compared to its peers, for
/// diagnostics (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierArrival {
    /// The first fiber to reach this cycle of the barrier.
    Headlight,
    /// The fiber whose arrival completed this cycle (released everyone).
    Taillight,
    /// Neither first nor last.
    Nop,
}

struct State {
    arrived: u32,
    generation: u64,
}

pub struct Barrier {
    count: u32,
    state: Mutex<State>,
    cond: Cond,
}

impl Barrier {
    pub fn new(count: u32) -> Self {
        assert!(count > 0, "a barrier must expect at least one arrival");
        Barrier {
            count,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
            }),
            cond: Cond::new(),
        }
    }

    /// Blocks until `count` fibers (across all of them) have called `reach`
    /// for the current cycle, then releases all of them together and starts
    /// the next cycle.
    pub fn reach(&self) -> Result<BarrierArrival> {
        let mut guard = self.state.lock()?;
        let my_generation = guard.generation;
        guard.arrived += 1;

        let result = if guard.arrived == self.count {
            BarrierArrival::Taillight
        } else if guard.arrived == 1 {
            BarrierArrival::Headlight
        } else {
            BarrierArrival::Nop
        };

        if guard.arrived == self.count {
            guard.arrived = 0;
            guard.generation += 1;
            drop(guard);
            self.cond.notify_all();
        } else {
            while guard.generation == my_generation {
                guard = self.cond.wait(guard)?;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::scheduler;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn reset() {
        scheduler::kill();
        scheduler::init(RuntimeConfig::default());
    }

    #[test]
    fn five_fibers_release_together_with_one_taillight() {
        reset();
        let barrier = Rc::new(Barrier::new(5));
        let results = Rc::new(RefCell::new(Vec::new()));

        for n in 0..4 {
            let b = barrier.clone();
            let r = results.clone();
            scheduler::spawn_fiber(
                format!("peer-{n}"),
                crate::priority_queue::PRIO_MIN,
                64 * 1024,
                Box::new(move || {
                    let arrival = b.reach().unwrap();
                    r.borrow_mut().push(arrival);
                }),
                false,
            );
        }

        for _ in 0..8 {
            scheduler::yield_now();
        }
        assert_eq!(results.borrow().len(), 4);

        let last = barrier.reach().unwrap();
        results.borrow_mut().push(last);

        let taillights = results.borrow().iter().filter(|a| **a == BarrierArrival::Taillight).count();
        let headlights = results.borrow().iter().filter(|a| **a == BarrierArrival::Headlight).count();
        assert_eq!(taillights, 1);
        assert_eq!(headlights, 1);
        scheduler::kill();
    }
}
