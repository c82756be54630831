use coarsetime::{Duration, Instant};

/// Bounds a single walk over guest structures.
///
/// Every loop over guest data consumes one iteration per element. Once the iteration cap
/// or the time limit is reached the walk stops and returns what it collected so far with
/// [`WalkStatus::Exhausted`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WalkBudget {
    pub max_iterations: usize,
    pub time_limit: Option<Duration>,
}

impl WalkBudget {
    pub const fn iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            time_limit: None,
        }
    }

    pub fn with_time_limit(mut self, limit: std::time::Duration) -> Self {
        self.time_limit = Some(Duration::from_millis(limit.as_millis() as u64));
        self
    }

    /// Starts tracking a new walk against this budget.
    pub fn start(&self) -> BudgetTracker {
        BudgetTracker {
            remaining: self.max_iterations,
            deadline: self.time_limit.map(|limit| Instant::now() + limit),
        }
    }
}

/// The running state of a [`WalkBudget`].
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    remaining: usize,
    deadline: Option<Instant>,
}

impl BudgetTracker {
    /// Consumes one iteration, returns false once the budget is used up.
    pub fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.remaining = 0;
                return false;
            }
        }
        self.remaining -= 1;
        true
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Budgets of the individual walks.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WalkBudgets {
    /// entries of the task list
    pub tasks: WalkBudget,
    /// memory areas per process, separately also caps the maple nodes visited
    pub vmas: WalkBudget,
    /// descriptor slots per process
    pub fds: WalkBudget,
    /// nesting of maple tree nodes
    pub maple_depth: usize,
}

impl Default for WalkBudgets {
    fn default() -> Self {
        Self {
            tasks: WalkBudget::iterations(10_000),
            vmas: WalkBudget::iterations(4096),
            fds: WalkBudget::iterations(1024),
            maple_depth: 31,
        }
    }
}

/// How a walk over a guest structure ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum WalkStatus {
    /// The structure was walked to its natural end.
    Complete,
    /// The iteration or time budget ran out, the result is partial.
    Exhausted,
    /// An already visited element was reached again.
    Cycle,
    /// An element could not be read or failed validation, the result is partial.
    Broken,
}

impl WalkStatus {
    /// Returns true if the walk may have missed elements.
    pub fn is_partial(self) -> bool {
        !matches!(self, WalkStatus::Complete)
    }

    /// Combines the status of two walks over parts of the same structure.
    pub fn merge(self, other: WalkStatus) -> WalkStatus {
        use WalkStatus::*;
        match (self, other) {
            (Exhausted, _) | (_, Exhausted) => Exhausted,
            (Broken, _) | (_, Broken) => Broken,
            (Cycle, _) | (_, Cycle) => Cycle,
            _ => Complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time;

    #[test]
    fn test_iteration_cap() {
        let mut tracker = WalkBudget::iterations(3).start();
        assert!(tracker.tick());
        assert!(tracker.tick());
        assert!(tracker.tick());
        assert!(!tracker.tick());
        assert_eq!(tracker.remaining(), 0);
    }

    #[test]
    fn test_time_limit() {
        let budget =
            WalkBudget::iterations(usize::MAX).with_time_limit(time::Duration::from_millis(0));
        let mut tracker = budget.start();
        std::thread::sleep(time::Duration::from_millis(20));
        Instant::update();
        assert!(!tracker.tick());
    }

    #[test]
    fn test_merge() {
        assert_eq!(
            WalkStatus::Complete.merge(WalkStatus::Broken),
            WalkStatus::Broken
        );
        assert_eq!(
            WalkStatus::Cycle.merge(WalkStatus::Exhausted),
            WalkStatus::Exhausted
        );
        assert!(!WalkStatus::Complete.merge(WalkStatus::Complete).is_partial());
    }
}
