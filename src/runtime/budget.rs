//! Per-cell budget tracker.
//!
//! Process-local spend accounting with two thresholds: a lifetime ceiling
//! and a rolling one-hour ceiling. The runtime pauses the cell once either
//! is reached.

use chrono::{DateTime, Duration, Utc};

use crate::domain::models::CellBudget;

/// Entries older than this fall out of the hourly window.
const WINDOW: Duration = Duration::seconds(3600);

#[derive(Debug)]
pub struct BudgetTracker {
    max_total_cost: Option<f64>,
    max_cost_per_hour: Option<f64>,
    entries: Vec<(DateTime<Utc>, f64)>,
    total: f64,
}

impl BudgetTracker {
    pub fn new(budget: Option<&CellBudget>) -> Self {
        Self {
            max_total_cost: budget.map(|b| b.max_total_cost),
            max_cost_per_hour: budget.and_then(|b| b.max_cost_per_hour),
            entries: Vec::new(),
            total: 0.0,
        }
    }

    /// Unlimited tracker (still counts, never trips).
    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn add_cost(&mut self, cost: f64) {
        self.add_cost_at(Utc::now(), cost);
    }

    fn add_cost_at(&mut self, at: DateTime<Utc>, cost: f64) {
        self.entries.push((at, cost));
        self.total += cost;
        self.prune(at);
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - WINDOW;
        self.entries.retain(|(at, _)| *at > cutoff);
    }

    pub fn total_cost(&self) -> f64 {
        self.total
    }

    /// Spend inside the rolling one-hour window.
    pub fn hourly_cost(&self) -> f64 {
        let cutoff = Utc::now() - WINDOW;
        self.entries
            .iter()
            .filter(|(at, _)| *at > cutoff)
            .map(|(_, cost)| cost)
            .sum()
    }

    pub fn is_exceeded(&self) -> bool {
        if self.max_total_cost.is_some_and(|cap| self.total >= cap) {
            return true;
        }
        self.max_cost_per_hour.is_some_and(|cap| self.hourly_cost() >= cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(total: f64, hourly: Option<f64>) -> CellBudget {
        CellBudget { max_total_cost: total, max_cost_per_hour: hourly }
    }

    #[test]
    fn test_lifetime_threshold() {
        let b = budget(1.0, None);
        let mut tracker = BudgetTracker::new(Some(&b));
        tracker.add_cost(0.5);
        assert!(!tracker.is_exceeded());
        tracker.add_cost(0.5);
        assert!(tracker.is_exceeded());
    }

    #[test]
    fn test_hourly_threshold_ignores_old_entries() {
        let b = budget(100.0, Some(1.0));
        let mut tracker = BudgetTracker::new(Some(&b));

        // An entry from two hours ago is outside the window.
        tracker.add_cost_at(Utc::now() - Duration::seconds(7200), 5.0);
        tracker.add_cost(0.5);

        assert!(tracker.hourly_cost() < 1.0);
        assert!(!tracker.is_exceeded());
        // Lifetime total still counts the old spend.
        assert!((tracker.total_cost() - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_unlimited_never_trips() {
        let mut tracker = BudgetTracker::unlimited();
        tracker.add_cost(1_000_000.0);
        assert!(!tracker.is_exceeded());
    }
}
