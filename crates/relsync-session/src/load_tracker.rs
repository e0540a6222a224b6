//! Lazy-load tracking and N+1 detection.
//!
//! Every Incomplete → Complete transition of a virtual end-point costs one
//! round trip to the persistence collaborator. Touching the same relation on
//! many objects one at a time (`for order in orders { order.items }`) is the
//! classic N+1 pattern; the tracker counts loads per relation and warns once
//! the count reaches the configured threshold.

use std::collections::BTreeMap;

use relsync_core::RelationEndPointId;
use serde::{Deserialize, Serialize};

/// How many end-point ids are kept per relation for the warning details.
const RECENT_END_POINTS: usize = 5;

/// Counts lazy loads of virtual end-points.
#[derive(Debug, Clone)]
pub struct LoadTracker {
    /// (class, property) -> load count
    relation_counts: BTreeMap<(String, String), usize>,
    /// end-point -> load count
    end_point_counts: BTreeMap<RelationEndPointId, usize>,
    /// (class, property) -> first few end-points that were loaded
    recent: BTreeMap<(String, String), Vec<RelationEndPointId>>,
    threshold: usize,
    enabled: bool,
}

impl Default for LoadTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about lazy loads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LazyLoadStats {
    /// Total number of lazy loads recorded.
    pub total_loads: usize,
    /// Number of distinct relations loaded.
    pub relations_loaded: usize,
    /// Number of relations that reached the threshold.
    pub potential_n_plus_one: usize,
}

impl LoadTracker {
    /// Create a tracker with the default threshold (3).
    #[must_use]
    pub fn new() -> Self {
        Self {
            relation_counts: BTreeMap::new(),
            end_point_counts: BTreeMap::new(),
            recent: BTreeMap::new(),
            threshold: 3,
            enabled: true,
        }
    }

    /// Set the warning threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Current threshold.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether loads are recorded.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Stop recording loads.
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Resume recording loads.
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Record one lazy load of `end_point`.
    pub fn record_load(&mut self, end_point: &RelationEndPointId) {
        if !self.enabled {
            return;
        }

        *self.end_point_counts.entry(end_point.clone()).or_insert(0) += 1;

        let key = (
            end_point.object_id().class_id().to_string(),
            end_point.property_name().to_string(),
        );
        let recent = self.recent.entry(key.clone()).or_default();
        if recent.len() < RECENT_END_POINTS {
            recent.push(end_point.clone());
        }
        let count = self.relation_counts.entry(key.clone()).or_insert(0);
        *count += 1;

        if *count == self.threshold {
            let count = *count;
            self.emit_warning(&key, count);
        }
    }

    fn emit_warning(&self, key: &(String, String), count: usize) {
        tracing::warn!(
            target: "relsync::lazy_load",
            class = %key.0,
            relation = %key.1,
            loads = count,
            threshold = self.threshold,
            "N+1 load pattern detected: relation loaded once per object"
        );

        for (index, end_point) in self.recent.get(key).into_iter().flatten().enumerate() {
            tracing::debug!(
                target: "relsync::lazy_load",
                index,
                end_point = %end_point,
                "  [{}] {}",
                index,
                end_point
            );
        }
    }

    /// Forget all counts.
    pub fn reset(&mut self) {
        self.relation_counts.clear();
        self.end_point_counts.clear();
        self.recent.clear();
    }

    /// Loads recorded for one relation (class, property).
    #[must_use]
    pub fn count_for(&self, class_id: &str, property_name: &str) -> usize {
        self.relation_counts
            .get(&(class_id.to_string(), property_name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Loads recorded for one end-point.
    #[must_use]
    pub fn count_for_end_point(&self, end_point: &RelationEndPointId) -> usize {
        self.end_point_counts.get(end_point).copied().unwrap_or(0)
    }

    /// Summary statistics.
    #[must_use]
    pub fn stats(&self) -> LazyLoadStats {
        LazyLoadStats {
            total_loads: self.relation_counts.values().sum(),
            relations_loaded: self.relation_counts.len(),
            potential_n_plus_one: self
                .relation_counts
                .values()
                .filter(|count| **count >= self.threshold)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relsync_core::ObjectId;

    fn orders_of(key: i64) -> RelationEndPointId {
        RelationEndPointId::new(ObjectId::new("Customer", key), "orders")
    }

    #[test]
    fn test_tracker_new_defaults() {
        let tracker = LoadTracker::new();
        assert_eq!(tracker.threshold(), 3);
        assert!(tracker.is_enabled());
    }

    #[test]
    fn test_tracker_counts_per_relation_and_end_point() {
        let mut tracker = LoadTracker::new().with_threshold(10);
        tracker.record_load(&orders_of(1));
        tracker.record_load(&orders_of(2));
        tracker.record_load(&orders_of(2));
        assert_eq!(tracker.count_for("Customer", "orders"), 3);
        assert_eq!(tracker.count_for_end_point(&orders_of(2)), 2);
        assert_eq!(tracker.count_for("Customer", "invoices"), 0);
    }

    #[test]
    fn test_tracker_disabled_no_recording() {
        let mut tracker = LoadTracker::new();
        tracker.disable();
        tracker.record_load(&orders_of(1));
        assert_eq!(tracker.count_for("Customer", "orders"), 0);
        tracker.enable();
        tracker.record_load(&orders_of(1));
        assert_eq!(tracker.count_for("Customer", "orders"), 1);
    }

    #[test]
    fn test_stats_potential_n_plus_one() {
        let mut tracker = LoadTracker::new().with_threshold(2);
        tracker.record_load(&orders_of(1));
        tracker.record_load(&orders_of(2));
        tracker.record_load(&RelationEndPointId::new(ObjectId::new("Person", 1), "computer"));

        let stats = tracker.stats();
        assert_eq!(stats.total_loads, 3);
        assert_eq!(stats.relations_loaded, 2);
        assert_eq!(stats.potential_n_plus_one, 1);
    }

    #[test]
    fn test_reset_clears_counts() {
        let mut tracker = LoadTracker::new();
        tracker.record_load(&orders_of(1));
        tracker.reset();
        assert_eq!(tracker.stats(), LazyLoadStats::default());
    }
}
