//! Stats (C13): lock-free counters for allowed/blocked calls, unique
//! blocked tool tracking, and rate derivation.
//!
//! Grounded in the proxy crate's `AtomicMetrics` (atomic counters + a
//! point-in-time `snapshot()`); extended here with a bounded set of unique
//! blocked tool names rather than raw byte/latency counters, matching what
//! the policy pipeline actually needs to report.

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Lock-free counters for the blocklist/policy pipeline.
pub struct Stats {
    allowed: AtomicU64,
    blocked: AtomicU64,
    blocked_tools: DashSet<String>,
    started_at: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            blocked_tools: DashSet::new(),
            started_at: Instant::now(),
        }
    }

    pub fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self, qualified_tool: &str) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
        self.blocked_tools.insert(qualified_tool.to_string());
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let blocked = self.blocked.load(Ordering::Relaxed);
        let total = allowed + blocked;
        let uptime_secs = self.started_at.elapsed().as_secs_f64().max(f64::EPSILON);
        StatsSnapshot {
            allowed,
            blocked,
            unique_blocked_tools: self.blocked_tools.len() as u64,
            block_rate: if total == 0 { 0.0 } else { blocked as f64 / total as f64 },
            calls_per_second: total as f64 / uptime_secs,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot, serializable for a dashboard or CLI surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub allowed: u64,
    pub blocked: u64,
    pub unique_blocked_tools: u64,
    pub block_rate: f64,
    pub calls_per_second: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_rate_derives_from_counters() {
        let stats = Stats::new();
        stats.record_allowed();
        stats.record_allowed();
        stats.record_blocked("demo:shell");
        let snap = stats.snapshot();
        assert_eq!(snap.allowed, 2);
        assert_eq!(snap.blocked, 1);
        assert!((snap.block_rate - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn unique_blocked_tools_deduplicates() {
        let stats = Stats::new();
        stats.record_blocked("demo:shell");
        stats.record_blocked("demo:shell");
        stats.record_blocked("demo:other");
        assert_eq!(stats.snapshot().unique_blocked_tools, 2);
    }

    #[test]
    fn zero_calls_has_zero_block_rate() {
        let stats = Stats::new();
        assert_eq!(stats.snapshot().block_rate, 0.0);
    }
}
