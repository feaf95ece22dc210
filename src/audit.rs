//! Audit & trace (C11): a bounded, append-only audit ring plus a bounded
//! FIFO trace buffer, with tap points the policy/dispatch/transport layers
//! write into. Durable mirroring is behind a small `AuditSink` trait so the
//! core never depends on a concrete storage backend (out of scope per the
//! system's purpose).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// One audit record: who did what, to which backend, under which decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: u64,
    pub user_id: String,
    pub agent_id: String,
    pub server_id: String,
    pub method: String,
    pub capability: String,
    pub session_id: Option<String>,
    pub transport: String,
    pub details: serde_json::Value,
}

/// A tap point the transport/dispatch pipeline emits, independent of the
/// audit trail: used for debugging fan-out partial failures and policy
/// decisions without the access-control framing of an `AuditEntry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub time: u64,
    pub stage: TraceStage,
    pub server: String,
    pub method: String,
    pub transport: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStage {
    Discovery,
    Blocklist,
    Translate,
    Forward,
    Response,
}

/// Durable mirror for audit entries. The default `NullSink` drops
/// everything; a host embedding this core supplies its own implementation
/// (append-only file, database, etc.) — persistent storage is explicitly
/// out of scope for the core itself.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

pub struct NullSink;

impl AuditSink for NullSink {
    fn record(&self, _entry: &AuditEntry) {}
}

/// Bounded, append-only audit ring buffer, optionally mirrored to a
/// `AuditSink`.
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
    sink: Box<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self::with_sink(capacity, Box::new(NullSink))
    }

    pub fn with_sink(capacity: usize, sink: Box<dyn AuditSink>) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            sink,
        }
    }

    pub fn record(
        &self,
        user_id: impl Into<String>,
        agent_id: impl Into<String>,
        server_id: impl Into<String>,
        method: impl Into<String>,
        capability: impl Into<String>,
        session_id: Option<String>,
        transport: impl Into<String>,
        details: serde_json::Value,
    ) {
        let entry = AuditEntry {
            timestamp: now_unix(),
            user_id: user_id.into(),
            agent_id: agent_id.into(),
            server_id: server_id.into(),
            method: method.into(),
            capability: capability.into(),
            session_id,
            transport: transport.into(),
            details,
        };
        self.sink.record(&entry);
        let mut guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let guard = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded FIFO trace buffer for stage-by-stage request tracing.
pub struct TraceLog {
    capacity: usize,
    events: Mutex<VecDeque<TraceEvent>>,
}

impl TraceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn push(
        &self,
        stage: TraceStage,
        server: impl Into<String>,
        method: impl Into<String>,
        transport: impl Into<String>,
        detail: impl Into<String>,
        attachment: Option<serde_json::Value>,
    ) {
        let event = TraceEvent {
            time: now_unix(),
            stage,
            server: server.into(),
            method: method.into(),
            transport: transport.into(),
            detail: detail.into(),
            attachment,
        };
        let mut guard = self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(event);
    }

    pub fn recent(&self, limit: usize) -> Vec<TraceEvent> {
        let guard = self.events.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.iter().rev().take(limit).cloned().collect()
    }
}
