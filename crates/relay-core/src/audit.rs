//! Security audit records.
//!
//! The connection pool appends one [`AuditRecord`] per security-relevant
//! decision. Records may name users, so they stay inside the process and are
//! never exported through aggregate metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bounded::{BoundedLog, EvictionPolicy};
use crate::ids::{ConnectionId, UserId};

/// Default number of audit records kept in memory.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

/// What an audit record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A connection was accessed with a user id that does not own it.
    OwnershipViolation,
    /// A connection registration was rejected by an admission cap.
    CapacityRejected,
    /// The reaper removed a stale or dead connection.
    ConnectionReaped,
}

impl AuditKind {
    /// Snake-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OwnershipViolation => "ownership_violation",
            Self::CapacityRejected => "capacity_rejected",
            Self::ConnectionReaped => "connection_reaped",
        }
    }
}

/// One audit entry.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    /// Monotonic sequence number within the log.
    pub sequence: u64,
    /// Record kind.
    pub kind: AuditKind,
    /// Connection involved.
    pub connection_id: ConnectionId,
    /// User id presented by the caller (not necessarily the owner).
    pub claimed_user: UserId,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Short free-form detail.
    pub detail: String,
}

/// Bounded in-memory audit log.
#[derive(Debug)]
pub struct AuditLog {
    records: BoundedLog<AuditRecord>,
    next_sequence: u64,
}

impl AuditLog {
    /// Create an audit log with the given capacity and overflow policy.
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            records: BoundedLog::new(capacity, policy),
            next_sequence: 0,
        }
    }

    /// Append a record and return its sequence number.
    pub fn record(
        &mut self,
        kind: AuditKind,
        connection_id: &ConnectionId,
        claimed_user: &UserId,
        detail: impl Into<String>,
    ) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let detail = detail.into();
        tracing::warn!(
            target: "relay::audit",
            kind = kind.as_str(),
            sequence,
            connection_id = %connection_id,
            claimed_user = %claimed_user,
            detail = %detail,
            "audit event"
        );
        self.records.push(AuditRecord {
            sequence,
            kind,
            connection_id: connection_id.clone(),
            claimed_user: claimed_user.clone(),
            timestamp: Utc::now(),
            detail,
        });
        sequence
    }

    /// Stored records, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.iter().cloned().collect()
    }

    /// Count stored records of one kind.
    pub fn count(&self, kind: AuditKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY, EvictionPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_sequenced() {
        let mut log = AuditLog::default();
        let conn = ConnectionId::from_raw("c1");
        let user = UserId::from_raw("mallory");
        let a = log.record(AuditKind::OwnershipViolation, &conn, &user, "get");
        let b = log.record(AuditKind::OwnershipViolation, &conn, &user, "remove");
        assert_eq!((a, b), (1, 2));
        assert_eq!(log.count(AuditKind::OwnershipViolation), 2);
        assert_eq!(log.records()[1].detail, "remove");
    }

    #[test]
    fn overflow_drops_oldest_half() {
        let mut log = AuditLog::new(4, EvictionPolicy::DropOldestHalf);
        let conn = ConnectionId::from_raw("c");
        let user = UserId::from_raw("u");
        for _ in 0..5 {
            let _ = log.record(AuditKind::CapacityRejected, &conn, &user, "");
        }
        let seqs: Vec<u64> = log.records().iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn kinds_serialize_snake_case() {
        let json = serde_json::to_string(&AuditKind::ConnectionReaped).unwrap();
        assert_eq!(json, r#""connection_reaped""#);
        assert_eq!(AuditKind::OwnershipViolation.as_str(), "ownership_violation");
    }
}
