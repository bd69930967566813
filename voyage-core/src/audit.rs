use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::product::AvailabilityKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Reserve,
    Release,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOperation::Reserve => "reserve",
            AuditOperation::Release => "release",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reserve" => Some(AuditOperation::Reserve),
            "release" => Some(AuditOperation::Release),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Release applied fewer units than requested.
    Clamped,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Clamped => "clamped",
            AuditOutcome::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditOutcome::Success),
            "clamped" => Some(AuditOutcome::Clamped),
            "failure" => Some(AuditOutcome::Failure),
            _ => None,
        }
    }
}

/// What triggered a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AuditCause {
    Direct,
    Checkout(Uuid),
    Cancellation(Uuid),
    Refund(Uuid),
}

impl fmt::Display for AuditCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCause::Direct => f.write_str("direct"),
            AuditCause::Checkout(cart_id) => write!(f, "checkout:{}", cart_id),
            AuditCause::Cancellation(order_id) => write!(f, "cancel:{}", order_id),
            AuditCause::Refund(order_id) => write!(f, "refund:{}", order_id),
        }
    }
}

impl AuditCause {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "direct" {
            return Some(AuditCause::Direct);
        }
        let (tag, id) = s.split_once(':')?;
        let id = Uuid::parse_str(id).ok()?;
        match tag {
            "checkout" => Some(AuditCause::Checkout(id)),
            "cancel" => Some(AuditCause::Cancellation(id)),
            "refund" => Some(AuditCause::Refund(id)),
            _ => None,
        }
    }
}

/// Append-only record of one reserve or release attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub operation: AuditOperation,
    pub key: AvailabilityKey,
    pub requested: i32,
    pub applied: i32,
    pub remaining: Option<i32>,
    pub outcome: AuditOutcome,
    pub reason: Option<String>,
    pub cause: AuditCause,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    fn base(
        operation: AuditOperation,
        key: AvailabilityKey,
        requested: i32,
        cause: AuditCause,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id: Uuid::new_v4(),
            operation,
            key,
            requested,
            applied: 0,
            remaining: None,
            outcome: AuditOutcome::Failure,
            reason: None,
            cause,
            created_at: Utc::now(),
        }
    }

    pub fn success(
        operation: AuditOperation,
        key: AvailabilityKey,
        requested: i32,
        remaining: i32,
        cause: AuditCause,
    ) -> Self {
        Self {
            applied: requested,
            remaining: Some(remaining),
            outcome: AuditOutcome::Success,
            ..Self::base(operation, key, requested, cause)
        }
    }

    pub fn clamped(
        key: AvailabilityKey,
        requested: i32,
        applied: i32,
        remaining: i32,
        cause: AuditCause,
    ) -> Self {
        Self {
            applied,
            remaining: Some(remaining),
            outcome: AuditOutcome::Clamped,
            reason: Some(format!("release clamped from {} to {}", requested, applied)),
            ..Self::base(AuditOperation::Release, key, requested, cause)
        }
    }

    pub fn failure(
        operation: AuditOperation,
        key: AvailabilityKey,
        requested: i32,
        reason: impl Into<String>,
        cause: AuditCause,
    ) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::base(operation, key, requested, cause)
        }
    }

    pub fn with_operation_id(mut self, operation_id: Uuid) -> Self {
        self.operation_id = operation_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::ProductKind;

    #[test]
    fn test_cause_rendering() {
        let id = Uuid::nil();
        assert_eq!(AuditCause::Direct.to_string(), "direct");
        assert_eq!(
            AuditCause::Refund(id).to_string(),
            "refund:00000000-0000-0000-0000-000000000000"
        );

        let checkout = AuditCause::Checkout(Uuid::new_v4());
        assert_eq!(AuditCause::parse(&checkout.to_string()), Some(checkout));
        assert_eq!(AuditCause::parse("restock:abc"), None);
    }

    #[test]
    fn test_failure_entry_applies_nothing() {
        let key = AvailabilityKey::new(ProductKind::Flight, 3);
        let entry = AuditEntry::failure(
            AuditOperation::Reserve,
            key,
            4,
            "insufficient stock",
            AuditCause::Direct,
        );
        assert_eq!(entry.outcome, AuditOutcome::Failure);
        assert_eq!(entry.applied, 0);
        assert_eq!(entry.remaining, None);
    }
}
