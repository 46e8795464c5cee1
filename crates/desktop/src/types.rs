//! Shared types for the sync engine and its embedding shell.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tillsync_core::UniqueId;

use crate::sync_worker::SyncPhase;

/// Last known connectivity of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub online: bool,
    /// `None` until the first probe completes.
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl ConnectivityState {
    pub fn unknown() -> Self {
        Self {
            online: false,
            last_checked_at: None,
        }
    }
}

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    /// The operator pressed "sync now"; results are reported to them.
    SyncNow,
    /// The background timer; results are only logged.
    Periodic,
}

impl SyncTrigger {
    pub fn is_manual(&self) -> bool {
        matches!(self, SyncTrigger::SyncNow)
    }
}

/// An invoice created while offline, waiting for delivery.
///
/// The whole stored record is the delivery payload; only `uniqueID` is
/// interpreted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedInvoice {
    #[serde(rename = "uniqueID")]
    pub unique_id: UniqueId,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// A cash-balance record created while offline, waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedBalance {
    #[serde(rename = "uniqueID")]
    pub unique_id: UniqueId,
    #[serde(rename = "isActive", default, skip_serializing_if = "Option::is_none")]
    pub is_active: Option<Value>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl QueuedBalance {
    /// Only a balance whose `isActive` is the integer `1` is dropped once the
    /// server acknowledges it; anything else stays queued.
    pub fn retires_on_ack(&self) -> bool {
        matches!(&self.is_active, Some(Value::Number(n)) if n.as_i64() == Some(1))
    }
}

/// Per-batch delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success_count: usize,
    pub fail_count: usize,
}

/// Aggregated result of one orchestrated run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Products received by the delta fetch (0 when skipped).
    pub products_fetched: usize,
    pub invoices: SyncOutcome,
    pub balances: SyncOutcome,
    /// The roster no longer lists the logged-in user; they were logged out.
    pub current_user_revoked: bool,
}

impl SyncReport {
    pub fn failures(&self) -> usize {
        self.invoices.fail_count + self.balances.fail_count
    }

    pub fn is_partial(&self) -> bool {
        self.failures() > 0
    }
}

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_syncing: bool,
    /// When the last invoice delivery run finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_invoices: usize,
}

/// How an orchestrated run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "camelCase")]
pub enum RunOutcome {
    /// Another run was already in progress.
    Suppressed,
    /// Connectivity check failed; nothing was attempted.
    Offline,
    /// Nobody is logged in on this till.
    NoSession,
    Completed(SyncReport),
    /// The run aborted; carries the error message.
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn balance_retires_only_on_integer_one() {
        let balance = |active: Value| -> QueuedBalance {
            serde_json::from_value(json!({ "uniqueID": "b1", "isActive": active })).unwrap()
        };
        assert!(balance(json!(1)).retires_on_ack());
        assert!(!balance(json!("1")).retires_on_ack());
        assert!(!balance(json!(0)).retires_on_ack());
        assert!(!balance(json!(true)).retires_on_ack());

        let missing: QueuedBalance = serde_json::from_value(json!({ "uniqueID": "b2" })).unwrap();
        assert!(!missing.retires_on_ack());
    }

    #[test]
    fn queued_invoice_keeps_the_full_payload() {
        let raw = json!({ "uniqueID": "inv-1", "total": 12.5, "items": [{ "SID": 3 }] });
        let invoice: QueuedInvoice = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(invoice.unique_id.as_str(), "inv-1");
        assert_eq!(serde_json::to_value(&invoice).unwrap(), raw);
    }

    #[test]
    fn trigger_uses_wire_names() {
        assert_eq!(serde_json::to_value(SyncTrigger::SyncNow).unwrap(), json!("syncNow"));
        assert_eq!(
            serde_json::from_value::<SyncTrigger>(json!("periodic")).unwrap(),
            SyncTrigger::Periodic
        );
    }
}
