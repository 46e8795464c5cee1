//! Operator-facing notifications derived from run outcomes.
//!
//! The sync engine never presents anything itself; it hands a
//! [`Notification`] to whatever [`Notifier`] the shell installed.

use serde::Serialize;

use crate::types::{RunOutcome, SyncReport, SyncTrigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl Notification {
    fn new(severity: Severity, title: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.to_string(),
            message: message.into(),
        }
    }

    /// The single notification a run reports, if any.
    ///
    /// Periodic runs never notify.
    pub fn for_run(trigger: SyncTrigger, outcome: &RunOutcome) -> Option<Self> {
        if !trigger.is_manual() {
            return None;
        }
        Some(match outcome {
            RunOutcome::Suppressed => Self::new(
                Severity::Warning,
                "Sync in progress",
                "A synchronization is already running.",
            ),
            RunOutcome::Offline => Self::new(
                Severity::Error,
                "Synchronization failed",
                "No Internet, Will Sync Later When Internet is Back!",
            ),
            RunOutcome::NoSession => Self::new(
                Severity::Error,
                "Synchronization failed",
                "No user is logged in on this till.",
            ),
            RunOutcome::Completed(report) if report.is_partial() => {
                Self::new(Severity::Warning, "Sync Partially Complete", partial_message(report))
            }
            RunOutcome::Completed(_) => Self::new(Severity::Success, "Synchronized!", "Uploaded/Downloaded"),
            RunOutcome::Failed(error) => Self::new(Severity::Error, "Could Not Sync!", error.clone()),
        })
    }
}

fn partial_message(report: &SyncReport) -> String {
    format!(
        "Successfully synced {} invoices and {} balances. Failed to sync {} invoices and {} balances.",
        report.invoices.success_count,
        report.balances.success_count,
        report.invoices.fail_count,
        report.balances.fail_count,
    )
}

/// Presentation sink for notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Default sink: writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        match n.severity {
            Severity::Success => tracing::info!(title = %n.title, "{}", n.message),
            Severity::Warning => tracing::warn!(title = %n.title, "{}", n.message),
            Severity::Error => tracing::error!(title = %n.title, "{}", n.message),
        }
    }
}
