//! State-change notifications for the UI layer.

use crate::record::SubscriptionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Typed state-change notification emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LicenseNotification {
    /// The activation was torn down; the app must report "not activated".
    Disabled {
        revoked: bool,
        reason: Option<String>,
    },
    /// Subscription status changed without disabling the terminal.
    StatusChanged { status: SubscriptionStatus },
    /// Cancellation scheduled server-side; the app keeps running until
    /// the grace end date.
    CancelScheduled {
        grace_period_end: Option<DateTime<Utc>>,
    },
    /// Payment failed; the subscription is past due.
    PaymentRequired {
        grace_period_end: Option<DateTime<Utc>>,
        amount_due: Option<String>,
    },
    PaymentSucceeded { status: SubscriptionStatus },
    /// The license or subscription came back to life.
    Reactivated { plan_id: String },
    /// Plan changed server-side; reactivation required. A revocation
    /// event is expected to follow and performs the actual teardown.
    PlanChanged {
        new_plan_id: String,
        new_plan_name: Option<String>,
    },
    /// Advisory only: repeated heartbeat failures, activation unchanged.
    ConnectionIssue { consecutive_failures: u32 },
    /// The entitlement push stream (re)connected.
    StreamConnected,
}

/// Broadcast fan-out for license notifications. Subscribers that lag past
/// the channel capacity miss the oldest notifications, which is acceptable
/// for UI toasts.
pub struct Notifier {
    tx: broadcast::Sender<LicenseNotification>,
}

impl Notifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LicenseNotification> {
        self.tx.subscribe()
    }

    /// Emits a notification. Having no subscribers is not an error.
    pub fn emit(&self, notification: LicenseNotification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}
