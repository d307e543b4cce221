//! Entitlement event stream contract.
//!
//! The server pushes discrete entitlement-change events over a long-lived
//! connection keyed by `(license key, fingerprint hash, server base URL)`.
//! The transport implementation (SSE, WebSocket) lives outside this crate;
//! the engine consumes `StreamSignal`s from a channel and acknowledges
//! every delivered event. Delivery is at-least-once, so event application
//! must be idempotent.

use crate::error::LicenseResult;
use crate::record::SubscriptionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Connection state of the push channel, surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A pushed entitlement-change event. Ephemeral: processed once
/// (logically), acknowledged, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementEvent {
    pub id: String,
    #[serde(flatten)]
    pub change: EntitlementChange,
}

/// Event payloads, one shape per event type, exhaustively matched by the
/// engine's transition table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EntitlementChange {
    SubscriptionCancelled {
        #[serde(default)]
        cancel_immediately: bool,
        #[serde(default)]
        grace_period_end: Option<DateTime<Utc>>,
    },
    SubscriptionReactivated {
        subscription_status: SubscriptionStatus,
    },
    SubscriptionUpdated {
        #[serde(default)]
        should_disable: bool,
        subscription_status: SubscriptionStatus,
        #[serde(default)]
        trial_end: Option<DateTime<Utc>>,
    },
    SubscriptionPastDue {
        #[serde(default)]
        grace_period_end: Option<DateTime<Utc>>,
        #[serde(default)]
        amount_due: Option<String>,
    },
    SubscriptionPaymentSucceeded {
        subscription_status: SubscriptionStatus,
    },
    LicenseRevoked {
        #[serde(default)]
        reason: Option<String>,
    },
    LicenseReactivated {
        plan_id: String,
        features: Vec<String>,
    },
    PlanChanged {
        new_plan_id: String,
        #[serde(default)]
        new_plan_name: Option<String>,
    },
}

/// Processing verdict reported back for every delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Success,
    Failed,
    /// No active record existed to apply the event to.
    Skipped,
}

/// Acknowledgment for one delivered event. Delivery of the ack itself is
/// best-effort; a failed send never re-raises into the event's outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAck {
    pub event_id: String,
    pub status: AckStatus,
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
}

/// What the transport emits into the engine's read loop.
#[derive(Debug, Clone)]
pub enum StreamSignal {
    Connected,
    Disconnected,
    Event(EntitlementEvent),
    /// 401-class rejection. Not proof of revocation: the engine confirms
    /// with an explicit heartbeat before deciding anything.
    AuthRequired { reason: String, status_code: u16 },
}

/// Transport seam for the push channel. Implementations own the base URL
/// and reconnect policy.
#[async_trait]
pub trait EventStreamTransport: Send + Sync {
    /// Opens the stream for the given activation and returns the signal
    /// channel. A second connect implicitly replaces the first.
    async fn connect(
        &self,
        license_key: &str,
        fingerprint_hash: &str,
    ) -> LicenseResult<mpsc::Receiver<StreamSignal>>;

    /// Closes the stream. Safe to call when already disconnected.
    async fn disconnect(&self);

    /// Reports a processing verdict for one delivered event.
    async fn send_acknowledgment(&self, ack: EventAck) -> LicenseResult<()>;

    fn connection_state(&self) -> ConnectionState;
}
