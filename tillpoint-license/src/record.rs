//! Activation record and validation log data model.
//!
//! The activation record is the single durable row describing the current
//! activation; the validation log is an append-only audit trail of every
//! attempt the engine makes against the license server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Offline grace window: how long the app keeps running after the last
/// successful server contact (7 days).
pub const OFFLINE_GRACE_SECS: i64 = 7 * 24 * 60 * 60;

/// Normalizes a license key for storage and comparison.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Subscription status as reported by the server, plus the local-only
/// `OfflineGrace` label derived when the server is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    Revoked,
    /// Derived locally when validation fails inside the grace window.
    /// The server never sends this value.
    OfflineGrace,
}

impl SubscriptionStatus {
    /// Returns true if this status allows the terminal to transact.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Trialing | Self::PastDue | Self::OfflineGrace
        )
    }
}

/// The persisted activation: one license key bound to one machine
/// fingerprint. At most one record is marked active at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRecord {
    /// Normalized (trimmed, uppercased) license key.
    pub license_key: String,
    /// Fingerprint hash bound at the last successful activation/migration.
    pub machine_fingerprint_hash: String,
    pub terminal_name: String,
    /// Server-assigned identifier for this specific activation.
    pub activation_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub max_terminals: u32,
    pub features: BTreeSet<String>,
    pub business_name: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    /// Exactly one record may hold `true`; the store flips all others to
    /// `false` when a new record is marked active.
    pub is_active: bool,
    pub activated_at: DateTime<Utc>,
    /// Last successful server contact. Anchor for the grace window.
    pub last_heartbeat: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ActivationRecord {
    /// Returns true if `now` is still inside the offline grace window
    /// measured from the last successful server contact.
    #[must_use]
    pub fn within_offline_grace(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_heartbeat).num_seconds() < OFFLINE_GRACE_SECS
    }

    /// Marks a successful server contact at `now`.
    pub fn touch_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.updated_at = now;
    }
}

/// What kind of attempt a validation log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Activation,
    Validation,
    Heartbeat,
    Deactivation,
    FingerprintMigration,
    StartupValidation,
}

/// Outcome of a logged attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    /// The server accepted the request.
    Success,
    /// The server rejected the request.
    Failed,
    /// Transport or storage error before a server verdict.
    Error,
    /// Deactivation applied locally without server acknowledgment.
    LocalOnly,
    /// Validation failed but the grace window kept the app usable.
    FailedGrace,
}

/// One row of the append-only validation log. Never mutated or read back
/// by the engine; diagnostics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationLogEntry {
    pub id: Uuid,
    pub action: LogAction,
    pub status: LogStatus,
    pub license_key: String,
    pub machine_fingerprint_hash: Option<String>,
    pub error_message: Option<String>,
    /// Opaque snapshot of the server response, when one was received.
    pub server_response: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ValidationLogEntry {
    /// Creates a log entry stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(action: LogAction, status: LogStatus, license_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            status,
            license_key: license_key.into(),
            machine_fingerprint_hash: None,
            error_message: None,
            server_response: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_fingerprint(mut self, hash: impl Into<String>) -> Self {
        self.machine_fingerprint_hash = Some(hash.into());
        self
    }

    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_response(mut self, snapshot: serde_json::Value) -> Self {
        self.server_response = Some(snapshot);
        self
    }
}
