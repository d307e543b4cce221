//! License activation and entitlement synchronization for TillPoint.
//!
//! This crate proves that a terminal is authorized to run under a
//! subscription, keeps that authorization fresh while online, tolerates
//! extended offline operation, and reacts within seconds to
//! server-initiated changes (cancellation, plan change, payment
//! failure/recovery, revocation).
//!
//! # Design Principles
//!
//! - **Single writer**: every mutation of the activation record flows
//!   through one engine lock, so heartbeat results and stream events are
//!   applied atomically and in arrival order
//! - **Offline grace**: a 7-day window after the last successful server
//!   contact keeps the terminal usable through outages
//! - **Revocation wins**: an explicit revocation tears the activation down
//!   immediately and is never recoverable through the grace period
//! - **Device binding**: the license is bound to a machine fingerprint;
//!   a changed fingerprint triggers automatic re-activation at startup

mod client;
mod engine;
mod error;
mod fingerprint;
mod heartbeat;
mod notify;
mod record;
mod store;
mod stream;

pub use client::{
    ActivateReply, ActivationData, DeactivateReply, HeartbeatData, HeartbeatReply,
    LicenseServerClient, ValidateReply, ValidationData, CODE_DEVICE_NOT_RECOGNIZED,
    CODE_LICENSE_REVOKED,
};
pub use engine::{
    DeactivationOutcome, EngineConfig, EngineState, InitOutcome, LicenseEngine, LicenseStatus,
    ValidationOutcome,
};
pub use error::{LicenseError, LicenseResult};
pub use fingerprint::{FingerprintProvider, MachineFingerprint, MachineInfo};
pub use heartbeat::{HeartbeatScheduler, BASE_INTERVAL, FAILURE_NOTICE_THRESHOLD, MAX_JITTER};
pub use notify::{LicenseNotification, Notifier};
pub use record::{
    normalize_key, ActivationRecord, LogAction, LogStatus, SubscriptionStatus, ValidationLogEntry,
    OFFLINE_GRACE_SECS,
};
pub use store::{
    ActivationStore, FileActivationStore, FileValidationLog, MemoryActivationStore,
    MemoryValidationLog, ValidationLog,
};
pub use stream::{
    AckStatus, ConnectionState, EntitlementChange, EntitlementEvent, EventAck,
    EventStreamTransport, StreamSignal,
};

#[cfg(feature = "online")]
pub use client::HttpLicenseClient;
