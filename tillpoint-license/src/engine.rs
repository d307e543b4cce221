//! Reconciliation core — the license state machine.
//!
//! The engine is the single authority over the activation record. Every
//! mutation (activation requests, heartbeat results, stream events,
//! startup checks) is serialized through one mutex, so a heartbeat result
//! and a stream event arriving together are applied atomically and in
//! arrival order. The heartbeat scheduler and the stream read loop are
//! owned tasks that feed back into the engine through a weak reference.

use crate::client::{
    ActivateReply, HeartbeatReply, LicenseServerClient, ValidateReply, CODE_DEVICE_NOT_RECOGNIZED,
    CODE_LICENSE_REVOKED,
};
use crate::error::{LicenseError, LicenseResult};
use crate::fingerprint::{FingerprintProvider, MachineInfo};
use crate::heartbeat::{HeartbeatScheduler, BASE_INTERVAL, FAILURE_NOTICE_THRESHOLD, MAX_JITTER};
use crate::notify::{LicenseNotification, Notifier};
use crate::record::{
    ActivationRecord, LogAction, LogStatus, SubscriptionStatus, ValidationLogEntry,
};
use crate::store::{ActivationStore, ValidationLog};
use crate::stream::{
    AckStatus, ConnectionState, EntitlementChange, EntitlementEvent, EventAck,
    EventStreamTransport, StreamSignal,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Engine state, derived from the activation record and recent server
/// contact. `PendingMigration` is transient inside `initialize` and never
/// observable from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Unactivated,
    Active,
    OfflineGrace,
    Disabled,
}

/// Tunables for the engine. Defaults match production; tests shrink the
/// intervals and drop the jitter.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_max_jitter: Duration,
    pub notification_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: BASE_INTERVAL,
            heartbeat_max_jitter: MAX_JITTER,
            notification_capacity: 64,
        }
    }
}

/// Outcome of the startup flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// No activation record on this machine.
    NotActivated,
    /// Usable, either validated online or inside the offline grace window
    /// (then `status` is `OfflineGrace`).
    Ready { status: SubscriptionStatus },
    /// The server revoked the license; the activation was torn down.
    Revoked { reason: Option<String> },
    /// Grace exhausted (locally or server-side); the activation was torn
    /// down and the user must reactivate.
    Expired,
}

/// Outcome of an explicit validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub subscription_status: SubscriptionStatus,
    pub plan_id: String,
    pub plan_name: String,
    pub features: Vec<String>,
    /// True when this outcome was served from the cached record under the
    /// offline grace policy rather than a live server verdict.
    pub offline: bool,
    pub days_until_expiry: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeactivationOutcome {
    /// False when the server call failed and only local state was cleared.
    pub server_acknowledged: bool,
}

/// Snapshot of license state for UI display.
#[derive(Debug, Clone, Serialize)]
pub struct LicenseStatus {
    pub is_activated: bool,
    pub state: EngineState,
    pub license_key: Option<String>,
    pub activation_id: Option<String>,
    pub terminal_name: Option<String>,
    pub plan_id: Option<String>,
    pub plan_name: Option<String>,
    pub features: Vec<String>,
    pub business_name: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    pub max_terminals: Option<u32>,
    pub expires_at: Option<chrono::DateTime<Utc>>,
    pub trial_end: Option<chrono::DateTime<Utc>>,
    pub last_heartbeat: Option<chrono::DateTime<Utc>>,
    pub stream_connection: ConnectionState,
}

struct EngineInner {
    state: EngineState,
    record: Option<ActivationRecord>,
    scheduler: HeartbeatScheduler,
    stream_task: Option<JoinHandle<()>>,
    consecutive_failures: u32,
}

struct EngineCore {
    config: EngineConfig,
    store: Arc<dyn ActivationStore>,
    log: Arc<dyn ValidationLog>,
    client: Arc<dyn LicenseServerClient>,
    fingerprint: Arc<dyn FingerprintProvider>,
    transport: Arc<dyn EventStreamTransport>,
    notifier: Notifier,
    weak_self: Weak<EngineCore>,
    inner: Mutex<EngineInner>,
}

/// The license engine handle. Cheap to clone; all clones share one core.
#[derive(Clone)]
pub struct LicenseEngine {
    core: Arc<EngineCore>,
}

impl LicenseEngine {
    pub fn new(
        store: Arc<dyn ActivationStore>,
        log: Arc<dyn ValidationLog>,
        client: Arc<dyn LicenseServerClient>,
        fingerprint: Arc<dyn FingerprintProvider>,
        transport: Arc<dyn EventStreamTransport>,
    ) -> Self {
        Self::with_config(EngineConfig::default(), store, log, client, fingerprint, transport)
    }

    pub fn with_config(
        config: EngineConfig,
        store: Arc<dyn ActivationStore>,
        log: Arc<dyn ValidationLog>,
        client: Arc<dyn LicenseServerClient>,
        fingerprint: Arc<dyn FingerprintProvider>,
        transport: Arc<dyn EventStreamTransport>,
    ) -> Self {
        let notifier = Notifier::new(config.notification_capacity);
        let scheduler = HeartbeatScheduler::new(config.heartbeat_max_jitter);
        let core = Arc::new_cyclic(|weak| EngineCore {
            config,
            store,
            log,
            client,
            fingerprint,
            transport,
            notifier,
            weak_self: weak.clone(),
            inner: Mutex::new(EngineInner {
                state: EngineState::Unactivated,
                record: None,
                scheduler,
                stream_task: None,
                consecutive_failures: 0,
            }),
        });
        Self { core }
    }

    /// Startup flow. Call once at process start; the application is not
    /// ready until this resolves, because trust state must be known before
    /// any transaction is allowed.
    pub async fn initialize(&self) -> LicenseResult<InitOutcome> {
        self.core.initialize().await
    }

    /// Activates this terminal under `license_key`.
    pub async fn activate(
        &self,
        license_key: &str,
        terminal_name: &str,
    ) -> LicenseResult<LicenseStatus> {
        self.core.activate(license_key, terminal_name).await
    }

    /// Re-validates the current activation against the server. With
    /// `force_online` the offline grace fallback is bypassed and a network
    /// failure surfaces as an error.
    pub async fn validate(&self, force_online: bool) -> LicenseResult<ValidationOutcome> {
        self.core.validate(force_online).await
    }

    /// Deactivates this terminal. The server call is best-effort; local
    /// state is always cleared.
    pub async fn deactivate(&self) -> LicenseResult<DeactivationOutcome> {
        self.core.deactivate().await
    }

    /// Manually triggers one heartbeat.
    pub async fn send_heartbeat(&self) -> LicenseResult<()> {
        self.core.heartbeat_once().await
    }

    pub async fn status(&self) -> LicenseStatus {
        let inner = self.core.inner.lock().await;
        self.core.status_locked(&inner)
    }

    pub async fn has_feature(&self, name: &str) -> bool {
        let inner = self.core.inner.lock().await;
        inner
            .record
            .as_ref()
            .is_some_and(|r| r.is_active && r.features.contains(name))
    }

    pub fn machine_info(&self) -> MachineInfo {
        self.core.fingerprint.machine_info()
    }

    /// Subscribes to state-change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<LicenseNotification> {
        self.core.notifier.subscribe()
    }
}

impl EngineCore {
    // ── Startup ──────────────────────────────────────────────────

    async fn initialize(&self) -> LicenseResult<InitOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(record) = self.store.load_active()? else {
            inner.state = EngineState::Unactivated;
            return Ok(InitOutcome::NotActivated);
        };

        let current_fp = self.fingerprint.fingerprint();
        if current_fp != record.machine_fingerprint_hash {
            info!("machine fingerprint changed, attempting re-activation");
            return self.migrate_fingerprint(&mut inner, record, &current_fp).await;
        }

        // Blocking startup validation: the app is not usable until the
        // server (or the grace policy) has vouched for the record.
        match self.client.validate(&record.license_key, &current_fp).await {
            Ok(ValidateReply {
                success: true,
                data: Some(data),
                ..
            }) if data.is_valid => {
                // Server-side grace already exhausted: a cancelled or
                // past-due subscription with no days left is done.
                if matches!(
                    data.subscription_status,
                    SubscriptionStatus::Cancelled | SubscriptionStatus::PastDue
                ) && data.days_until_expiry <= 0
                {
                    self.log_attempt(
                        ValidationLogEntry::new(
                            LogAction::StartupValidation,
                            LogStatus::Failed,
                            &record.license_key,
                        )
                        .with_error("subscription grace exhausted server-side"),
                    );
                    self.clear_activation_locked(&mut inner)?;
                    return Ok(InitOutcome::Expired);
                }

                let mut record = record;
                let now = Utc::now();
                record.subscription_status = data.subscription_status;
                record.plan_id = data.plan_id.clone();
                record.plan_name = data.plan_name.clone();
                record.features = data.features.iter().cloned().collect();
                record.last_validated_at = Some(now);
                record.touch_heartbeat(now);
                self.store.upsert_active(&record)?;
                self.log_attempt(
                    ValidationLogEntry::new(
                        LogAction::StartupValidation,
                        LogStatus::Success,
                        &record.license_key,
                    )
                    .with_response(snapshot(&data)),
                );

                let status = record.subscription_status;
                inner.record = Some(record);
                inner.state = EngineState::Active;
                self.start_runtime_locked(&mut inner).await;
                Ok(InitOutcome::Ready { status })
            }
            Ok(reply) => {
                if reply.code.as_deref() == Some(CODE_LICENSE_REVOKED)
                    || reply.revocation_reason.is_some()
                {
                    // Explicit revocation: no grace period applies.
                    let reason = reply.revocation_reason.or(reply.message);
                    self.log_attempt(
                        ValidationLogEntry::new(
                            LogAction::StartupValidation,
                            LogStatus::Failed,
                            &record.license_key,
                        )
                        .with_error(reason.clone().unwrap_or_else(|| "license revoked".into())),
                    );
                    self.clear_activation_locked(&mut inner)?;
                    self.notifier.emit(LicenseNotification::Disabled {
                        revoked: true,
                        reason: reason.clone(),
                    });
                    return Ok(InitOutcome::Revoked { reason });
                }
                if reply.code.as_deref() == Some(CODE_DEVICE_NOT_RECOGNIZED) {
                    info!("server does not recognize this device, attempting re-activation");
                    return self.migrate_fingerprint(&mut inner, record, &current_fp).await;
                }
                let message = reply
                    .message
                    .unwrap_or_else(|| "startup validation rejected".to_string());
                self.startup_grace_or_expire(&mut inner, record, message).await
            }
            Err(e) => {
                self.startup_grace_or_expire(&mut inner, record, e.to_string())
                    .await
            }
        }
    }

    /// Automatic re-activation with the stored key after a fingerprint
    /// change or a "device not recognized" verdict.
    async fn migrate_fingerprint(
        &self,
        inner: &mut EngineInner,
        mut record: ActivationRecord,
        current_fp: &str,
    ) -> LicenseResult<InitOutcome> {
        match self
            .client
            .activate(&record.license_key, current_fp, &record.terminal_name)
            .await
        {
            Ok(ActivateReply {
                success: true,
                data: Some(data),
                ..
            }) => {
                let now = Utc::now();
                record.machine_fingerprint_hash = current_fp.to_string();
                record.activation_id = data.activation_id.clone();
                record.plan_id = data.plan_id.clone();
                record.plan_name = data.plan_name.clone();
                record.max_terminals = data.max_terminals;
                record.features = data.features.iter().cloned().collect();
                record.business_name = data.business_name.clone();
                record.subscription_status = data.subscription_status;
                record.expires_at = data.expires_at;
                record.trial_end = data.trial_end;
                record.is_active = true;
                record.last_validated_at = Some(now);
                record.touch_heartbeat(now);
                self.store.upsert_active(&record)?;
                self.log_attempt(
                    ValidationLogEntry::new(
                        LogAction::FingerprintMigration,
                        LogStatus::Success,
                        &record.license_key,
                    )
                    .with_fingerprint(current_fp)
                    .with_response(snapshot(&data)),
                );
                info!("fingerprint migration succeeded");

                let status = record.subscription_status;
                inner.record = Some(record);
                inner.state = EngineState::Active;
                self.start_runtime_locked(inner).await;
                Ok(InitOutcome::Ready { status })
            }
            Ok(reply) => {
                let message = reply
                    .message
                    .unwrap_or_else(|| "re-activation rejected".to_string());
                self.log_attempt(
                    ValidationLogEntry::new(
                        LogAction::FingerprintMigration,
                        LogStatus::Failed,
                        &record.license_key,
                    )
                    .with_fingerprint(current_fp)
                    .with_error(message.clone()),
                );
                self.startup_grace_or_expire(inner, record, message).await
            }
            Err(e) => {
                self.log_attempt(
                    ValidationLogEntry::new(
                        LogAction::FingerprintMigration,
                        LogStatus::Error,
                        &record.license_key,
                    )
                    .with_fingerprint(current_fp)
                    .with_error(e.to_string()),
                );
                self.startup_grace_or_expire(inner, record, e.to_string())
                    .await
            }
        }
    }

    /// Startup failure fallback: continue degraded inside the grace window,
    /// otherwise tear the activation down.
    async fn startup_grace_or_expire(
        &self,
        inner: &mut EngineInner,
        mut record: ActivationRecord,
        failure: String,
    ) -> LicenseResult<InitOutcome> {
        let now = Utc::now();
        if record.within_offline_grace(now) {
            record.subscription_status = SubscriptionStatus::OfflineGrace;
            record.updated_at = now;
            self.store.upsert_active(&record)?;
            self.log_attempt(
                ValidationLogEntry::new(
                    LogAction::StartupValidation,
                    LogStatus::FailedGrace,
                    &record.license_key,
                )
                .with_error(failure),
            );
            warn!("startup validation failed, continuing in offline grace");
            inner.record = Some(record);
            inner.state = EngineState::OfflineGrace;
            self.start_runtime_locked(inner).await;
            return Ok(InitOutcome::Ready {
                status: SubscriptionStatus::OfflineGrace,
            });
        }

        self.log_attempt(
            ValidationLogEntry::new(
                LogAction::StartupValidation,
                LogStatus::Failed,
                &record.license_key,
            )
            .with_error(format!("offline grace expired: {failure}")),
        );
        warn!("offline grace expired, deactivating locally");
        self.clear_activation_locked(inner)?;
        Ok(InitOutcome::Expired)
    }

    // ── UI/CLI operations ────────────────────────────────────────

    async fn activate(
        &self,
        license_key: &str,
        terminal_name: &str,
    ) -> LicenseResult<LicenseStatus> {
        let key = crate::record::normalize_key(license_key);
        let fp = self.fingerprint.fingerprint();

        let reply = match self.client.activate(&key, &fp, terminal_name).await {
            Ok(reply) => reply,
            Err(e) => {
                self.log_attempt(
                    ValidationLogEntry::new(LogAction::Activation, LogStatus::Error, &key)
                        .with_fingerprint(&fp)
                        .with_error(e.to_string()),
                );
                return Err(e);
            }
        };

        match reply {
            ActivateReply {
                success: true,
                data: Some(data),
                ..
            } => {
                let mut inner = self.inner.lock().await;
                let now = Utc::now();
                let record = ActivationRecord {
                    license_key: key.clone(),
                    machine_fingerprint_hash: fp.clone(),
                    terminal_name: terminal_name.to_string(),
                    activation_id: data.activation_id.clone(),
                    plan_id: data.plan_id.clone(),
                    plan_name: data.plan_name.clone(),
                    max_terminals: data.max_terminals,
                    features: data.features.iter().cloned().collect(),
                    business_name: data.business_name.clone(),
                    subscription_status: data.subscription_status,
                    expires_at: data.expires_at,
                    trial_end: data.trial_end,
                    is_active: true,
                    activated_at: now,
                    last_heartbeat: now,
                    last_validated_at: Some(now),
                    updated_at: now,
                };
                if let Err(e) = self.store.upsert_active(&record) {
                    self.log_attempt(
                        ValidationLogEntry::new(LogAction::Activation, LogStatus::Error, &key)
                            .with_error(e.to_string()),
                    );
                    return Err(e);
                }
                self.log_attempt(
                    ValidationLogEntry::new(LogAction::Activation, LogStatus::Success, &key)
                        .with_fingerprint(&fp)
                        .with_response(snapshot(&data)),
                );
                info!(plan = %data.plan_id, "license activated");

                inner.record = Some(record);
                inner.state = EngineState::Active;
                self.start_runtime_locked(&mut inner).await;
                Ok(self.status_locked(&inner))
            }
            ActivateReply { message, .. } => {
                let message = message.unwrap_or_else(|| "activation rejected".to_string());
                self.log_attempt(
                    ValidationLogEntry::new(LogAction::Activation, LogStatus::Failed, &key)
                        .with_fingerprint(&fp)
                        .with_error(message.clone()),
                );
                Err(LicenseError::ValidationFailed(message))
            }
        }
    }

    async fn validate(&self, force_online: bool) -> LicenseResult<ValidationOutcome> {
        let mut inner = self.inner.lock().await;
        let (key, fp) = {
            let Some(record) = inner.record.as_ref().filter(|r| r.is_active) else {
                return Err(LicenseError::NoActiveLicense);
            };
            (
                record.license_key.clone(),
                record.machine_fingerprint_hash.clone(),
            )
        };

        match self.client.validate(&key, &fp).await {
            Ok(ValidateReply {
                success: true,
                data: Some(data),
                ..
            }) if data.is_valid => {
                let now = Utc::now();
                let record = inner.record.as_mut().ok_or(LicenseError::NoActiveLicense)?;
                record.subscription_status = data.subscription_status;
                record.plan_id = data.plan_id.clone();
                record.plan_name = data.plan_name.clone();
                record.features = data.features.iter().cloned().collect();
                record.last_validated_at = Some(now);
                record.touch_heartbeat(now);
                self.store.upsert_active(record)?;
                inner.state = EngineState::Active;
                inner.consecutive_failures = 0;
                self.log_attempt(
                    ValidationLogEntry::new(LogAction::Validation, LogStatus::Success, &key)
                        .with_response(snapshot(&data)),
                );
                Ok(ValidationOutcome {
                    subscription_status: data.subscription_status,
                    plan_id: data.plan_id,
                    plan_name: data.plan_name,
                    features: data.features,
                    offline: false,
                    days_until_expiry: Some(data.days_until_expiry),
                })
            }
            Ok(reply) => {
                if reply.code.as_deref() == Some(CODE_LICENSE_REVOKED)
                    || reply.revocation_reason.is_some()
                {
                    let reason = reply.revocation_reason.or(reply.message);
                    self.log_attempt(
                        ValidationLogEntry::new(LogAction::Validation, LogStatus::Failed, &key)
                            .with_error(
                                reason.clone().unwrap_or_else(|| "license revoked".into()),
                            ),
                    );
                    self.disable_locally(&mut inner, true, reason.clone()).await?;
                    return Err(LicenseError::Revoked(reason));
                }
                // An authoritative server rejection; the grace policy only
                // covers transient failures.
                let message = reply
                    .message
                    .unwrap_or_else(|| "validation rejected".to_string());
                self.log_attempt(
                    ValidationLogEntry::new(LogAction::Validation, LogStatus::Failed, &key)
                        .with_error(message.clone()),
                );
                Err(LicenseError::ValidationFailed(message))
            }
            Err(e) => {
                let now = Utc::now();
                let record = inner.record.as_mut().ok_or(LicenseError::NoActiveLicense)?;
                if !force_online && record.within_offline_grace(now) {
                    record.subscription_status = SubscriptionStatus::OfflineGrace;
                    record.updated_at = now;
                    let outcome = ValidationOutcome {
                        subscription_status: SubscriptionStatus::OfflineGrace,
                        plan_id: record.plan_id.clone(),
                        plan_name: record.plan_name.clone(),
                        features: record.features.iter().cloned().collect(),
                        offline: true,
                        days_until_expiry: None,
                    };
                    self.store.upsert_active(record)?;
                    self.log_attempt(
                        ValidationLogEntry::new(
                            LogAction::Validation,
                            LogStatus::FailedGrace,
                            &key,
                        )
                        .with_error(e.to_string()),
                    );
                    inner.state = EngineState::OfflineGrace;
                    return Ok(outcome);
                }
                self.log_attempt(
                    ValidationLogEntry::new(LogAction::Validation, LogStatus::Failed, &key)
                        .with_error(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn deactivate(&self) -> LicenseResult<DeactivationOutcome> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.record.as_ref() else {
            return Err(LicenseError::NoActiveLicense);
        };
        let key = record.license_key.clone();

        // Best-effort: a failed server call never blocks local deactivation.
        let server_acknowledged = match self.client.deactivate(&key).await {
            Ok(reply) => reply.success,
            Err(e) => {
                debug!(error = %e, "server deactivation failed, clearing locally");
                false
            }
        };

        self.teardown_locked(&mut inner).await;
        inner.record = None;
        self.store.deactivate_all()?;
        inner.state = EngineState::Unactivated;
        inner.consecutive_failures = 0;
        self.log_attempt(ValidationLogEntry::new(
            LogAction::Deactivation,
            if server_acknowledged {
                LogStatus::Success
            } else {
                LogStatus::LocalOnly
            },
            &key,
        ));
        info!(server_acknowledged, "license deactivated");
        Ok(DeactivationOutcome { server_acknowledged })
    }

    // ── Heartbeat path ───────────────────────────────────────────

    async fn heartbeat_once(&self) -> LicenseResult<()> {
        let mut inner = self.inner.lock().await;
        let key = {
            let Some(record) = inner.record.as_ref().filter(|r| r.is_active) else {
                return Err(LicenseError::NoActiveLicense);
            };
            record.license_key.clone()
        };

        match self.client.heartbeat(&key).await {
            Ok(HeartbeatReply {
                success: true,
                data: Some(data),
                message,
            }) => {
                self.log_attempt(
                    ValidationLogEntry::new(LogAction::Heartbeat, LogStatus::Success, &key)
                        .with_response(snapshot(&data)),
                );
                if data.should_disable {
                    info!("server requested disable via heartbeat");
                    self.disable_locally(&mut inner, false, message).await?;
                    return Ok(());
                }

                let now = Utc::now();
                let record = inner.record.as_mut().ok_or(LicenseError::NoActiveLicense)?;
                record.subscription_status = data.subscription_status;
                record.trial_end = data.trial_end;
                record.touch_heartbeat(now);
                self.store.upsert_active(record)?;
                inner.consecutive_failures = 0;
                inner.state = EngineState::Active;

                if let Some(ms) = data.heartbeat_interval_ms {
                    let desired = Duration::from_millis(ms);
                    if desired != inner.scheduler.interval() {
                        info!(interval_ms = ms, "server changed heartbeat interval");
                        self.start_heartbeat_locked(&mut inner, desired);
                    }
                }
                Ok(())
            }
            Ok(reply) => {
                let message = reply
                    .message
                    .unwrap_or_else(|| "heartbeat rejected".to_string());
                self.note_heartbeat_failure(&mut inner, &key, LogStatus::Failed, &message);
                Err(LicenseError::ValidationFailed(message))
            }
            Err(e) => {
                self.note_heartbeat_failure(&mut inner, &key, LogStatus::Error, &e.to_string());
                Err(e)
            }
        }
    }

    /// Counts a failed heartbeat and raises the advisory connectivity
    /// notification at the threshold. Activation state never changes here.
    fn note_heartbeat_failure(
        &self,
        inner: &mut EngineInner,
        key: &str,
        status: LogStatus,
        message: &str,
    ) {
        inner.consecutive_failures += 1;
        self.log_attempt(
            ValidationLogEntry::new(LogAction::Heartbeat, status, key).with_error(message),
        );
        if inner.consecutive_failures == FAILURE_NOTICE_THRESHOLD {
            warn!(
                failures = inner.consecutive_failures,
                "repeated heartbeat failures"
            );
            self.notifier.emit(LicenseNotification::ConnectionIssue {
                consecutive_failures: inner.consecutive_failures,
            });
        }
    }

    // ── Stream path ──────────────────────────────────────────────

    async fn handle_stream_signal(&self, signal: StreamSignal) {
        match signal {
            StreamSignal::Connected => {
                debug!("entitlement stream connected");
                self.notifier.emit(LicenseNotification::StreamConnected);
            }
            StreamSignal::Disconnected => {
                debug!("entitlement stream disconnected");
            }
            StreamSignal::AuthRequired { reason, status_code } => {
                // A 401 is not proof of revocation: confirm with an
                // explicit heartbeat and let its verdict decide.
                warn!(%reason, status_code, "entitlement stream rejected credentials");
                if let Err(e) = self.heartbeat_once().await {
                    debug!(error = %e, "confirmation heartbeat failed");
                }
            }
            StreamSignal::Event(event) => {
                let started = Instant::now();
                let (status, error_message) = self.apply_event(&event).await;
                let ack = EventAck {
                    event_id: event.id.clone(),
                    status,
                    error_message,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                };
                // Ack delivery is best-effort and never re-raises into the
                // event's own processing outcome.
                if let Err(e) = self.transport.send_acknowledgment(ack).await {
                    warn!(event_id = %event.id, error = %e, "event acknowledgment failed");
                }
            }
        }
    }

    async fn apply_event(&self, event: &EntitlementEvent) -> (AckStatus, Option<String>) {
        let mut inner = self.inner.lock().await;
        if inner.record.as_ref().is_none_or(|r| !r.is_active) {
            debug!(event_id = %event.id, "no active record, skipping event");
            return (AckStatus::Skipped, None);
        }
        match self.apply_change_locked(&mut inner, &event.change).await {
            Ok(()) => (AckStatus::Success, None),
            Err(e) => {
                warn!(event_id = %event.id, error = %e, "failed to apply entitlement event");
                (AckStatus::Failed, Some(e.to_string()))
            }
        }
    }

    async fn apply_change_locked(
        &self,
        inner: &mut EngineInner,
        change: &EntitlementChange,
    ) -> LicenseResult<()> {
        let now = Utc::now();
        match change {
            EntitlementChange::SubscriptionCancelled {
                cancel_immediately: true,
                ..
            } => {
                info!("subscription cancelled immediately");
                self.disable_locally(inner, false, Some("subscription cancelled".into()))
                    .await
            }
            EntitlementChange::SubscriptionCancelled {
                cancel_immediately: false,
                grace_period_end,
            } => {
                self.update_record_locked(inner, now, |r| {
                    r.subscription_status = SubscriptionStatus::Cancelled;
                })?;
                info!(?grace_period_end, "subscription cancellation scheduled");
                self.notifier.emit(LicenseNotification::CancelScheduled {
                    grace_period_end: *grace_period_end,
                });
                Ok(())
            }
            EntitlementChange::SubscriptionReactivated {
                subscription_status,
            } => {
                self.update_record_locked(inner, now, |r| {
                    r.subscription_status = *subscription_status;
                })?;
                inner.state = EngineState::Active;
                let plan_id = inner
                    .record
                    .as_ref()
                    .map(|r| r.plan_id.clone())
                    .unwrap_or_default();
                self.notifier
                    .emit(LicenseNotification::Reactivated { plan_id });
                Ok(())
            }
            EntitlementChange::SubscriptionUpdated {
                should_disable: true,
                ..
            } => {
                info!("subscription update requires disable");
                self.disable_locally(inner, false, Some("subscription no longer valid".into()))
                    .await
            }
            EntitlementChange::SubscriptionUpdated {
                should_disable: false,
                subscription_status,
                trial_end,
            } => {
                self.update_record_locked(inner, now, |r| {
                    r.subscription_status = *subscription_status;
                    r.trial_end = *trial_end;
                })?;
                self.notifier.emit(LicenseNotification::StatusChanged {
                    status: *subscription_status,
                });
                Ok(())
            }
            EntitlementChange::SubscriptionPastDue {
                grace_period_end,
                amount_due,
            } => {
                self.update_record_locked(inner, now, |r| {
                    r.subscription_status = SubscriptionStatus::PastDue;
                })?;
                self.notifier.emit(LicenseNotification::PaymentRequired {
                    grace_period_end: *grace_period_end,
                    amount_due: amount_due.clone(),
                });
                Ok(())
            }
            EntitlementChange::SubscriptionPaymentSucceeded {
                subscription_status,
            } => {
                self.update_record_locked(inner, now, |r| {
                    r.subscription_status = *subscription_status;
                })?;
                self.notifier.emit(LicenseNotification::PaymentSucceeded {
                    status: *subscription_status,
                });
                Ok(())
            }
            EntitlementChange::LicenseRevoked { reason } => {
                info!(?reason, "license revoked by server");
                self.disable_locally(inner, true, reason.clone()).await
            }
            EntitlementChange::LicenseReactivated { plan_id, features } => {
                self.update_record_locked(inner, now, |r| {
                    r.subscription_status = SubscriptionStatus::Active;
                    r.plan_id = plan_id.clone();
                    r.features = features.iter().cloned().collect();
                })?;
                inner.state = EngineState::Active;
                self.notifier.emit(LicenseNotification::Reactivated {
                    plan_id: plan_id.clone(),
                });
                Ok(())
            }
            EntitlementChange::PlanChanged {
                new_plan_id,
                new_plan_name,
            } => {
                // Informational only: the server follows up with a
                // license_revoked event that performs the teardown.
                info!(%new_plan_id, "plan changed, reactivation required");
                self.notifier.emit(LicenseNotification::PlanChanged {
                    new_plan_id: new_plan_id.clone(),
                    new_plan_name: new_plan_name.clone(),
                });
                Ok(())
            }
        }
    }

    // ── Shared transitions ───────────────────────────────────────

    fn update_record_locked(
        &self,
        inner: &mut EngineInner,
        now: chrono::DateTime<Utc>,
        apply: impl FnOnce(&mut ActivationRecord),
    ) -> LicenseResult<()> {
        let record = inner.record.as_mut().ok_or(LicenseError::NoActiveLicense)?;
        apply(record);
        record.updated_at = now;
        self.store.upsert_active(record)
    }

    /// Tears down the runtime and clears the activation. Shared by
    /// server-initiated disable, revocation, and grace expiry.
    async fn disable_locally(
        &self,
        inner: &mut EngineInner,
        revoked: bool,
        reason: Option<String>,
    ) -> LicenseResult<()> {
        self.teardown_locked(inner).await;
        self.clear_activation_locked(inner)?;
        self.notifier
            .emit(LicenseNotification::Disabled { revoked, reason });
        Ok(())
    }

    fn clear_activation_locked(&self, inner: &mut EngineInner) -> LicenseResult<()> {
        if inner.record.take().is_some() {
            self.store.deactivate_all()?;
        }
        inner.state = EngineState::Disabled;
        Ok(())
    }

    /// Atomic teardown of scheduler and stream. Safe to call when already
    /// stopped, and safe to call from inside either owned task: the
    /// transport disconnect (the only await) happens before any task
    /// cancellation, and everything after is synchronous.
    async fn teardown_locked(&self, inner: &mut EngineInner) {
        self.transport.disconnect().await;
        // The read loop drains and exits once the transport closes the
        // signal channel; dropping the handle detaches it.
        inner.stream_task.take();
        inner.scheduler.stop();
    }

    // ── Runtime wiring ───────────────────────────────────────────

    async fn start_runtime_locked(&self, inner: &mut EngineInner) {
        let Some(record) = inner.record.as_ref() else {
            return;
        };
        let key = record.license_key.clone();
        let fp = record.machine_fingerprint_hash.clone();
        inner.consecutive_failures = 0;

        self.start_heartbeat_locked(inner, self.config.heartbeat_interval);

        if inner.stream_task.take().is_some() {
            self.transport.disconnect().await;
        }
        let weak = self.weak_self.clone();
        let transport = Arc::clone(&self.transport);
        inner.stream_task = Some(tokio::spawn(async move {
            let mut rx = match transport.connect(&key, &fp).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(error = %e, "entitlement stream connection failed");
                    return;
                }
            };
            while let Some(signal) = rx.recv().await {
                let Some(core) = weak.upgrade() else { break };
                core.handle_stream_signal(signal).await;
            }
            debug!("entitlement stream read loop ended");
        }));
    }

    fn start_heartbeat_locked(&self, inner: &mut EngineInner, interval: Duration) {
        let weak = self.weak_self.clone();
        inner.scheduler.start(interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(core) = weak.upgrade() {
                    if let Err(e) = core.heartbeat_once().await {
                        debug!(error = %e, "scheduled heartbeat failed");
                    }
                }
            }
        });
    }

    // ── Plumbing ─────────────────────────────────────────────────

    fn status_locked(&self, inner: &EngineInner) -> LicenseStatus {
        let record = inner.record.as_ref().filter(|r| r.is_active);
        LicenseStatus {
            is_activated: record.is_some()
                && matches!(inner.state, EngineState::Active | EngineState::OfflineGrace),
            state: inner.state,
            license_key: record.map(|r| r.license_key.clone()),
            activation_id: record.map(|r| r.activation_id.clone()),
            terminal_name: record.map(|r| r.terminal_name.clone()),
            plan_id: record.map(|r| r.plan_id.clone()),
            plan_name: record.map(|r| r.plan_name.clone()),
            features: record
                .map(|r| r.features.iter().cloned().collect())
                .unwrap_or_default(),
            business_name: record.and_then(|r| r.business_name.clone()),
            subscription_status: record.map(|r| r.subscription_status),
            max_terminals: record.map(|r| r.max_terminals),
            expires_at: record.and_then(|r| r.expires_at),
            trial_end: record.and_then(|r| r.trial_end),
            last_heartbeat: record.map(|r| r.last_heartbeat),
            stream_connection: self.transport.connection_state(),
        }
    }

    /// Appends to the audit log. Log failures are diagnostics-only and
    /// never fail the triggering operation.
    fn log_attempt(&self, entry: ValidationLogEntry) {
        if let Err(e) = self.log.append(entry) {
            warn!(error = %e, "failed to append validation log entry");
        }
    }
}

fn snapshot<T: Serialize>(data: &T) -> serde_json::Value {
    serde_json::to_value(data).unwrap_or(serde_json::Value::Null)
}
