#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tillpoint_license::{
    ActivateReply, ActivationData, ActivationRecord, ConnectionState, DeactivateReply,
    EngineConfig, EntitlementChange, EntitlementEvent, EventAck, EventStreamTransport,
    FingerprintProvider, HeartbeatData, HeartbeatReply, LicenseEngine, LicenseError,
    LicenseResult, LicenseServerClient, MachineInfo, MemoryActivationStore, MemoryValidationLog,
    StreamSignal, SubscriptionStatus, ValidateReply, ValidationData,
};
use tokio::sync::mpsc;

static TRACING: Once = Once::new();

/// Installs a fmt subscriber once per test binary so `RUST_LOG` surfaces
/// engine traces in test output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Fingerprint provider pinned to a fixed hash.
pub struct FixedFingerprint(pub String);

impl FingerprintProvider for FixedFingerprint {
    fn fingerprint(&self) -> String {
        self.0.clone()
    }

    fn machine_info(&self) -> MachineInfo {
        MachineInfo {
            os_name: "testos".into(),
            os_version: "1.0".into(),
            hostname: "till-test".into(),
            arch: "x86_64".into(),
            fingerprint_hash: self.0.clone(),
        }
    }
}

/// Scripted license server: each endpoint pops from its own reply queue.
/// An empty queue yields a network error.
#[derive(Default)]
pub struct MockServerClient {
    activate_replies: Mutex<VecDeque<LicenseResult<ActivateReply>>>,
    validate_replies: Mutex<VecDeque<LicenseResult<ValidateReply>>>,
    heartbeat_replies: Mutex<VecDeque<LicenseResult<HeartbeatReply>>>,
    deactivate_replies: Mutex<VecDeque<LicenseResult<DeactivateReply>>>,
    heartbeat_calls: AtomicU32,
}

impl MockServerClient {
    pub fn push_activate(&self, reply: LicenseResult<ActivateReply>) {
        self.activate_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_validate(&self, reply: LicenseResult<ValidateReply>) {
        self.validate_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_heartbeat(&self, reply: LicenseResult<HeartbeatReply>) {
        self.heartbeat_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_deactivate(&self, reply: LicenseResult<DeactivateReply>) {
        self.deactivate_replies.lock().unwrap().push_back(reply);
    }

    pub fn heartbeat_count(&self) -> u32 {
        self.heartbeat_calls.load(Ordering::SeqCst)
    }

    fn pop<T>(queue: &Mutex<VecDeque<LicenseResult<T>>>) -> LicenseResult<T> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LicenseError::Network("no scripted reply".into())))
    }
}

#[async_trait]
impl LicenseServerClient for MockServerClient {
    async fn activate(
        &self,
        _license_key: &str,
        _fingerprint_hash: &str,
        _terminal_name: &str,
    ) -> LicenseResult<ActivateReply> {
        Self::pop(&self.activate_replies)
    }

    async fn validate(
        &self,
        _license_key: &str,
        _fingerprint_hash: &str,
    ) -> LicenseResult<ValidateReply> {
        Self::pop(&self.validate_replies)
    }

    async fn heartbeat(&self, _license_key: &str) -> LicenseResult<HeartbeatReply> {
        self.heartbeat_calls.fetch_add(1, Ordering::SeqCst);
        Self::pop(&self.heartbeat_replies)
    }

    async fn deactivate(&self, _license_key: &str) -> LicenseResult<DeactivateReply> {
        Self::pop(&self.deactivate_replies)
    }
}

/// Mock push channel: the test holds the sending side and records every
/// acknowledgment the engine emits.
#[derive(Default)]
pub struct MockStreamTransport {
    sender: Mutex<Option<mpsc::Sender<StreamSignal>>>,
    state: Mutex<Option<ConnectionState>>,
    acks: Mutex<Vec<EventAck>>,
    connects: AtomicU32,
}

impl MockStreamTransport {
    pub async fn push(&self, signal: StreamSignal) {
        let tx = self
            .sender
            .lock()
            .unwrap()
            .clone()
            .expect("stream not connected");
        tx.send(signal).await.expect("engine dropped stream receiver");
    }

    pub fn acks(&self) -> Vec<EventAck> {
        self.acks.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStreamTransport for MockStreamTransport {
    async fn connect(
        &self,
        _license_key: &str,
        _fingerprint_hash: &str,
    ) -> LicenseResult<mpsc::Receiver<StreamSignal>> {
        let (tx, rx) = mpsc::channel(16);
        *self.sender.lock().unwrap() = Some(tx);
        *self.state.lock().unwrap() = Some(ConnectionState::Connected);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.sender.lock().unwrap().take();
        *self.state.lock().unwrap() = Some(ConnectionState::Disconnected);
    }

    async fn send_acknowledgment(&self, ack: EventAck) -> LicenseResult<()> {
        self.acks.lock().unwrap().push(ack);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .unwrap()
            .unwrap_or(ConnectionState::Disconnected)
    }
}

/// Everything a test needs: the engine plus handles to all mocks.
pub struct Harness {
    pub engine: LicenseEngine,
    pub server: Arc<MockServerClient>,
    pub transport: Arc<MockStreamTransport>,
    pub store: Arc<MemoryActivationStore>,
    pub log: Arc<MemoryValidationLog>,
}

pub fn harness() -> Harness {
    harness_with_fingerprint("FP-A")
}

pub fn harness_with_fingerprint(fingerprint: &str) -> Harness {
    init_tracing();
    let server = Arc::new(MockServerClient::default());
    let transport = Arc::new(MockStreamTransport::default());
    let store = Arc::new(MemoryActivationStore::new());
    let log = Arc::new(MemoryValidationLog::new());
    let config = EngineConfig {
        heartbeat_interval: Duration::from_secs(900),
        heartbeat_max_jitter: Duration::ZERO,
        notification_capacity: 64,
    };
    let engine = LicenseEngine::with_config(
        config,
        store.clone(),
        log.clone(),
        server.clone(),
        Arc::new(FixedFingerprint(fingerprint.to_string())),
        transport.clone(),
    );
    Harness {
        engine,
        server,
        transport,
        store,
        log,
    }
}

impl Harness {
    /// Activates with a canned "pro" reply and waits for the stream to
    /// attach.
    pub async fn activate_pro(&self, key: &str) {
        self.server
            .push_activate(Ok(activation_reply("act-1", "pro", &["x"])));
        self.engine
            .activate(key, "Till 1")
            .await
            .expect("activation failed");
        self.wait_for_stream().await;
    }

    pub async fn wait_for_stream(&self) {
        wait_until(|| self.transport.connection_state() == ConnectionState::Connected).await;
    }

    pub async fn wait_for_acks(&self, count: usize) {
        wait_until(|| self.transport.acks().len() >= count).await;
    }
}

/// Polls `cond` until it holds, panicking after ~1s of (virtual) time.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

// ── Canned server replies and events ─────────────────────────

pub fn activation_reply(activation_id: &str, plan_id: &str, features: &[&str]) -> ActivateReply {
    ActivateReply {
        success: true,
        data: Some(ActivationData {
            activation_id: activation_id.to_string(),
            plan_id: plan_id.to_string(),
            plan_name: plan_id.to_uppercase(),
            max_terminals: 3,
            features: features.iter().map(|s| s.to_string()).collect(),
            business_name: Some("Demo Cafe".into()),
            subscription_status: SubscriptionStatus::Active,
            expires_at: None,
            trial_end: None,
        }),
        message: None,
    }
}

pub fn activation_rejected(message: &str) -> ActivateReply {
    ActivateReply {
        success: false,
        data: None,
        message: Some(message.to_string()),
    }
}

pub fn validation_reply(status: SubscriptionStatus, days_until_expiry: i64) -> ValidateReply {
    ValidateReply {
        success: true,
        code: None,
        revocation_reason: None,
        data: Some(ValidationData {
            is_valid: true,
            plan_id: "pro".into(),
            plan_name: "PRO".into(),
            features: vec!["x".into()],
            subscription_status: status,
            days_until_expiry,
        }),
        message: None,
    }
}

pub fn validation_rejected(code: Option<&str>, message: &str) -> ValidateReply {
    ValidateReply {
        success: false,
        code: code.map(str::to_string),
        revocation_reason: None,
        data: None,
        message: Some(message.to_string()),
    }
}

pub fn validation_revoked(reason: &str) -> ValidateReply {
    ValidateReply {
        success: false,
        code: Some(tillpoint_license::CODE_LICENSE_REVOKED.to_string()),
        revocation_reason: Some(reason.to_string()),
        data: None,
        message: None,
    }
}

pub fn heartbeat_reply(should_disable: bool, interval_ms: Option<u64>) -> HeartbeatReply {
    HeartbeatReply {
        success: true,
        data: Some(HeartbeatData {
            subscription_status: SubscriptionStatus::Active,
            should_disable,
            grace_period_remaining: None,
            heartbeat_interval_ms: interval_ms,
            trial_end: None,
        }),
        message: None,
    }
}

pub fn event(id: &str, change: EntitlementChange) -> StreamSignal {
    StreamSignal::Event(EntitlementEvent {
        id: id.to_string(),
        change,
    })
}

pub fn revoked_event(id: &str) -> StreamSignal {
    event(id, EntitlementChange::LicenseRevoked { reason: None })
}

/// A record as it would exist after a past activation, with the last
/// successful server contact `heartbeat_age` ago.
pub fn seeded_record(key: &str, fingerprint: &str, heartbeat_age: ChronoDuration) -> ActivationRecord {
    let then = Utc::now() - heartbeat_age;
    ActivationRecord {
        license_key: key.to_string(),
        machine_fingerprint_hash: fingerprint.to_string(),
        terminal_name: "Till 1".into(),
        activation_id: "act-seed".into(),
        plan_id: "pro".into(),
        plan_name: "PRO".into(),
        max_terminals: 3,
        features: ["x"].iter().map(|s| s.to_string()).collect(),
        business_name: Some("Demo Cafe".into()),
        subscription_status: SubscriptionStatus::Active,
        expires_at: None,
        trial_end: None,
        is_active: true,
        activated_at: then,
        last_heartbeat: then,
        last_validated_at: Some(then),
        updated_at: then,
    }
}
