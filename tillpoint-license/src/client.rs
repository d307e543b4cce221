//! License server client contract.
//!
//! The engine only ever sees the typed replies below; transport failures
//! and timeouts surface as `LicenseError::Network` and are treated
//! identically for grace-period purposes. Retry/backoff is the transport's
//! concern, not the engine's.

use crate::error::{LicenseError, LicenseResult};
use crate::record::SubscriptionStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server rejection code for an unrecognized device fingerprint. Triggers
/// fingerprint migration instead of giving up.
pub const CODE_DEVICE_NOT_RECOGNIZED: &str = "device_not_recognized";

/// Server rejection code for an explicitly revoked license. No grace
/// period applies.
pub const CODE_LICENSE_REVOKED: &str = "license_revoked";

/// Payload of a successful activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationData {
    pub activation_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub max_terminals: u32,
    pub features: Vec<String>,
    #[serde(default)]
    pub business_name: Option<String>,
    pub subscription_status: SubscriptionStatus,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_end: Option<DateTime<Utc>>,
}

/// Reply envelope for `activate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateReply {
    pub success: bool,
    #[serde(default)]
    pub data: Option<ActivationData>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of a successful validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationData {
    pub is_valid: bool,
    pub plan_id: String,
    pub plan_name: String,
    pub features: Vec<String>,
    pub subscription_status: SubscriptionStatus,
    pub days_until_expiry: i64,
}

/// Reply envelope for `validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateReply {
    pub success: bool,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub revocation_reason: Option<String>,
    #[serde(default)]
    pub data: Option<ValidationData>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payload of a successful heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub subscription_status: SubscriptionStatus,
    pub should_disable: bool,
    #[serde(default)]
    pub grace_period_remaining: Option<i64>,
    /// Server-desired heartbeat cadence. A change restarts the scheduler.
    #[serde(default)]
    pub heartbeat_interval_ms: Option<u64>,
    #[serde(default)]
    pub trial_end: Option<DateTime<Utc>>,
}

/// Reply envelope for `heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReply {
    pub success: bool,
    #[serde(default)]
    pub data: Option<HeartbeatData>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Reply envelope for `deactivate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivateReply {
    pub success: bool,
}

/// The license server, seen through the engine's eyes: four calls, typed
/// replies, `Err` only for transport-level failures.
#[async_trait]
pub trait LicenseServerClient: Send + Sync {
    async fn activate(
        &self,
        license_key: &str,
        fingerprint_hash: &str,
        terminal_name: &str,
    ) -> LicenseResult<ActivateReply>;

    async fn validate(
        &self,
        license_key: &str,
        fingerprint_hash: &str,
    ) -> LicenseResult<ValidateReply>;

    async fn heartbeat(&self, license_key: &str) -> LicenseResult<HeartbeatReply>;

    async fn deactivate(&self, license_key: &str) -> LicenseResult<DeactivateReply>;
}

#[cfg(feature = "online")]
pub use http::HttpLicenseClient;

#[cfg(feature = "online")]
mod http {
    use super::*;
    use std::time::Duration;

    const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ActivateRequest<'a> {
        license_key: &'a str,
        fingerprint_hash: &'a str,
        terminal_name: &'a str,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ValidateRequest<'a> {
        license_key: &'a str,
        fingerprint_hash: &'a str,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct KeyOnlyRequest<'a> {
        license_key: &'a str,
    }

    /// HTTP implementation of the license server contract.
    pub struct HttpLicenseClient {
        base_url: String,
        http: reqwest::Client,
    }

    impl HttpLicenseClient {
        /// Creates a client against `base_url` (no trailing slash needed).
        pub fn new(base_url: impl Into<String>) -> LicenseResult<Self> {
            let http = reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| LicenseError::Network(e.to_string()))?;
            Ok(Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                http,
            })
        }

        async fn post<B, R>(&self, path: &str, body: &B) -> LicenseResult<R>
        where
            B: Serialize + Sync,
            R: serde::de::DeserializeOwned,
        {
            let url = format!("{}{path}", self.base_url);
            let response = self
                .http
                .post(&url)
                .json(body)
                .send()
                .await
                .map_err(|e| LicenseError::Network(e.to_string()))?;
            response
                .json::<R>()
                .await
                .map_err(|e| LicenseError::Network(e.to_string()))
        }
    }

    #[async_trait]
    impl LicenseServerClient for HttpLicenseClient {
        async fn activate(
            &self,
            license_key: &str,
            fingerprint_hash: &str,
            terminal_name: &str,
        ) -> LicenseResult<ActivateReply> {
            self.post(
                "/api/license/activate",
                &ActivateRequest {
                    license_key,
                    fingerprint_hash,
                    terminal_name,
                },
            )
            .await
        }

        async fn validate(
            &self,
            license_key: &str,
            fingerprint_hash: &str,
        ) -> LicenseResult<ValidateReply> {
            self.post(
                "/api/license/validate",
                &ValidateRequest {
                    license_key,
                    fingerprint_hash,
                },
            )
            .await
        }

        async fn heartbeat(&self, license_key: &str) -> LicenseResult<HeartbeatReply> {
            self.post("/api/license/heartbeat", &KeyOnlyRequest { license_key })
                .await
        }

        async fn deactivate(&self, license_key: &str) -> LicenseResult<DeactivateReply> {
            self.post("/api/license/deactivate", &KeyOnlyRequest { license_key })
                .await
        }
    }
}
