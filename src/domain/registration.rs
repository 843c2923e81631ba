use crate::domain::token::{CustomerRef, Platform, TokenRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use time::OffsetDateTime;

/// What caused a registration attempt. Sent to the server as `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSource {
    ColdStart,
    Rotation,
    Retry,
    Foreground,
    Background,
    Reachability,
    Sweep,
    CustomerUpdate,
}

impl AttemptSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ColdStart => "cold_start",
            Self::Rotation => "rotation",
            Self::Retry => "retry",
            Self::Foreground => "foreground",
            Self::Background => "background",
            Self::Reachability => "reachability",
            Self::Sweep => "sweep",
            Self::CustomerUpdate => "customer_update",
        }
    }
}

/// Optional device description forwarded verbatim to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Opaque passthrough fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DeviceInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.app_version.is_none()
            && self.device_model.is_none()
            && self.os_version.is_none()
            && self.language.is_none()
            && self.timezone.is_none()
            && self.extra.is_empty()
    }
}

/// Caller-supplied data that accompanies every registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationContext {
    pub customer: Option<CustomerRef>,
    pub device_info: Option<DeviceInfo>,
}

/// JSON body of `POST <registration-endpoint>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPayload {
    pub token: String,
    pub platform: Platform,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: AttemptSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
}

impl RegistrationPayload {
    /// Builds the payload for `record`. Missing optional data is simply omitted.
    #[must_use]
    pub fn build(record: &TokenRecord, context: &RegistrationContext, source: AttemptSource, now: OffsetDateTime) -> Self {
        let customer = context.customer.as_ref().or(record.customer_ref.as_ref());
        Self {
            token: record.value.clone(),
            platform: record.platform,
            timestamp: now,
            source,
            customer_id: customer.map(|c| c.customer_id.clone()),
            email: customer.and_then(|c| c.email.clone()),
            device_info: context.device_info.clone().filter(|d| !d.is_empty()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkFailureReason {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request aborted")]
    Aborted,
    #[error("{0}")]
    Other(String),
}

/// Classified result of one registration call.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationOutcome {
    /// Server answered 2xx. Holds the response body, `Null` if it was not JSON.
    Success(serde_json::Value),
    /// Server was reached but answered non-2xx.
    Rejected { status: u16, body: String },
    /// The request never completed.
    NetworkFailure(NetworkFailureReason),
}

impl RegistrationOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Metric/log label for the outcome class.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Rejected { status, .. } if *status >= 400 && *status < 500 => "rejected_client",
            Self::Rejected { .. } => "rejected_server",
            Self::NetworkFailure(_) => "network_failure",
        }
    }
}
