use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

/// The runtime family that issued a push token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
    Web,
    Desktop,
}

impl Platform {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Web => "web",
            Self::Desktop => "desktop",
        }
    }

    /// Best guess for the platform this binary was compiled for.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_os = "ios") {
            Self::Ios
        } else if cfg!(target_arch = "wasm32") {
            Self::Web
        } else {
            Self::Desktop
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Loose back-reference to the authenticated customer, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl CustomerRef {
    #[must_use]
    pub fn new(customer_id: impl Into<String>, email: Option<String>) -> Self {
        Self { customer_id: customer_id.into(), email }
    }
}

/// The single persisted record describing this device's push token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub acquired_at: OffsetDateTime,
    pub platform: Platform,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_ref: Option<CustomerRef>,
    #[serde(default, with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<OffsetDateTime>,
}

impl TokenRecord {
    /// A freshly observed token: unregistered, no retries yet.
    #[must_use]
    pub fn new(value: impl Into<String>, platform: Platform, customer_ref: Option<CustomerRef>) -> Self {
        Self {
            value: value.into(),
            acquired_at: OffsetDateTime::now_utc(),
            platform,
            registered: false,
            retry_count: 0,
            customer_ref,
            last_attempt_at: None,
        }
    }

    /// Whether the record was acquired longer than `ttl` ago.
    #[must_use]
    pub fn is_stale(&self, ttl: std::time::Duration, now: OffsetDateTime) -> bool {
        let ttl = time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX);
        now - self.acquired_at > ttl
    }

    /// Abbreviated token value, safe to put in logs.
    #[must_use]
    pub fn redacted(&self) -> String {
        redact(&self.value)
    }
}

/// Keeps the provider prefix and a few characters of the token for correlation.
#[must_use]
pub fn redact(value: &str) -> String {
    const VISIBLE: usize = 12;
    if value.len() <= VISIBLE {
        return "*".repeat(value.len());
    }
    let head: String = value.chars().take(VISIBLE).collect();
    format!("{head}…({} chars)", value.len())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeViolation {
    #[error("token is empty")]
    Empty,
    #[error("token has {len} characters, minimum is {min}")]
    TooShort { len: usize, min: usize },
    #[error("token has {len} characters, maximum is {max}")]
    TooLong { len: usize, max: usize },
    #[error("token has no '{0}' delimiter")]
    MissingDelimiter(char),
    #[error("token suffix has {len} characters, minimum is {min}")]
    SuffixTooShort { len: usize, min: usize },
    #[error("token contains invalid character {0:?}")]
    InvalidCharacter(char),
}

/// Structural sanity rules for provider tokens of the form `prefix<delimiter>suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenShape {
    pub min_length: usize,
    pub max_length: usize,
    pub delimiter: char,
    pub min_suffix_length: usize,
}

impl Default for TokenShape {
    fn default() -> Self {
        Self { min_length: 50, max_length: 250, delimiter: ':', min_suffix_length: 140 }
    }
}

impl TokenShape {
    /// Checks the token against the shape. The token is otherwise treated as opaque.
    ///
    /// # Errors
    /// Returns the first [`ShapeViolation`] found.
    pub fn check(&self, value: &str) -> Result<(), ShapeViolation> {
        if value.trim().is_empty() {
            return Err(ShapeViolation::Empty);
        }

        let (prefix, suffix) = value.split_once(self.delimiter).ok_or(ShapeViolation::MissingDelimiter(self.delimiter))?;
        if prefix.is_empty() {
            return Err(ShapeViolation::MissingDelimiter(self.delimiter));
        }

        if let Some(c) = prefix.chars().chain(suffix.chars()).find(|c| !is_token_char(*c)) {
            return Err(ShapeViolation::InvalidCharacter(c));
        }

        let len = value.chars().count();
        if len < self.min_length {
            return Err(ShapeViolation::TooShort { len, min: self.min_length });
        }
        if len > self.max_length {
            return Err(ShapeViolation::TooLong { len, max: self.max_length });
        }

        let suffix_len = suffix.chars().count();
        if suffix_len < self.min_suffix_length {
            return Err(ShapeViolation::SuffixTooShort { len: suffix_len, min: self.min_suffix_length });
        }

        Ok(())
    }
}

const fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}
