//! Session credentials and client settings.
//!
//! # Design
//! `Session` deserializes from the same options object the service's other
//! clients use (`b_c`, `b_o`, `u_c`, `sesskey`, `endpoint`, `version`,
//! optional `admin`), so credentials can be kept in a JSON file next to the
//! caller. Nothing here reads the environment.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ApiError;

/// Per-request timeout used by `ReqwestTransport`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Credentials that replace the session's own identity on every request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AdminOverride {
    pub b_c: String,
    pub b_o: String,
    pub u_c: String,
    pub sesskey: String,
}

/// One authenticated connection to a book.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Book code.
    pub b_c: String,
    /// Book owner.
    pub b_o: String,
    /// User code.
    pub u_c: String,
    pub sesskey: String,
    pub endpoint: String,
    pub version: String,
    #[serde(default)]
    pub admin: Option<AdminOverride>,
}

impl Session {
    pub fn new(
        b_c: impl Into<String>,
        b_o: impl Into<String>,
        u_c: impl Into<String>,
        sesskey: impl Into<String>,
        endpoint: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            b_c: b_c.into(),
            b_o: b_o.into(),
            u_c: u_c.into(),
            sesskey: sesskey.into(),
            endpoint: endpoint.into(),
            version: version.into(),
            admin: None,
        }
    }

    pub fn with_admin(mut self, admin: AdminOverride) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Parse a session from its JSON options object.
    pub fn from_json(raw: &str) -> Result<Self, ApiError> {
        serde_json::from_str(raw).map_err(|e| ApiError::DeserializationError(e.to_string()))
    }

    /// User code sent as both `o_u` and `u_c`.
    pub fn effective_user(&self) -> &str {
        self.admin.as_ref().map_or(&self.u_c, |a| &a.u_c)
    }

    pub fn effective_sesskey(&self) -> &str {
        self.admin.as_ref().map_or(&self.sesskey, |a| &a.sesskey)
    }

    pub fn effective_book_code(&self) -> &str {
        self.admin.as_ref().map_or(&self.b_c, |a| &a.b_c)
    }

    pub fn effective_book_owner(&self) -> &str {
        self.admin.as_ref().map_or(&self.b_o, |a| &a.b_o)
    }
}

/// How `Book::create_or_update_rows` reacts to a server deadlock.
///
/// The page is always resent unchanged. `max_retries: None` retries forever.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: Option<u32>,
    #[serde(default, with = "millis")]
    pub initial_backoff: Duration,
    #[serde(default, with = "millis")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Retry forever with no pause between attempts.
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Up to `max_retries` retries with no pause between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff.max(self.initial_backoff))
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(10),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
