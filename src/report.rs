use std::time::Duration;

use crate::error::RequestError;

/// The three request types issued by a virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Auth,
    Purchase,
    Transfer,
}

impl RequestKind {
    pub const ALL: [RequestKind; 3] = [RequestKind::Auth, RequestKind::Purchase, RequestKind::Transfer];

    /// Name of the check this request kind is reported under.
    pub fn check_name(&self) -> &'static str {
        match self {
            RequestKind::Auth => "login successful",
            RequestKind::Purchase => "buy item successful",
            RequestKind::Transfer => "send coins successful",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            RequestKind::Auth => 0,
            RequestKind::Purchase => 1,
            RequestKind::Transfer => 2,
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestKind::Auth => f.write_str("auth"),
            RequestKind::Purchase => f.write_str("purchase"),
            RequestKind::Transfer => f.write_str("transfer"),
        }
    }
}

/// Result of one request attempt. Exactly one is produced per call.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub kind: RequestKind,
    pub latency: Duration,
    pub error: Option<RequestError>,
}

impl RequestOutcome {
    pub fn success(kind: RequestKind, latency: Duration) -> Self {
        Self {
            kind,
            latency,
            error: None,
        }
    }

    pub fn failure(kind: RequestKind, latency: Duration, error: RequestError) -> Self {
        Self {
            kind,
            latency,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
