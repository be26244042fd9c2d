use std::borrow::Cow;

use anyhow::anyhow;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Run configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(Cow<'static, str>),
    /// Pre-flight work before any user is started failed.
    #[error("setup failed: {0}")]
    Setup(Cow<'static, str>),
    /// No registered username other than the caller's could be found.
    #[error("no transfer recipient distinct from {username} among {candidates} registered users")]
    NoRecipient { username: String, candidates: usize },
    #[error(transparent)]
    GenericError(#[from] anyhow::Error),
}

impl Error {
    pub fn new(err: impl Into<Cow<'static, str>>) -> Self {
        Self::GenericError(anyhow!(err.into()))
    }

    pub fn config(err: impl Into<Cow<'static, str>>) -> Self {
        Self::Config(err.into())
    }
}

/// Why a single request to the target service counted as failed.
///
/// None of these stop the virtual user that hit them, they only end up in
/// the failure rate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestError {
    /// No response was obtained (connect error, timeout, broken body).
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    /// Request was sent without a token because the login of this
    /// iteration did not yield one.
    #[error("missing credential (status {0})")]
    MissingCredential(u16),
}

impl From<reqwest::Error> for RequestError {
    fn from(value: reqwest::Error) -> Self {
        RequestError::NetworkFailure(value.to_string())
    }
}
