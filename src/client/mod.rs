//! Client for the coin shop API.
//!
//! [`ApiClient`] issues the three requests a virtual user makes and pushes
//! exactly one [`RequestOutcome`] per attempt into the evaluator channel. The
//! [`reqwest`] submodule wraps `reqwest::Client` so that every request is sent
//! inside a traced span.
pub mod reqwest;

use std::time::{Duration, Instant};

use http::StatusCode;
use tracing::{event, Level};

use crate::error::{Error, RequestError};
use crate::report::{RequestKind, RequestOutcome};
use crate::{Sender, CRATE_NAME};

/// Header carrying the token, both in the login response and on authorized requests.
pub const TOKEN_HEADER: &str = "Access-Token";

/// Operations of the target service used by a virtual user.
///
/// Implementations report every attempt to the evaluator themselves, callers
/// only get back what they need to continue the script.
#[async_trait::async_trait]
pub trait CoinApi: Send + Sync {
    /// Log in (or sign up). A 200 response is a successful login even when it
    /// carries no access token, the token is then `None`.
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<String>, RequestError>;

    async fn purchase(&self, token: Option<&str>, item: &str) -> Result<(), RequestError>;

    async fn transfer(
        &self,
        token: Option<&str>,
        recipient: &str,
        amount: u64,
    ) -> Result<(), RequestError>;
}

#[derive(serde::Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct SendCoinRequest<'a> {
    to_user: &'a str,
    amount: u64,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    outcomes: Sender<RequestOutcome>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        outcomes: Sender<RequestOutcome>,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::with_timeout(timeout)
            .map_err(|err| Error::Setup(format!("failed to build http client: {err}").into()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            outcomes,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// Check that the service answers before any user is started. Not counted as a request outcome.
    pub async fn health(&self) -> Result<(), Error> {
        let url = self.url("/healthcheck");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| Error::Setup(format!("{url} unreachable: {err}").into()))?;
        if resp.status() != StatusCode::OK {
            return Err(Error::Setup(
                format!("{url} answered {}", resp.status()).into(),
            ));
        }
        Ok(())
    }

    fn record(&self, kind: RequestKind, started: Instant, error: Option<&RequestError>) {
        let latency = started.elapsed();
        let outcome = match error {
            None => RequestOutcome::success(kind, latency),
            Some(err) => RequestOutcome::failure(kind, latency, err.clone()),
        };
        if self.outcomes.unbounded_send(outcome).is_err() {
            event!(target: CRATE_NAME, Level::WARN, %kind, "outcome dropped, evaluator is gone");
        }
    }
}

/// Classify the response status. A request sent without a token that fails is a missing credential.
async fn finish(resp: ::reqwest::Response, authorized: bool) -> Result<::reqwest::Response, RequestError> {
    let status = resp.status();
    if status != StatusCode::OK {
        // drain so the connection goes back to the pool.
        let _ = resp.bytes().await;
        return Err(if authorized {
            RequestError::UnexpectedStatus(status.as_u16())
        } else {
            RequestError::MissingCredential(status.as_u16())
        });
    }
    Ok(resp)
}

fn with_token(builder: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => builder.header(TOKEN_HEADER, token),
        None => builder,
    }
}

#[async_trait::async_trait]
impl CoinApi for ApiClient {
    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<String>, RequestError> {
        let started = Instant::now();
        let result = async {
            let resp = self
                .client
                .post(self.url("/auth"))
                .json(&AuthRequest { username, password })
                .send()
                .await?;
            let resp = finish(resp, true).await?;
            let token = resp
                .headers()
                .get(TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            resp.bytes().await?;
            Ok::<Option<String>, RequestError>(token)
        }
        .await;
        self.record(RequestKind::Auth, started, result.as_ref().err());
        result
    }

    async fn purchase(&self, token: Option<&str>, item: &str) -> Result<(), RequestError> {
        let started = Instant::now();
        let result = async {
            let builder = with_token(self.client.get(self.url(&format!("/buy/{item}"))), token);
            let resp = finish(builder.send().await?, token.is_some()).await?;
            resp.bytes().await?;
            Ok::<(), RequestError>(())
        }
        .await;
        self.record(RequestKind::Purchase, started, result.as_ref().err());
        result
    }

    async fn transfer(
        &self,
        token: Option<&str>,
        recipient: &str,
        amount: u64,
    ) -> Result<(), RequestError> {
        let started = Instant::now();
        let result = async {
            let builder = self.client.post(self.url("/sendCoin")).json(&SendCoinRequest {
                to_user: recipient,
                amount,
            });
            let resp = finish(with_token(builder, token).send().await?, token.is_some()).await?;
            resp.bytes().await?;
            Ok::<(), RequestError>(())
        }
        .await;
        self.record(RequestKind::Transfer, started, result.as_ref().err());
        result
    }
}
