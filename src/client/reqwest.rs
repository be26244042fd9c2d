use std::time::Duration;

use tracing::{event, field, span, Level};

use crate::USER_TASK;

#[derive(Clone)]
pub struct Client {
    pub inner: reqwest::Client,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        <reqwest::Client as std::fmt::Debug>::fmt(&self.inner, f)
    }
}

impl Client {
    /// Client whose requests give up after `timeout`, connect time included.
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { inner })
    }

    pub fn get<U: reqwest::IntoUrl>(&self, url: U) -> RequestBuilder {
        self.inner.get(url).into()
    }

    pub fn post<U: reqwest::IntoUrl>(&self, url: U) -> RequestBuilder {
        self.inner.post(url).into()
    }
}

#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    inner: reqwest::RequestBuilder,
}

impl From<reqwest::RequestBuilder> for RequestBuilder {
    fn from(value: reqwest::RequestBuilder) -> Self {
        Self { inner: value }
    }
}

impl RequestBuilder {
    pub fn header(mut self, key: &'static str, value: &str) -> RequestBuilder {
        self.inner = self.inner.header(key, value);
        self
    }

    pub fn json<T: serde::Serialize + ?Sized>(mut self, json: &T) -> RequestBuilder {
        self.inner = self.inner.json(json);
        self
    }

    /// Send the request inside a `reqwest` span, logging body sizes and the status.
    pub async fn send(self) -> Result<reqwest::Response, reqwest::Error> {
        let (client, request) = self.inner.build_split();
        let request = request?;
        let host = request.url().host_str().map(str::to_owned);
        let path = request.url().path().to_owned();
        let method = request.method().clone();
        let span =
            span!(target: USER_TASK, Level::INFO, "reqwest", url = field::Empty, %path, %method);
        {
            let _t = span.enter();
            if let Some(host) = host {
                span.record("url", field::display(host));
            }
            use http_body::Body as _;
            if let Some(size) = request.body().and_then(|x| x.size_hint().exact()) {
                event!(target: USER_TASK, Level::DEBUG, bytes = size, "request body sent");
            }
        }
        let resp = client.execute(request).await;
        let _t = span.enter();
        match &resp {
            Ok(resp) => {
                event!(target: USER_TASK, Level::DEBUG, status = resp.status().as_u16(), bytes = ?resp.content_length(), "response received");
            }
            Err(err) => {
                event!(target: USER_TASK, Level::DEBUG, %err, "request failed");
            }
        }
        resp
    }
}
