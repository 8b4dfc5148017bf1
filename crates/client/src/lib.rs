//! crisscross callout client: the four lifecycle verbs as blocking JSON/HTTP calls.
//!
//! One POST per verb invocation. The client never retries; transport,
//! status and decode failures all surface to the caller, whose reconciler
//! owns the retry policy.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context};

use crisscross_core::{Connector, ExternalClient, ExternalCreation, ExternalObservation, ExternalUpdate};
use crisscross_models::{
    CalloutResponse, CreationResponse, DeletionResponse, ManagedRequest, ObservationResponse, UpdateResponse, Verb,
};
use kube::core::DynamicObject;
use metrics::{counter, histogram};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tracing::debug;

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum CalloutError {
    #[error("encoding {verb} request: {source}")]
    Encode { verb: Verb, source: serde_json::Error },
    #[error("{verb} callout deadline exceeded")]
    DeadlineExceeded { verb: Verb },
    #[error("{verb} callout to {url} failed: {source}")]
    Transport { verb: Verb, url: String, source: reqwest::Error },
    #[error("{verb} callout to {url} returned {status}: {body}")]
    Status { verb: Verb, url: String, status: reqwest::StatusCode, body: String },
    #[error("decoding {verb} response from {url}: {source}")]
    Decode { verb: Verb, url: String, source: serde_json::Error },
}

impl CalloutError {
    pub fn verb(&self) -> Verb {
        match self {
            CalloutError::Encode { verb, .. }
            | CalloutError::DeadlineExceeded { verb }
            | CalloutError::Transport { verb, .. }
            | CalloutError::Status { verb, .. }
            | CalloutError::Decode { verb, .. } => *verb,
        }
    }
}

/// Talks to one remote controller endpoint.
#[derive(Debug, Clone)]
pub struct CalloutClient {
    http: reqwest::Client,
    endpoint: String,
    deadline: Option<Instant>,
}

impl CalloutClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), endpoint)
    }

    pub fn with_http(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self { http, endpoint: endpoint.into(), deadline: None }
    }

    /// Bound every subsequent call by `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }

    pub async fn observe<M: Serialize + ?Sized>(&self, mg: &M) -> Result<ExternalObservation, CalloutError> {
        let resp: ObservationResponse = self.call(mg).await?;
        Ok(resp.external)
    }

    pub async fn create<M: Serialize + ?Sized>(&self, mg: &M) -> Result<ExternalCreation, CalloutError> {
        let resp: CreationResponse = self.call(mg).await?;
        Ok(resp.external)
    }

    pub async fn update<M: Serialize + ?Sized>(&self, mg: &M) -> Result<ExternalUpdate, CalloutError> {
        let resp: UpdateResponse = self.call(mg).await?;
        Ok(resp.external)
    }

    pub async fn delete<M: Serialize + ?Sized>(&self, mg: &M) -> Result<(), CalloutError> {
        let _: DeletionResponse = self.call(mg).await?;
        Ok(())
    }

    async fn call<M: Serialize + ?Sized, R: CalloutResponse>(&self, managed: &M) -> Result<R, CalloutError> {
        let verb = R::VERB;
        let url = format!("{}{}", self.endpoint.trim_end_matches('/'), verb.path());
        let body = serde_json::to_vec(&ManagedRequest { managed }).map_err(|source| CalloutError::Encode { verb, source })?;

        let mut req = self.http.post(&url).header(CONTENT_TYPE, "application/json").body(body);
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                counter!("callout_errors_total", 1u64, "verb" => verb.as_str());
                return Err(CalloutError::DeadlineExceeded { verb });
            }
            req = req.timeout(remaining);
        }

        let t0 = Instant::now();
        counter!("callout_requests_total", 1u64, "verb" => verb.as_str());
        let result = self.exchange(req, verb, &url).await;
        histogram!("callout_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb.as_str());
        if result.is_err() {
            counter!("callout_errors_total", 1u64, "verb" => verb.as_str());
        }
        let out: R = result?;
        if let Some(msg) = out.err_message() {
            // Carried, not interpreted.
            debug!(verb = %verb, url = %url, err_message = %msg, "callout response carried errMessage");
        }
        Ok(out)
    }

    async fn exchange<R: CalloutResponse>(&self, req: reqwest::RequestBuilder, verb: Verb, url: &str) -> Result<R, CalloutError> {
        let transport = |source| CalloutError::Transport { verb, url: url.to_string(), source };
        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(transport)?;
        debug!(verb = %verb, url = %url, status = %status, bytes = bytes.len(), "callout response");
        if !status.is_success() {
            let mut body = String::from_utf8_lossy(&bytes).into_owned();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) { cut -= 1; }
                body.truncate(cut);
            }
            return Err(CalloutError::Status { verb, url: url.to_string(), status, body });
        }
        serde_json::from_slice(&bytes).map_err(|source| CalloutError::Decode { verb, url: url.to_string(), source })
    }
}

#[async_trait::async_trait]
impl ExternalClient for CalloutClient {
    async fn observe(&self, mg: &DynamicObject) -> anyhow::Result<ExternalObservation> {
        Ok(CalloutClient::observe(self, mg).await?)
    }

    async fn create(&self, mg: &DynamicObject) -> anyhow::Result<ExternalCreation> {
        Ok(CalloutClient::create(self, mg).await?)
    }

    async fn update(&self, mg: &DynamicObject) -> anyhow::Result<ExternalUpdate> {
        Ok(CalloutClient::update(self, mg).await?)
    }

    async fn delete(&self, mg: &DynamicObject) -> anyhow::Result<()> {
        Ok(CalloutClient::delete(self, mg).await?)
    }
}

/// Connects managed resources to the remote controller at `endpoint`.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), endpoint: endpoint.into() }
    }

    /// Like [`HttpConnector::new`], but rejects endpoints that are not absolute http(s) URLs.
    pub fn try_new(endpoint: impl Into<String>) -> anyhow::Result<Self> {
        let endpoint = endpoint.into();
        let url = reqwest::Url::parse(&endpoint).with_context(|| format!("invalid endpoint {:?}", endpoint))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("endpoint {:?} must use http or https", endpoint));
        }
        Ok(Self::new(endpoint))
    }

    pub fn endpoint(&self) -> &str { &self.endpoint }
}

#[async_trait::async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, _mg: &DynamicObject, deadline: Instant) -> anyhow::Result<Box<dyn ExternalClient>> {
        let client = CalloutClient::with_http(self.http.clone(), self.endpoint.clone()).with_deadline(deadline);
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_validates_endpoints() {
        assert!(HttpConnector::try_new("http://nop-paaf.default.svc:8081").is_ok());
        assert!(HttpConnector::try_new("https://callouts.example.org/v1").is_ok());
        assert!(HttpConnector::try_new("nop-paaf:8081/observe").is_err());
        assert!(HttpConnector::try_new("ftp://callouts.example.org").is_err());
        assert!(HttpConnector::try_new("").is_err());
    }

    #[test]
    fn errors_name_their_verb() {
        let err = CalloutError::DeadlineExceeded { verb: Verb::Update };
        assert_eq!(err.verb(), Verb::Update);
        assert_eq!(err.to_string(), "update callout deadline exceeded");
    }
}
