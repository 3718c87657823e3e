use crate::config::{RouterAuth, RouterEndpoint};
use crate::traits::{Method, RouterApi};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// RouterOS REST client over plain HTTP.
///
/// Plain HTTP keeps memory use low on the device side; the router is expected
/// to sit on the same trusted segment.
pub struct RestClient {
    http: reqwest::Client,
    endpoint: RwLock<RouterEndpoint>,
}

impl RestClient {
    pub fn new(endpoint: RouterEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            endpoint: RwLock::new(endpoint),
        })
    }

    fn endpoint(&self) -> RouterEndpoint {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// `<address>/rest<path>`, defaulting the scheme to `http://`.
pub fn rest_url(address: &str, path: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{}/rest{}", address, path)
    } else {
        format!("http://{}/rest{}", address, path)
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl RouterApi for RestClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<String> {
        let endpoint = self.endpoint();
        if endpoint.address.is_empty() {
            tracing::error!("Router address not configured");
            return Err(Error::Config("router address not configured".into()));
        }

        let url = rest_url(&endpoint.address, path);
        tracing::debug!(%method, %url, timeout_ms = timeout.as_millis() as u64, "router request");

        let mut req = self.http.request(method.into(), &url).timeout(timeout);
        req = match &endpoint.auth {
            RouterAuth::Basic { user, password } => req.basic_auth(user, Some(password)),
            RouterAuth::Bearer(token) => req.bearer_auth(token),
        };
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::warn!(%method, path, "Router request failed: {}", e);
            Error::RemoteUnreachable(e.to_string())
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::RemoteUnreachable(e.to_string()))?;

        if !status.is_success() {
            tracing::warn!(%method, path, status = status.as_u16(), "Router rejected request");
            return Err(Error::RemoteRejected {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(text)
    }

    fn configure(&self, endpoint: &RouterEndpoint) {
        tracing::info!(address = %endpoint.address, "Router endpoint updated");
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = endpoint.clone();
    }
}
