use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::{domain::FileId, error::ErrorBody, protocol::MessageResponse};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::error::TransportError;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// A query-string value. Absent and empty values are dropped from the request
/// instead of being serialised as placeholder text.
pub trait ParamValue {
    fn into_param(self) -> Option<String>;
}

impl ParamValue for &str {
    fn into_param(self) -> Option<String> {
        (!self.is_empty()).then(|| self.to_string())
    }
}

impl ParamValue for String {
    fn into_param(self) -> Option<String> {
        (!self.is_empty()).then_some(self)
    }
}

impl ParamValue for &String {
    fn into_param(self) -> Option<String> {
        self.as_str().into_param()
    }
}

macro_rules! numeric_param {
    ($($ty:ty),*) => {
        $(
            impl ParamValue for $ty {
                fn into_param(self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

numeric_param!(i32, i64, u32, u64, usize, bool, FileId);

impl<T: ParamValue> ParamValue for Option<T> {
    fn into_param(self) -> Option<String> {
        self.and_then(ParamValue::into_param)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ParamValue) -> Self {
        if let Some(value) = value.into_param() {
            self.0.push((key.to_string(), value));
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Opaque admin credential attached to sync requests.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: key.into().trim().to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty()
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        if self.is_empty() {
            return Vec::new();
        }
        vec![(API_KEY_HEADER.to_string(), self.api_key.clone())]
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.is_empty() { "<none>" } else { "<redacted>" })
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub cancel: Option<CancellationToken>,
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_credentials(mut self, credentials: &Credentials) -> Self {
        self.headers.extend(credentials.headers());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        path: &str,
        params: &QueryParams,
        options: RequestOptions,
    ) -> Result<Value, TransportError>;
    async fn post(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<MessageResponse, TransportError>;
    async fn delete(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<MessageResponse, TransportError>;
}

/// Validates a raw body against the expected wire type.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|err| TransportError::Validation(err.to_string()))
}

/// `get` followed by [`decode`].
pub async fn get_json<T: DeserializeOwned>(
    transport: &dyn Transport,
    path: &str,
    params: &QueryParams,
    options: RequestOptions,
) -> Result<T, TransportError> {
    let value = transport.get(path, params, options).await?;
    decode(value)
}

pub(crate) fn message_from(value: Value) -> Result<MessageResponse, TransportError> {
    if value.is_null() {
        return Ok(MessageResponse {
            message: String::new(),
        });
    }
    decode(value)
}

pub struct HttpTransport {
    http: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, None)
    }

    pub fn with_timeout(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .with_context(|| format!("invalid server url: {base_url}"))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("server_url must start with http:// or https://");
        }
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build http client")?;
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str, params: &QueryParams) -> Result<Url, TransportError> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|err| TransportError::Network(format!("invalid request path {path}: {err}")))?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params.iter() {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        mut request: RequestBuilder,
        url: &Url,
        options: RequestOptions,
    ) -> Result<Value, TransportError> {
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        debug!(%method, %url, "http: sending request");

        let exchange = async move {
            let response = request.send().await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            if !status.is_success() {
                let code = status.as_u16();
                return Err(TransportError::from_body(
                    code,
                    ErrorBody::from_slice_or_unknown(code, &bytes),
                ));
            }
            if bytes.is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_slice::<Value>(&bytes)
                .map_err(|err| TransportError::Validation(err.to_string()))
        };

        match options.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(TransportError::Cancelled),
                    result = exchange => result,
                }
            }
            None => exchange.await,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        path: &str,
        params: &QueryParams,
        options: RequestOptions,
    ) -> Result<Value, TransportError> {
        let url = self.url(path, params)?;
        let request = self.http.get(url.clone());
        self.execute(Method::GET, request, &url, options).await
    }

    async fn post(
        &self,
        path: &str,
        body: Value,
        options: RequestOptions,
    ) -> Result<MessageResponse, TransportError> {
        let url = self.url(path, &QueryParams::new())?;
        let request = self.http.post(url.clone()).json(&body);
        let value = self.execute(Method::POST, request, &url, options).await?;
        message_from(value)
    }

    async fn delete(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<MessageResponse, TransportError> {
        let url = self.url(path, &QueryParams::new())?;
        let request = self.http.delete(url.clone());
        let value = self.execute(Method::DELETE, request, &url, options).await?;
        message_from(value)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
