//! Authenticated Bitbucket REST transport
//!
//! [`BitbucketClient`] attaches the broker's credential to every request and
//! recovers once from a `401 Unauthorized` by discarding the credential and
//! re-authenticating. Any other failure, or a second `401`, is returned as
//! [`BitbucketError::Api`] with the status and the message Bitbucket gave.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::CredentialBroker;
use crate::config::ApiConfig;
use crate::error::{BitbucketError, Result};

/// Re-authentications allowed per logical request.
pub const MAX_AUTH_RETRIES: u32 = 1;

// ---------------------------------------------------------------------------
// RequestOptions
// ---------------------------------------------------------------------------

/// Method, body, headers, and query of one request.
///
/// Caller headers are applied after the defaults and replace them.
///
/// # Examples
///
/// ```
/// use bitbucket_mcp::api::RequestOptions;
///
/// let options = RequestOptions::post(serde_json::json!({ "title": "Fix build" }))
///     .header("X-Request-Source", "agent")
///     .query("fields", "id,title");
/// assert_eq!(options.method, reqwest::Method::POST);
/// ```
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// HTTP method
    pub method: Method,
    /// JSON body
    pub body: Option<Value>,
    /// Extra headers
    pub headers: HashMap<String, String>,
    /// Query parameters, in order
    pub query: Vec<(String, String)>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    /// Options for `method` with no body.
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: HashMap::new(),
            query: Vec::new(),
        }
    }

    /// A `GET` request.
    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    /// A `POST` request with a JSON body.
    pub fn post(body: Value) -> Self {
        Self::new(Method::POST).body(body)
    }

    /// A `PUT` request with a JSON body.
    pub fn put(body: Value) -> Self {
        Self::new(Method::PUT).body(body)
    }

    /// A `DELETE` request.
    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Sets the JSON body.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds or replaces a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

// ---------------------------------------------------------------------------
// BitbucketClient
// ---------------------------------------------------------------------------

/// HTTP client for the Bitbucket REST API.
///
/// # Examples
///
/// ```no_run
/// use bitbucket_mcp::api::BitbucketClient;
/// use bitbucket_mcp::auth::CredentialBroker;
/// use bitbucket_mcp::config::Config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::default();
/// let broker = CredentialBroker::new(&config, reqwest::Client::new())?;
/// let client = BitbucketClient::new(&config.api, broker)?;
///
/// let user = client.get("/user", &[]).await?;
/// println!("{}", user["display_name"]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct BitbucketClient {
    http: reqwest::Client,
    base_url: String,
    broker: CredentialBroker,
}

impl BitbucketClient {
    /// Creates a client with the configured base URL and request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ApiConfig, broker: CredentialBroker) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("bitbucket-mcp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BitbucketError::from)?;
        Ok(Self::with_http(http, config.base_url.clone(), broker))
    }

    /// Creates a client around an existing HTTP client.
    pub fn with_http(
        http: reqwest::Client,
        base_url: impl Into<String>,
        broker: CredentialBroker,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            broker,
        }
    }

    /// The broker supplying credentials.
    pub fn broker(&self) -> &CredentialBroker {
        &self.broker
    }

    /// Performs a request and parses the JSON response.
    ///
    /// An empty or `204 No Content` response yields an empty JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`BitbucketError::Api`] for a non-success status (after at
    /// most one re-authentication on `401`), the broker's error when no
    /// credential can be obtained, or a parse error for a non-JSON body.
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        match self.execute(endpoint, &options, false).await? {
            Some(body) if !body.trim().is_empty() => {
                Ok(serde_json::from_str(&body).map_err(BitbucketError::from)?)
            }
            _ => Ok(Value::Object(serde_json::Map::new())),
        }
    }

    /// Performs a request and returns the body as text.
    ///
    /// Used for file contents and diffs. No JSON headers are sent.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request), without the parse error.
    pub async fn request_raw(&self, endpoint: &str, options: RequestOptions) -> Result<String> {
        Ok(self
            .execute(endpoint, &options, true)
            .await?
            .unwrap_or_default())
    }

    /// `GET` with query parameters.
    pub async fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<Value> {
        self.request(endpoint, with_query(RequestOptions::get(), query))
            .await
    }

    /// `GET` deserialized into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let value = self.get(endpoint, query).await?;
        Ok(serde_json::from_value(value).map_err(BitbucketError::from)?)
    }

    /// `GET` returning raw text.
    pub async fn get_raw(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<String> {
        self.request_raw(endpoint, with_query(RequestOptions::get(), query))
            .await
    }

    /// `POST` a JSON body.
    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.request(endpoint, RequestOptions::post(body)).await
    }

    /// `PUT` a JSON body.
    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value> {
        self.request(endpoint, RequestOptions::put(body)).await
    }

    /// `DELETE` a resource.
    pub async fn delete(&self, endpoint: &str) -> Result<Value> {
        self.request(endpoint, RequestOptions::delete()).await
    }

    /// Sends the request, retrying once on `401` when re-authentication is
    /// possible. Returns `None` for `204 No Content`.
    async fn execute(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        raw: bool,
    ) -> Result<Option<String>> {
        let url = build_url(&self.base_url, endpoint, &options.query);
        let mut retries = 0;

        loop {
            let token = self.broker.get_access_token().await?;
            let headers = self.headers(&token, options, raw)?;

            let mut request = self
                .http
                .request(options.method.clone(), url.as_str())
                .headers(headers);
            if let Some(body) = &options.body {
                request = request.body(body.to_string());
            }

            tracing::debug!("{} {}", options.method, url);
            let response = request.send().await.map_err(BitbucketError::from)?;
            let status = response.status();

            if status == StatusCode::NO_CONTENT {
                return Ok(None);
            }
            if status.is_success() {
                let body = response.text().await.map_err(BitbucketError::from)?;
                return Ok(Some(body));
            }

            let body = response.text().await.unwrap_or_default();
            let message = error_message(status, &body);

            if status == StatusCode::UNAUTHORIZED
                && retries < MAX_AUTH_RETRIES
                && self.broker.has_interactive_credentials()
            {
                tracing::warn!("Bitbucket rejected the credential, re-authenticating");
                self.broker.clear_auth_if(&token);
                retries += 1;
                continue;
            }

            return Err(BitbucketError::Api {
                status: status.as_u16(),
                message,
            }
            .into());
        }
    }

    fn headers(&self, token: &str, options: &RequestOptions, raw: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let authorization = match self.broker.basic_username() {
            Some(username) => format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(format!("{username}:{token}"))
            ),
            None => format!("Bearer {token}"),
        };
        let mut authorization = HeaderValue::from_str(&authorization).map_err(|_| {
            BitbucketError::Config("credential contains characters not allowed in a header".into())
        })?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);

        if !raw {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| BitbucketError::Config(format!("invalid header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| BitbucketError::Config(format!("invalid value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

fn with_query(mut options: RequestOptions, query: &[(&str, &str)]) -> RequestOptions {
    options
        .query
        .extend(query.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    options
}

/// Absolute endpoints are used verbatim; others are joined to `base_url`.
fn build_url(base_url: &str, endpoint: &str, query: &[(String, String)]) -> String {
    let mut url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    };

    if !query.is_empty() {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query)
            .finish();
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(&encoded);
    }

    url
}

/// Message from Bitbucket's `{"error": {"message": ...}}` body, else the raw
/// body, else the status reason.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .pointer("/error/message")
            .or_else(|| json.get("error_description"))
            .or_else(|| json.get("message"))
            .and_then(Value::as_str);
        if let Some(message) = message {
            return message.to_string();
        }
    }

    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}
