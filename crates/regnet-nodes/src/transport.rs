//! HTTP transport seam between the adapters and the node processes.
//!
//! Adapters describe each call as an [`HttpRequest`] and hand it to an
//! [`HttpTransport`]. The production transport is [`ReqwestTransport`];
//! tests swap in an in-memory one.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regnet_core::{Error, Result};
use serde_json::Value;
use tracing::trace;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
    /// DELETE.
    Delete,
}

/// How a macaroon file is rendered into its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacaroonEncoding {
    /// Lowercase hex.
    Hex,
    /// Standard base64.
    Base64,
}

/// Credentials attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// No credentials.
    None,
    /// HTTP basic auth.
    Basic {
        /// User name.
        user: String,
        /// Password.
        password: String,
    },
    /// A macaroon file, read when the request is sent.
    Macaroon {
        /// Header carrying the macaroon.
        header: String,
        /// Macaroon file on disk.
        path: PathBuf,
        /// Header encoding.
        encoding: MacaroonEncoding,
    },
}

impl Auth {
    /// Basic auth from a user and password.
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            user: user.into(),
            password: password.into(),
        }
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No body.
    Empty,
    /// `application/json`.
    Json(Value),
    /// `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
}

/// How much of the response body to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// The whole body.
    #[default]
    Full,
    /// Only the first newline-delimited message of a streaming response.
    FirstMessage,
}

/// A single call to a node process.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Credentials.
    pub auth: Auth,
    /// Payload.
    pub body: Body,
    /// How much of the response to read.
    pub response: ResponseMode,
}

impl HttpRequest {
    /// A request with no body or credentials.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            auth: Auth::None,
            body: Body::Empty,
            response: ResponseMode::Full,
        }
    }

    /// A GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// A POST request.
    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    /// A DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach credentials.
    #[must_use]
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    /// Send a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    /// Send a form body.
    #[must_use]
    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Body::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Only read the first message of a streaming response.
    #[must_use]
    pub const fn first_message(mut self) -> Self {
        self.response = ResponseMode::FirstMessage;
        self
    }

    fn authority_and_path(&self) -> (&str, &str) {
        let rest = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        rest.find('/')
            .map_or((rest, "/"), |index| (&rest[..index], &rest[index..]))
    }

    /// Path component of the URL, starting with `/`.
    pub fn path(&self) -> &str {
        self.authority_and_path().1
    }

    /// Port component of the URL.
    pub fn port(&self) -> Option<u16> {
        self.authority_and_path()
            .0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }

    /// Look up a form field by name.
    pub fn form_field(&self, name: &str) -> Option<&str> {
        match &self.body {
            Body::Form(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// The JSON body, or `Null` for other bodies.
    pub fn json_body(&self) -> &Value {
        match &self.body {
            Body::Json(value) => value,
            _ => &NULL,
        }
    }
}

static NULL: Value = Value::Null;

/// Sends requests to node processes.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send `request` and return the decoded JSON response.
    ///
    /// Fails with [`Error::Transport`] when the node cannot be reached and
    /// [`Error::Http`] when it answers with an error status.
    async fn send(&self, request: HttpRequest) -> Result<Value>;
}

/// Production transport backed by [`reqwest`].
///
/// Nodes serve their REST APIs with self-signed certificates, so certificate
/// validation is disabled.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with a fresh connection pool.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

async fn read_macaroon(path: &Path, encoding: MacaroonEncoding) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(match encoding {
        MacaroonEncoding::Hex => hex::encode(bytes),
        MacaroonEncoding::Base64 => STANDARD.encode(bytes),
    })
}

async fn read_first_message(mut response: reqwest::Response) -> Result<String> {
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?
    {
        buffer.extend_from_slice(&chunk);
        if let Some(end) = buffer.iter().position(|b| *b == b'\n') {
            buffer.truncate(end);
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Pull the node's own error message out of an error response body.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        json.pointer("/error/message")
            .or_else(|| json.get("message"))
            .or_else(|| json.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    from_json.unwrap_or_else(|| {
        let raw = body.trim();
        if raw.is_empty() {
            format!("request failed with status {status}")
        } else {
            raw.to_string()
        }
    })
}

/// Decode a successful response body. Non-JSON bodies come back as a string.
pub(crate) fn parse_body(body: &str) -> Value {
    let body = body.trim();
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<Value> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };
        trace!(%method, url = %request.url, "sending request");

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match &request.auth {
            Auth::None => builder,
            Auth::Basic { user, password } => builder.basic_auth(user, Some(password)),
            Auth::Macaroon {
                header,
                path,
                encoding,
            } => builder.header(header, read_macaroon(path, *encoding).await?),
        };
        builder = match &request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(value),
            Body::Form(fields) => builder.form(fields),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = response.status();
        let body = match request.response {
            ResponseMode::Full => response
                .text()
                .await
                .map_err(|e| Error::Transport(e.to_string()))?,
            ResponseMode::FirstMessage => read_first_message(response).await?,
        };

        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                message: error_message(status.as_u16(), &body),
            });
        }
        Ok(parse_body(&body))
    }
}
