//! Caller-side description of a single HTTP exchange.

use crate::network::transport::{BodyEncoding, Headers, RequestBody, TransportResponse};
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use std::fmt;
use std::sync::Arc;

/// Value a request resolves with.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
    /// The server answered with a "not found / unsupported" status. This is
    /// a normal outcome, not an error.
    NotFound(u16),
}

impl ResponseBody {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ResponseBody::NotFound(_))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// String field of a JSON object body. Text bodies are parsed on demand.
    pub fn json_str_field(&self, field: &str) -> Option<String> {
        let parsed;
        let value = match self {
            ResponseBody::Json(value) => value,
            ResponseBody::Text(text) => {
                parsed = serde_json::from_str::<serde_json::Value>(text).ok()?;
                &parsed
            }
            _ => return None,
        };
        value.get(field)?.as_str().map(str::to_string)
    }
}

/// Liveness sink fed by transport data events, so an external watchdog can
/// tell a slow-but-alive download from a stalled one.
pub trait ActivitySignal: Send + Sync {
    fn still_active(&self);
}

/// Custom response interpretation; receives the raw response stream.
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    async fn process(&self, response: TransportResponse) -> Result<ResponseBody>;
}

/// How a response is turned into an outcome.
#[derive(Clone, Default)]
pub enum ResponseHandler {
    /// Status-code mapping with JSON/text/bytes body decoding.
    #[default]
    Default,
    /// The processor owns the response once it has a 2xx status.
    Custom(Arc<dyn ResponseProcessor>),
}

impl fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseHandler::Default => write!(f, "Default"),
            ResponseHandler::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Callback releasing resources held by a previous attempt.
pub type Cleanup = Arc<dyn Fn() + Send + Sync>;

/// Everything needed to issue one HTTP exchange.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub url: String,
    pub method: Method,
    pub headers: Headers,
    pub body: RequestBody,
    /// Parse the body as JSON when possible.
    pub json: bool,
    /// Suppress text decoding.
    pub buffer: bool,
    pub handler: ResponseHandler,
    pub queue: Option<Arc<dyn ActivitySignal>>,
    /// Extra statuses resolved as `NotFound` instead of rejected.
    pub reject_status_codes: Vec<u16>,
    pub retry_attempts: u32,
    pub cleanup: Option<Cleanup>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Headers::new(),
            body: RequestBody::Empty,
            json: false,
            buffer: false,
            handler: ResponseHandler::Default,
            queue: None,
            reject_status_codes: Vec::new(),
            retry_attempts: 0,
            cleanup: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Set a header; names are case-insensitive.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Decode the response as JSON.
    pub fn json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn json_body(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self.json = true;
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn body(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes(bytes.into());
        self
    }

    pub fn buffer(mut self) -> Self {
        self.buffer = true;
        self
    }

    pub fn reject_status(mut self, status: u16) -> Self {
        self.reject_status_codes.push(status);
        self
    }

    pub fn queue(mut self, signal: Arc<dyn ActivitySignal>) -> Self {
        self.queue = Some(signal);
        self
    }

    pub fn cleanup(mut self, cleanup: impl Fn() + Send + Sync + 'static) -> Self {
        self.cleanup = Some(Arc::new(cleanup));
        self
    }

    pub fn process(mut self, processor: Arc<dyn ResponseProcessor>) -> Self {
        self.handler = ResponseHandler::Custom(processor);
        self
    }

    /// Only default-handled GETs can be replayed to other callers.
    pub fn is_cacheable(&self) -> bool {
        self.is_get() && matches!(self.handler, ResponseHandler::Default)
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    pub fn encoding(&self) -> BodyEncoding {
        if self.buffer {
            BodyEncoding::Buffer
        } else {
            BodyEncoding::Text
        }
    }
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("handler", &self.handler)
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}
