//! HAR capture of request/response traffic.
//!
//! `HarCapture` wraps another transport and records one HAR 1.2 entry per
//! exchange. Response bodies are captured chunk by chunk as the caller
//! consumes the stream, so streaming handlers see no extra buffering.

use crate::network::transport::{
    BodyEncoding, RequestBody, Transport, TransportError, TransportRequest, TransportResponse,
};
use crate::{NetError, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::StreamExt;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct HarHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub query_string: Vec<HarHeader>,
    pub cookies: Vec<HarHeader>,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: u16,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub cookies: Vec<HarHeader>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    /// Transport failure, when the exchange never got a response.
    #[serde(rename = "_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarTimings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: serde_json::Map<String, serde_json::Value>,
    pub timings: HarTimings,
}

#[derive(Debug, Serialize)]
struct HarCreator {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct HarLog {
    version: &'static str,
    creator: HarCreator,
    entries: Vec<HarEntry>,
}

#[derive(Debug, Serialize)]
struct HarDocument {
    log: HarLog,
}

type SharedEntry = Arc<Mutex<HarEntry>>;

/// Transport wrapper recording traffic as HAR entries.
pub struct HarCapture {
    inner: Arc<dyn Transport>,
    entries: Mutex<Vec<SharedEntry>>,
}

impl HarCapture {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn entries(&self) -> Vec<HarEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.lock().unwrap().clone())
            .collect()
    }

    /// Write the recording as a HAR JSON document.
    pub fn save_har(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let document = HarDocument {
            log: HarLog {
                version: "1.2",
                creator: HarCreator {
                    name: env!("CARGO_PKG_NAME"),
                    version: env!("CARGO_PKG_VERSION"),
                },
                entries: self.entries(),
            },
        };

        let contents = serde_json::to_string_pretty(&document)?;
        std::fs::write(path, contents).map_err(|e| NetError::io_with_path(e, path))?;
        info!(
            "Saved {} HAR entries to {}",
            document.log.entries.len(),
            path.display()
        );
        Ok(())
    }

    fn record(&self, entry: HarEntry) -> SharedEntry {
        let shared = Arc::new(Mutex::new(entry));
        self.entries.lock().unwrap().push(shared.clone());
        shared
    }
}

fn har_headers<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> Vec<HarHeader> {
    pairs
        .map(|(name, value)| HarHeader {
            name: name.to_string(),
            value: value.to_string(),
        })
        .collect()
}

fn response_headers(headers: &HeaderMap) -> Vec<HarHeader> {
    har_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    )
}

fn har_request(request: &TransportRequest) -> HarRequest {
    let query_string = url::Url::parse(&request.url)
        .map(|url| {
            url.query_pairs()
                .map(|(name, value)| HarHeader {
                    name: name.into_owned(),
                    value: value.into_owned(),
                })
                .collect()
        })
        .unwrap_or_default();

    let post_data = match &request.body {
        RequestBody::Empty => None,
        RequestBody::Json(value) => Some(HarPostData {
            mime_type: "application/json".to_string(),
            text: value.to_string(),
        }),
        RequestBody::Form(fields) => Some(HarPostData {
            mime_type: "application/x-www-form-urlencoded".to_string(),
            text: fields
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&"),
        }),
        RequestBody::Bytes(bytes) => Some(HarPostData {
            mime_type: "application/octet-stream".to_string(),
            text: String::from_utf8_lossy(bytes).into_owned(),
        }),
    };

    HarRequest {
        method: request.method.to_string(),
        url: request.url.clone(),
        http_version: "HTTP/1.1".to_string(),
        headers: har_headers(request.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))),
        query_string,
        cookies: Vec::new(),
        headers_size: -1,
        body_size: post_data.as_ref().map_or(0, |p| p.text.len() as i64),
        post_data,
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[async_trait]
impl Transport for HarCapture {
    async fn send(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let started_date_time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let start = Instant::now();
        let har_req = har_request(&request);
        let capture_text = request.encoding == BodyEncoding::Text;

        let result = self.inner.send(request).await;
        let wait = elapsed_ms(start);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.record(HarEntry {
                    started_date_time,
                    time: wait,
                    request: har_req,
                    response: HarResponse {
                        status: 0,
                        status_text: String::new(),
                        http_version: "HTTP/1.1".to_string(),
                        headers: Vec::new(),
                        cookies: Vec::new(),
                        content: HarContent {
                            size: 0,
                            mime_type: String::new(),
                            text: None,
                        },
                        redirect_url: String::new(),
                        headers_size: -1,
                        body_size: -1,
                        error: Some(err.to_string()),
                    },
                    cache: serde_json::Map::new(),
                    timings: HarTimings {
                        send: 0.0,
                        wait,
                        receive: 0.0,
                    },
                });
                return Err(err);
            }
        };

        let TransportResponse {
            status,
            headers,
            body,
        } = response;

        let status_text = reqwest::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string();
        let mime_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let redirect_url = headers
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let entry = self.record(HarEntry {
            started_date_time,
            time: wait,
            request: har_req,
            response: HarResponse {
                status,
                status_text,
                http_version: "HTTP/1.1".to_string(),
                headers: response_headers(&headers),
                cookies: Vec::new(),
                content: HarContent {
                    size: 0,
                    mime_type,
                    text: capture_text.then(String::new),
                },
                redirect_url,
                headers_size: -1,
                body_size: 0,
                error: None,
            },
            cache: serde_json::Map::new(),
            timings: HarTimings {
                send: 0.0,
                wait,
                receive: 0.0,
            },
        });
        debug!("HAR entry recorded for status {}", status);

        let body = body
            .inspect(move |chunk| {
                if let Ok(bytes) = chunk {
                    let mut entry = entry.lock().unwrap();
                    entry.response.content.size += bytes.len() as i64;
                    entry.response.body_size += bytes.len() as i64;
                    if let Some(text) = entry.response.content.text.as_mut() {
                        text.push_str(&String::from_utf8_lossy(bytes));
                    }
                    let total = elapsed_ms(start);
                    entry.time = total;
                    entry.timings.receive = total - entry.timings.wait;
                }
            })
            .boxed();

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
