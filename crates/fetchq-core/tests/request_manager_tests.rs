//! Integration tests for the RequestManager public interface.
//!
//! These tests drive the manager through a scripted in-memory transport so
//! every status code, transport failure and timing is deterministic.

use async_trait::async_trait;
use bytes::Bytes;
use fetchq_core::network::StaticProbe;
use fetchq_core::{
    ActivitySignal, MessageKey, NetError, ProxySetting, Reporter, RequestDescriptor,
    RequestManager, RequestManagerOptions, ResponseBody, ResponseProcessor, Transport,
    TransportError, TransportErrorCode, TransportRequest, TransportResponse,
};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
enum Reply {
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<&'static str>,
    },
    Fail(TransportErrorCode),
}

fn respond(status: u16, body: &'static str) -> Reply {
    Reply::Respond {
        status,
        headers: Vec::new(),
        chunks: vec![body],
    }
}

/// Transport answering from per-URL scripts. The last reply of a script
/// repeats forever.
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    delay: Duration,
    calls: Mutex<Vec<TransportRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn script(self, url: &str, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    fn calls(&self) -> Vec<TransportRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(replies) if replies.len() > 1 => replies.pop_front().unwrap(),
            Some(replies) => replies.front().cloned().unwrap_or_else(|| respond(200, "")),
            None => respond(200, "{}"),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let url = request.url.clone();
        self.calls.lock().unwrap().push(request);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.next_reply(&url) {
            Reply::Fail(code) => Err(TransportError::new(code, format!("{} failed", url))),
            Reply::Respond {
                status,
                headers,
                chunks,
            } => {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.insert(
                        HeaderName::from_static(name),
                        HeaderValue::from_static(value),
                    );
                }
                let chunks: Vec<Result<Bytes, TransportError>> = chunks
                    .into_iter()
                    .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                    .collect();
                Ok(TransportResponse {
                    status,
                    headers: map,
                    body: futures::stream::iter(chunks).boxed(),
                })
            }
        }
    }
}

/// Reporter that records every message by level.
#[derive(Default)]
struct RecordingReporter {
    messages: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingReporter {
    fn at(&self, level: &str) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn verbose(&self, msg: &str) {
        self.messages.lock().unwrap().push(("verbose", msg.to_string()));
    }
    fn info(&self, msg: &str) {
        self.messages.lock().unwrap().push(("info", msg.to_string()));
    }
    fn warn(&self, msg: &str) {
        self.messages.lock().unwrap().push(("warn", msg.to_string()));
    }
    fn error(&self, msg: &str) {
        self.messages.lock().unwrap().push(("error", msg.to_string()));
    }
}

fn manager_with(
    transport: Arc<ScriptedTransport>,
    reporter: Arc<RecordingReporter>,
) -> RequestManager {
    let manager = RequestManager::with_probe(transport, reporter, Arc::new(StaticProbe(false)));
    manager.set_options(
        &RequestManagerOptions::new()
            .with_user_agent("fetchq-tests/1.0")
            .with_retry_delay(Duration::from_millis(10)),
    );
    manager
}

fn setup(transport: ScriptedTransport) -> (RequestManager, Arc<ScriptedTransport>, Arc<RecordingReporter>) {
    let transport = Arc::new(transport);
    let reporter = Arc::new(RecordingReporter::default());
    let manager = manager_with(transport.clone(), reporter.clone());
    (manager, transport, reporter)
}

const URL: &str = "https://registry.example.com/left-pad";

#[tokio::test]
async fn test_duplicate_requests_share_one_exchange() {
    let (manager, transport, _) = setup(
        ScriptedTransport::with_delay(Duration::from_millis(20))
            .script(URL, vec![respond(200, r#"{"name":"left-pad"}"#)]),
    );

    let first = manager.request(RequestDescriptor::get(URL).json());
    let second = manager.request(RequestDescriptor::get(URL).json());
    let third = manager.request(RequestDescriptor::get(URL).json());

    let (a, b, c) = tokio::join!(first, second, third);
    let expected = ResponseBody::Json(serde_json::json!({"name": "left-pad"}));
    assert_eq!(a.unwrap(), expected);
    assert_eq!(b.unwrap(), expected);
    assert_eq!(c.unwrap(), expected);

    // Completed outcomes are memoized too.
    manager.request(RequestDescriptor::get(URL)).await.unwrap();
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_transient_error_retried_until_budget_spent() {
    let (manager, transport, _) = setup(
        ScriptedTransport::new().script(URL, vec![Reply::Fail(TransportErrorCode::ConnectionReset)]),
    );
    manager.set_options(&RequestManagerOptions::new().with_max_retry_attempts(3));

    let err = manager.request(RequestDescriptor::get(URL)).await.unwrap_err();

    // One initial attempt plus max_retry_attempts - 1 retries.
    assert_eq!(transport.call_count(), 3);
    match &err {
        NetError::Transport { url, source } => {
            assert_eq!(url, URL);
            assert_eq!(source.code, Some(TransportErrorCode::ConnectionReset));
        }
        other => panic!("expected transport error, got {:?}", other),
    }
    assert_eq!(manager.stats().running, 0);
}

#[tokio::test]
async fn test_non_get_is_never_retried() {
    let (manager, transport, _) = setup(
        ScriptedTransport::new().script(URL, vec![Reply::Fail(TransportErrorCode::TimedOut)]),
    );

    let err = manager
        .request(
            RequestDescriptor::new(Method::PUT, URL).json_body(serde_json::json!({"name": "x"})),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, NetError::Transport { .. }));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_permanent_transport_error_rejects_immediately() {
    let (manager, transport, _) = setup(
        ScriptedTransport::new()
            .script(URL, vec![Reply::Fail(TransportErrorCode::ConnectionRefused)]),
    );

    let err = manager.request(RequestDescriptor::get(URL)).await.unwrap_err();
    assert!(err.to_string().starts_with(URL));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_concurrency_limit_respected() {
    let (manager, transport, _) =
        setup(ScriptedTransport::with_delay(Duration::from_millis(15)));
    manager.set_options(&RequestManagerOptions::new().with_concurrency(2));

    let futures: Vec<_> = (0..6)
        .map(|i| manager.request(RequestDescriptor::get(format!("{}/{}", URL, i))))
        .collect();
    assert!(manager.stats().running <= 2);

    for result in futures::future::join_all(futures).await {
        result.unwrap();
    }
    assert_eq!(transport.call_count(), 6);
    assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_queued_requests_start_in_fifo_order() {
    let (manager, transport, _) = setup(ScriptedTransport::with_delay(Duration::from_millis(2)));
    manager.set_options(&RequestManagerOptions::new().with_concurrency(1));

    let urls: Vec<String> = (0..5).map(|i| format!("{}/{}", URL, i)).collect();
    let futures: Vec<_> = urls
        .iter()
        .map(|url| manager.request(RequestDescriptor::get(url.clone())))
        .collect();
    futures::future::join_all(futures).await;

    let called: Vec<String> = transport.calls().into_iter().map(|r| r.url).collect();
    assert_eq!(called, urls);
}

#[tokio::test]
async fn test_server_error_retried_then_resolves() {
    let (manager, transport, reporter) = setup(
        ScriptedTransport::new().script(URL, vec![respond(500, ""), respond(200, r#"{"v":2}"#)]),
    );

    let body = manager
        .request(RequestDescriptor::get(URL).json())
        .await
        .unwrap();

    assert_eq!(body, ResponseBody::Json(serde_json::json!({"v": 2})));
    assert_eq!(transport.call_count(), 2);
    let info = reporter.at("info");
    assert_eq!(info.len(), 1);
    assert!(info[0].contains("500 Internal Server Error"));
}

#[tokio::test]
async fn test_server_error_exhausted_carries_status() {
    let (manager, transport, _) =
        setup(ScriptedTransport::new().script(URL, vec![respond(503, "")]));
    manager.set_options(&RequestManagerOptions::new().with_max_retry_attempts(2));

    let err = manager.request(RequestDescriptor::get(URL)).await.unwrap_err();
    assert_eq!(transport.call_count(), 2);
    assert_eq!(err.status(), Some(503));
    assert!(err.to_string().contains("Request failed 503 Service Unavailable"));
}

#[tokio::test]
async fn test_status_mapping() {
    let not_found = "https://registry.example.com/missing";
    let payment = "https://registry.example.com/paid";
    let otp = "https://registry.example.com/otp";
    let unauthorized = "https://registry.example.com/private";
    let (manager, _, _) = setup(
        ScriptedTransport::new()
            .script(not_found, vec![respond(404, "Not Found")])
            .script(payment, vec![respond(402, r#"{"message":"payment required"}"#)])
            .script(
                otp,
                vec![Reply::Respond {
                    status: 401,
                    headers: vec![("www-authenticate", "Basic, OTP")],
                    chunks: vec![""],
                }],
            )
            .script(unauthorized, vec![respond(401, "")]),
    );

    let body = manager.request(RequestDescriptor::get(not_found)).await.unwrap();
    assert!(body.is_not_found());

    let err = manager
        .request(RequestDescriptor::get(payment).json())
        .await
        .unwrap_err();
    assert!(matches!(&err, NetError::Request { status: 402, message, .. } if message == "payment required"));

    let err = manager.request(RequestDescriptor::get(otp)).await.unwrap_err();
    assert!(err.is_one_time_password());

    // A plain 401 is the "not found / unsupported" branch, not an OTP error.
    let body = manager.request(RequestDescriptor::get(unauthorized)).await.unwrap();
    assert_eq!(body, ResponseBody::NotFound(401));
}

#[tokio::test]
async fn test_extra_reject_status_resolves_not_found() {
    let (manager, _, _) = setup(ScriptedTransport::new().script(URL, vec![respond(406, "")]));
    let body = manager
        .request(RequestDescriptor::get(URL).reject_status(406))
        .await
        .unwrap();
    assert_eq!(body, ResponseBody::NotFound(406));
}

#[tokio::test]
async fn test_clear_cache_forces_new_exchange() {
    let (manager, transport, _) = setup(ScriptedTransport::new());

    manager.request(RequestDescriptor::get(URL)).await.unwrap();
    manager.request(RequestDescriptor::get(URL)).await.unwrap();
    assert_eq!(transport.call_count(), 1);

    manager.clear_cache();
    manager.request(RequestDescriptor::get(URL)).await.unwrap();
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_disabled_https_proxy_forwarded_explicitly() {
    let (manager, transport, _) = setup(ScriptedTransport::new());
    manager.set_options(
        &RequestManagerOptions::new()
            .with_http_proxy(ProxySetting::Url("http://proxy.internal:3128".into()))
            .with_https_proxy(ProxySetting::Disabled),
    );

    manager.request(RequestDescriptor::get(URL)).await.unwrap();
    manager
        .request(RequestDescriptor::get("http://mirror.example.com/a"))
        .await
        .unwrap();

    let calls = transport.calls();
    assert_eq!(calls[0].proxy, ProxySetting::Disabled);
    assert_eq!(calls[1].proxy.url(), Some("http://proxy.internal:3128"));
}

#[tokio::test]
async fn test_default_headers_merged_under_caller_headers() {
    let (manager, transport, _) = setup(ScriptedTransport::new());

    manager
        .request(RequestDescriptor::get(format!("{}/a", URL)).header("Accept", "application/json"))
        .await
        .unwrap();
    manager
        .request(RequestDescriptor::get(format!("{}/b", URL)).header("User-Agent", "custom/2.0"))
        .await
        .unwrap();

    let calls = transport.calls();
    assert_eq!(calls[0].headers["user-agent"], "fetchq-tests/1.0");
    assert_eq!(calls[0].headers["accept"], "application/json");
    assert_eq!(calls[1].headers["user-agent"], "custom/2.0");
    assert!(calls[0].keep_alive);
    assert!(calls[0].strict_ssl);
}

#[tokio::test]
async fn test_save_har_before_any_request() {
    let (manager, _, _) = setup(ScriptedTransport::new());
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("capture.har");

    let err = manager.save_har(&path).unwrap_err();
    assert!(matches!(err, NetError::Config { .. }));

    manager.set_options(&RequestManagerOptions::new().with_capture_har(true));
    manager.save_har(&path).unwrap();

    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(saved["log"]["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_har_records_and_clears_with_cache() {
    let (manager, _, _) = setup(ScriptedTransport::new().script(URL, vec![respond(200, "ok")]));
    manager.set_options(&RequestManagerOptions::new().with_capture_har(true));
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("capture.har");

    manager.request(RequestDescriptor::get(URL)).await.unwrap();
    manager.save_har(&path).unwrap();
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["log"]["entries"][0]["request"]["url"], URL);
    assert_eq!(saved["log"]["entries"][0]["response"]["content"]["text"], "ok");

    manager.clear_cache();
    manager.save_har(&path).unwrap();
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(saved["log"]["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_reason_reported_once_and_cleanup_runs() {
    let a = "https://registry.example.com/a";
    let b = "https://registry.example.com/b";
    let (manager, transport, reporter) = setup(
        ScriptedTransport::new()
            .script(a, vec![Reply::Fail(TransportErrorCode::ConnectionReset), respond(200, "a")])
            .script(b, vec![Reply::Fail(TransportErrorCode::SocketTimedOut), respond(200, "b")]),
    );

    let cleanups = Arc::new(AtomicUsize::new(0));
    let counter = cleanups.clone();
    let first = manager.request(RequestDescriptor::get(a).cleanup(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let second = manager.request(RequestDescriptor::get(b));

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().as_text(), Some("a"));
    assert_eq!(second.unwrap().as_text(), Some("b"));
    assert_eq!(transport.call_count(), 4);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    let retrying = reporter.lang(MessageKey::OfflineRetrying, &[]);
    let info = reporter.at("info");
    assert_eq!(info.iter().filter(|m| **m == retrying).count(), 1);
}

#[tokio::test]
async fn test_offline_mode_skips_network() {
    let (manager, transport, _) = setup(ScriptedTransport::new());
    manager.set_options(&RequestManagerOptions::new().with_offline(true));

    let err = manager.request(RequestDescriptor::get(URL)).await.unwrap_err();
    assert!(matches!(err, NetError::Offline { .. }));
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn test_missing_cafile_reported_not_fatal() {
    let (manager, _, reporter) = setup(ScriptedTransport::new());
    manager.set_options(
        &RequestManagerOptions::new()
            .with_cafile("/nonexistent/fetchq/ca.pem")
            .with_concurrency(3),
    );

    let errors = reporter.at("error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Could not open cafile:"));
    assert_eq!(manager.settings().concurrency, 3);
}

struct CountingSignal(AtomicUsize);

impl ActivitySignal for CountingSignal {
    fn still_active(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_data_events_feed_activity_signal() {
    let (manager, _, _) = setup(ScriptedTransport::new().script(
        URL,
        vec![Reply::Respond {
            status: 200,
            headers: Vec::new(),
            chunks: vec!["chunk-1", "chunk-2", "chunk-3"],
        }],
    ));
    let signal = Arc::new(CountingSignal(AtomicUsize::new(0)));

    let body = manager
        .request(RequestDescriptor::get(URL).queue(signal.clone()))
        .await
        .unwrap();
    assert_eq!(body.as_text(), Some("chunk-1chunk-2chunk-3"));
    assert_eq!(signal.0.load(Ordering::SeqCst), 3);
}

/// Processor that counts body bytes.
struct ByteCounter;

#[async_trait]
impl ResponseProcessor for ByteCounter {
    async fn process(&self, response: TransportResponse) -> fetchq_core::Result<ResponseBody> {
        let bytes = response
            .collect_body()
            .await
            .map_err(|e| NetError::transport(URL, e))?;
        Ok(ResponseBody::Text(bytes.len().to_string()))
    }
}

#[tokio::test]
async fn test_custom_processor_owns_success_and_is_not_cached() {
    let (manager, transport, _) =
        setup(ScriptedTransport::new().script(URL, vec![respond(200, "tarball-bytes")]));

    for _ in 0..2 {
        let body = manager
            .request(RequestDescriptor::get(URL).buffer().process(Arc::new(ByteCounter)))
            .await
            .unwrap();
        assert_eq!(body.as_text(), Some("13"));
    }
    assert_eq!(transport.call_count(), 2);
    assert_eq!(manager.stats().cached, 0);
}

#[tokio::test]
async fn test_custom_processor_rejects_non_success_status() {
    let (manager, transport, _) =
        setup(ScriptedTransport::new().script(URL, vec![respond(403, "forbidden")]));

    let err = manager
        .request(RequestDescriptor::get(URL).process(Arc::new(ByteCounter)))
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Response { status: 403, .. }));
    assert!(err.to_string().contains("403 Forbidden"));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn test_custom_processor_transport_failure_is_retried() {
    let (manager, transport, _) = setup(ScriptedTransport::new().script(
        URL,
        vec![
            Reply::Fail(TransportErrorCode::ConnectionReset),
            respond(200, "tarball"),
        ],
    ));

    let body = manager
        .request(RequestDescriptor::get(URL).process(Arc::new(ByteCounter)))
        .await
        .unwrap();
    assert_eq!(body.as_text(), Some("7"));
    assert_eq!(transport.call_count(), 2);
}

/// Processor that panics mid-response.
struct Exploding;

#[async_trait]
impl ResponseProcessor for Exploding {
    async fn process(&self, _response: TransportResponse) -> fetchq_core::Result<ResponseBody> {
        panic!("processor failed");
    }
}

#[tokio::test]
async fn test_panicking_processor_frees_its_slot() {
    let first_url = "https://registry.example.com/explodes";
    let (manager, transport, _) = setup(ScriptedTransport::new());
    manager.set_options(&RequestManagerOptions::new().with_concurrency(1));

    let err = manager
        .request(RequestDescriptor::get(first_url).process(Arc::new(Exploding)))
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Abandoned { .. }));

    let next = tokio::time::timeout(
        Duration::from_secs(2),
        manager.request(RequestDescriptor::get(URL)),
    )
    .await
    .expect("second request must not wait on a leaked slot");
    next.unwrap();

    assert_eq!(manager.stats().running, 0);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn test_panicking_cleanup_hook_frees_its_slot() {
    let (manager, _, _) = setup(
        ScriptedTransport::new().script(URL, vec![Reply::Fail(TransportErrorCode::ConnectionReset)]),
    );
    manager.set_options(&RequestManagerOptions::new().with_concurrency(1));

    let err = manager
        .request(RequestDescriptor::get(URL).cleanup(|| panic!("cleanup failed")))
        .await
        .unwrap_err();
    assert!(matches!(err, NetError::Abandoned { .. }));

    let other = "https://registry.example.com/other";
    tokio::time::timeout(
        Duration::from_secs(2),
        manager.request(RequestDescriptor::get(other)),
    )
    .await
    .expect("slot was not released")
    .unwrap();
    assert_eq!(manager.stats().running, 0);
}

#[tokio::test]
async fn test_mutating_request_not_shared_with_get() {
    let (manager, transport, _) = setup(ScriptedTransport::new());

    manager
        .request(RequestDescriptor::new(Method::PUT, URL).json_body(serde_json::json!({"v": 1})))
        .await
        .unwrap();
    manager.request(RequestDescriptor::get(URL)).await.unwrap();

    let methods: Vec<Method> = transport.calls().into_iter().map(|r| r.method).collect();
    assert_eq!(methods, vec![Method::PUT, Method::GET]);
    assert_eq!(manager.stats().cached, 1);
}

#[tokio::test]
async fn test_directly_inserted_headers_win_over_defaults() {
    let (manager, transport, _) = setup(ScriptedTransport::new());

    let mut descriptor = RequestDescriptor::get(URL);
    descriptor
        .headers
        .insert("User-Agent".to_string(), "custom/3.0".to_string());
    manager.request(descriptor).await.unwrap();

    let headers = &transport.calls()[0].headers;
    assert_eq!(headers.len(), 1);
    assert_eq!(headers["user-agent"], "custom/3.0");
}
