//! Single-attempt execution of a queued request.
//!
//! The executor turns a descriptor plus the current settings into transport
//! parameters, runs one exchange, and decides whether the attempt settled
//! (resolve or reject) or should be retried. Retry bookkeeping itself lives
//! with the manager.

use crate::config::{NetworkConfig, Settings};
use crate::network::classifier::ErrorClassifier;
use crate::network::descriptor::{RequestDescriptor, ResponseBody, ResponseHandler};
use crate::network::transport::{
    Transport, TransportError, TransportRequest, TransportResponse,
};
use crate::reporter::{MessageKey, Reporter};
use crate::{NetError, Result};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::StatusCode;
use tracing::debug;

/// Result of one attempt.
#[derive(Debug)]
pub(crate) enum Attempt {
    Settled(Result<ResponseBody>),
    /// Transient failure; `failure` is what the caller sees if the retry
    /// budget is already spent.
    Retry { reason: String, failure: NetError },
}

/// The parts of a response head the status mapping looks at.
#[derive(Debug, Clone, Default)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub server: Option<String>,
    pub www_authenticate: Option<String>,
}

impl ResponseHead {
    fn of(response: &TransportResponse) -> Self {
        Self {
            status: response.status,
            server: response.header("server").map(str::to_string),
            www_authenticate: response.header("www-authenticate").map(str::to_string),
        }
    }

    fn requires_otp(&self) -> bool {
        self.www_authenticate.as_deref().is_some_and(|challenge| {
            challenge
                .split(',')
                .map(|method| method.trim().to_lowercase())
                .any(|method| method == "otp")
        })
    }
}

/// "500 Internal Server Error" style description.
pub(crate) fn status_description(status: u16) -> String {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    format!("{} {}", status, reason)
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

pub(crate) struct RequestExecutor<'a> {
    pub reporter: &'a dyn Reporter,
    pub classifier: &'a ErrorClassifier,
    pub settings: &'a Settings,
}

impl RequestExecutor<'_> {
    /// Transport parameters for `descriptor` under the current settings.
    pub fn build_request(&self, descriptor: &RequestDescriptor) -> TransportRequest {
        let settings = self.settings;
        TransportRequest {
            url: descriptor.url.clone(),
            method: descriptor.method.clone(),
            headers: descriptor.headers.clone(),
            body: descriptor.body.clone(),
            proxy: settings.proxy_for(&descriptor.url).clone(),
            strict_ssl: settings.strict_ssl,
            ca: settings.ca.clone(),
            cert: settings.cert.clone(),
            key: settings.key.clone(),
            timeout: settings.timeout,
            keep_alive: true,
            encoding: descriptor.encoding(),
        }
    }

    pub async fn run(&self, transport: &dyn Transport, descriptor: &RequestDescriptor) -> Attempt {
        let request = self.build_request(descriptor);
        self.reporter.verbose(&self.reporter.lang(
            MessageKey::VerboseRequestStart,
            &[descriptor.method.as_str(), &descriptor.url],
        ));

        let mut response = match transport.send(request).await {
            Ok(response) => response,
            Err(err) => return self.transport_failure(descriptor, err),
        };

        if let Some(signal) = descriptor.queue.clone() {
            response.body = response
                .body
                .inspect(move |_| signal.still_active())
                .boxed();
        }

        match &descriptor.handler {
            ResponseHandler::Default => self.handle_default(descriptor, response).await,
            ResponseHandler::Custom(processor) => {
                if !(200..300).contains(&response.status) {
                    let status = response.status;
                    // Dropping the response aborts the exchange.
                    drop(response);
                    return Attempt::Settled(Err(self.request_failed(descriptor, status)));
                }
                match processor.process(response).await {
                    Err(NetError::Transport { source, .. }) => {
                        self.transport_failure(descriptor, source)
                    }
                    outcome => Attempt::Settled(outcome),
                }
            }
        }
    }

    fn transport_failure(&self, descriptor: &RequestDescriptor, err: TransportError) -> Attempt {
        let err = match (&err.hostname, host_of(&descriptor.url)) {
            (None, Some(host)) => err.with_hostname(host),
            _ => err,
        };
        debug!("{} failed: {} ({:?})", descriptor.url, err, err.code);

        let transient = self.classifier.is_possible_offline_error(&err);
        let failure = NetError::transport(descriptor.url.clone(), err);
        if transient {
            Attempt::Retry {
                reason: self.reporter.lang(MessageKey::OfflineRetrying, &[]),
                failure,
            }
        } else {
            Attempt::Settled(Err(failure))
        }
    }

    fn request_failed(&self, descriptor: &RequestDescriptor, status: u16) -> NetError {
        NetError::Response {
            url: descriptor.url.clone(),
            status,
            message: self
                .reporter
                .lang(MessageKey::RequestFailed, &[&status_description(status)]),
        }
    }

    async fn handle_default(
        &self,
        descriptor: &RequestDescriptor,
        response: TransportResponse,
    ) -> Attempt {
        let head = ResponseHead::of(&response);
        let bytes = match response.collect_body().await {
            Ok(bytes) => bytes,
            Err(err) => return self.transport_failure(descriptor, err),
        };

        if let Some(host) = host_of(&descriptor.url) {
            self.classifier.record_success(&host);
        }
        self.reporter.verbose(&self.reporter.lang(
            MessageKey::VerboseRequestFinish,
            &[&descriptor.url, &head.status.to_string()],
        ));

        self.interpret(descriptor, &head, decode_body(descriptor, bytes))
    }

    /// Map a complete response onto an outcome.
    pub fn interpret(
        &self,
        descriptor: &RequestDescriptor,
        head: &ResponseHead,
        body: ResponseBody,
    ) -> Attempt {
        let status = head.status;
        let url = &descriptor.url;

        if status == 408 || status >= 500 {
            let description = status_description(status);
            return Attempt::Retry {
                reason: self
                    .reporter
                    .lang(MessageKey::InternalServerErrorRetrying, &[&description]),
                failure: self.request_failed(descriptor, status),
            };
        }

        if status == 401 {
            if let Some(server) = head
                .server
                .as_deref()
                .filter(|server| *server == NetworkConfig::GITHUB_SERVER)
            {
                let detail = body.json_str_field("message").unwrap_or_default();
                let message = format!("{}. {}", detail, NetworkConfig::GITHUB_TOKEN_HINT);
                return Attempt::Settled(Err(NetError::Unauthorized {
                    server: server.to_string(),
                    message: self
                        .reporter
                        .lang(MessageKey::UnauthorizedResponse, &[server, &message]),
                }));
            }

            if head.requires_otp() {
                return Attempt::Settled(Err(NetError::OneTimePassword {
                    url: url.clone(),
                    message: self.reporter.lang(MessageKey::OneTimePasswordRequired, &[]),
                }));
            }
        }

        if let Some(message) = body.json_str_field("error") {
            return Attempt::Settled(Err(NetError::ServerBody {
                url: url.clone(),
                message,
            }));
        }

        if NetworkConfig::NOT_FOUND_STATUSES.contains(&status)
            || descriptor.reject_status_codes.contains(&status)
        {
            return Attempt::Settled(Ok(ResponseBody::NotFound(status)));
        }

        if status >= 400 {
            let message = body.json_str_field("message").unwrap_or_else(|| {
                self.reporter
                    .lang(MessageKey::RequestError, &[url, &status.to_string()])
            });
            return Attempt::Settled(Err(NetError::Request {
                url: url.clone(),
                status,
                message,
            }));
        }

        Attempt::Settled(Ok(body))
    }
}

fn decode_body(descriptor: &RequestDescriptor, bytes: Bytes) -> ResponseBody {
    if descriptor.buffer {
        return ResponseBody::Bytes(bytes);
    }
    let text = String::from_utf8_lossy(&bytes).into_owned();
    if descriptor.json && !text.trim().is_empty() {
        if let Ok(value) = serde_json::from_str(&text) {
            return ResponseBody::Json(value);
        }
    }
    ResponseBody::Text(text)
}
