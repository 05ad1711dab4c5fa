//! Observability collaborator.
//!
//! The request layer never depends on the reporter for correctness; every
//! method may be a no-op. Messages are looked up by `MessageKey` and
//! rendered with positional `$0`, `$1`, ... arguments.

use tracing::{debug, error, info, warn};

/// Identifiers for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    CantRequestOffline,
    OfflineRetrying,
    InternalServerErrorRetrying,
    RequestFailed,
    RequestError,
    UnauthorizedResponse,
    OneTimePasswordRequired,
    VerboseRequestStart,
    VerboseRequestFinish,
    RequestManagerNotSetupHar,
    CouldNotOpenCafile,
}

impl MessageKey {
    /// English template for this message.
    pub fn template(self) -> &'static str {
        match self {
            MessageKey::CantRequestOffline => "Can't make a request in offline mode ($0)",
            MessageKey::OfflineRetrying => {
                "There appears to be trouble with your network connection. Retrying..."
            }
            MessageKey::InternalServerErrorRetrying => {
                "There appears to be trouble with our server. Retrying... ($0)"
            }
            MessageKey::RequestFailed => "Request failed $0",
            MessageKey::RequestError => "Request $0 returned a $1",
            MessageKey::UnauthorizedResponse => "Received a 401 from $0. $1",
            MessageKey::OneTimePasswordRequired => "Two factor authentication enabled. One-time password required",
            MessageKey::VerboseRequestStart => "Performing $0 request to $1.",
            MessageKey::VerboseRequestFinish => "Request $0 finished with status $1.",
            MessageKey::RequestManagerNotSetupHar => {
                "RequestManager was not setup to capture HAR files"
            }
            MessageKey::CouldNotOpenCafile => "Could not open cafile: $0",
        }
    }
}

/// Substitute `$n` placeholders with positional arguments.
pub fn render(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            if let Some(index) = chars.peek().and_then(|d| d.to_digit(10)) {
                chars.next();
                match args.get(index as usize) {
                    Some(arg) => out.push_str(arg),
                    None => {
                        out.push('$');
                        out.push_str(&index.to_string());
                    }
                }
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Console/UI layer the request manager reports to.
pub trait Reporter: Send + Sync {
    fn verbose(&self, msg: &str);
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);

    /// Localized message lookup.
    fn lang(&self, key: MessageKey, args: &[&str]) -> String {
        render(key.template(), args)
    }
}

/// Reporter that forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn verbose(&self, msg: &str) {
        debug!("{}", msg);
    }

    fn info(&self, msg: &str) {
        info!("{}", msg);
    }

    fn warn(&self, msg: &str) {
        warn!("{}", msg);
    }

    fn error(&self, msg: &str) {
        error!("{}", msg);
    }
}

/// Reporter that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn verbose(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
}
