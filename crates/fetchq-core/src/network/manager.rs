//! RequestManager - the single entry point for outbound HTTP work.
//!
//! Provides:
//! - Offline-mode fast failure
//! - Per-URL deduplication of in-flight and completed requests
//! - Bounded concurrency with FIFO admission
//! - Automatic retry of transient failures after a quiescence delay
//! - Lazy transport construction with optional HAR capture

use crate::config::{RequestManagerOptions, Settings};
use crate::network::cache::{ResponseCache, ResponseFuture};
use crate::network::classifier::{ConnectivityProbe, ErrorClassifier, RouteProbe};
use crate::network::descriptor::RequestDescriptor;
use crate::network::executor::{Attempt, RequestExecutor};
use crate::network::gate::{ConcurrencyGate, QueueEntry};
use crate::network::har::HarCapture;
use crate::network::retry::{RetryPolicy, RetryScheduler};
use crate::network::transport::{ReqwestTransport, Transport};
use crate::reporter::{MessageKey, Reporter, TracingReporter};
use crate::{NetError, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Snapshot of the manager's queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestManagerStats {
    /// Entries holding an execution slot (includes those awaiting retry).
    pub running: usize,
    /// Entries waiting for a slot.
    pub queued: usize,
    /// Entries parked in the retry queue.
    pub awaiting_retry: usize,
    /// URLs with a memoized outcome.
    pub cached: usize,
}

/// The transport actually used, fixed on first use.
struct ActiveTransport {
    transport: Arc<dyn Transport>,
    har: Option<Arc<HarCapture>>,
}

struct ManagerInner {
    reporter: Arc<dyn Reporter>,
    settings: RwLock<Settings>,
    gate: ConcurrencyGate,
    cache: ResponseCache,
    retries: RetryScheduler,
    classifier: ErrorClassifier,
    base_transport: Arc<dyn Transport>,
    active: OnceLock<ActiveTransport>,
}

/// Queues, throttles, memoizes and retries HTTP requests.
///
/// Cloning is cheap; clones share all state. Requests must be issued from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<ManagerInner>,
}

impl RequestManager {
    /// Create a manager over `transport`, probing connectivity via the OS
    /// routing table.
    pub fn new(transport: Arc<dyn Transport>, reporter: Arc<dyn Reporter>) -> Self {
        Self::with_probe(transport, reporter, Arc::new(RouteProbe::default()))
    }

    /// Create a manager with a custom connectivity probe.
    pub fn with_probe(
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn Reporter>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let settings = Settings::default();
        Self {
            inner: Arc::new(ManagerInner {
                reporter,
                gate: ConcurrencyGate::new(settings.concurrency),
                settings: RwLock::new(settings),
                cache: ResponseCache::new(),
                retries: RetryScheduler::new(),
                classifier: ErrorClassifier::new(probe),
                base_transport: transport,
                active: OnceLock::new(),
            }),
        }
    }

    /// Create a manager over the reqwest transport, logging via `tracing`.
    pub fn with_reqwest() -> Self {
        Self::new(Arc::new(ReqwestTransport::new()), Arc::new(TracingReporter))
    }

    /// Apply a partial option set. Failing to read a CA file is reported,
    /// not returned.
    pub fn set_options(&self, options: &RequestManagerOptions) {
        let result = {
            let mut settings = self.inner.settings.write().unwrap();
            let result = settings.apply(options);
            self.inner.gate.set_limit(settings.concurrency);
            result
        };

        if let Err(err) = result {
            let reason = match &err {
                NetError::Io { message, .. } => message.clone(),
                other => other.to_string(),
            };
            self.inner
                .reporter
                .error(&self.inner.reporter.lang(MessageKey::CouldNotOpenCafile, &[&reason]));
        }

        // A raised limit may free slots for waiting entries.
        self.inner.admit();
    }

    /// Current effective settings.
    pub fn settings(&self) -> Settings {
        self.inner.settings.read().unwrap().clone()
    }

    /// Queue up a request.
    ///
    /// Requests without a custom processor are memoized by URL: every
    /// caller asking for a URL already requested gets the same outcome from
    /// a single exchange, until `clear_cache` is called.
    pub fn request(&self, descriptor: RequestDescriptor) -> ResponseFuture {
        let offline = self.inner.settings.read().unwrap().offline;
        if offline {
            let message = self
                .inner
                .reporter
                .lang(MessageKey::CantRequestOffline, &[&descriptor.url]);
            let err = NetError::Offline {
                url: descriptor.url,
                message,
            };
            return async move { Err(err) }.boxed().shared();
        }

        if !descriptor.is_cacheable() {
            return self.enqueue(descriptor);
        }

        let url = descriptor.url.clone();
        let (future, hit) = self
            .inner
            .cache
            .get_or_insert_with(&url, || self.enqueue(descriptor));
        if hit {
            debug!("Request cache hit for {}", url);
        }
        future
    }

    fn enqueue(&self, mut descriptor: RequestDescriptor) -> ResponseFuture {
        let user_agent = self.inner.settings.read().unwrap().user_agent.clone();
        descriptor.retry_attempts = 0;
        // Callers may fill `headers` directly; defaults only apply to names
        // they did not set, whatever case the caller used.
        descriptor.headers = std::mem::take(&mut descriptor.headers)
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        descriptor
            .headers
            .entry("user-agent".to_string())
            .or_insert(user_agent);

        let url = descriptor.url.clone();
        let (tx, rx) = oneshot::channel();
        self.inner.gate.push(QueueEntry::new(descriptor, tx));
        self.inner.admit();

        async move { rx.await.unwrap_or(Err(NetError::Abandoned { url })) }
            .boxed()
            .shared()
    }

    /// Clear the request cache, and the HAR recording if one is active.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        if let Some(har) = self.inner.active.get().and_then(|a| a.har.as_ref()) {
            har.clear();
        }
    }

    /// Save captured traffic. Requires HAR capture to have been enabled.
    pub fn save_har(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.inner.settings.read().unwrap().capture_har {
            return Err(NetError::config(
                self.inner
                    .reporter
                    .lang(MessageKey::RequestManagerNotSetupHar, &[]),
            ));
        }

        // No request may have occurred at all.
        match &self.inner.active_transport().har {
            Some(har) => har.save_har(path),
            None => Err(NetError::config(
                "HAR capture was enabled after the transport was created",
            )),
        }
    }

    /// Snapshot of running, queued, parked and cached requests.
    pub fn stats(&self) -> RequestManagerStats {
        RequestManagerStats {
            running: self.inner.gate.running(),
            queued: self.inner.gate.queued(),
            awaiting_retry: self.inner.retries.pending(),
            cached: self.inner.cache.len(),
        }
    }
}

impl ManagerInner {
    fn active_transport(&self) -> &ActiveTransport {
        self.active.get_or_init(|| {
            let capture = self.settings.read().unwrap().capture_har;
            if capture {
                info!("Capturing HTTP traffic for HAR export");
                let har = Arc::new(HarCapture::new(self.base_transport.clone()));
                ActiveTransport {
                    transport: har.clone(),
                    har: Some(har),
                }
            } else {
                ActiveTransport {
                    transport: self.base_transport.clone(),
                    har: None,
                }
            }
        })
    }

    /// Start as many queued entries as there are free slots.
    fn admit(self: &Arc<Self>) {
        while let Some(entry) = self.gate.next_admission() {
            self.spawn_execute(entry);
        }
    }

    /// Run `entry` on its own task. A panic inside the attempt (a custom
    /// processor or cleanup hook) drops the entry, which answers its caller
    /// with `Abandoned`; the slot it held is still given back.
    fn spawn_execute(self: &Arc<Self>, entry: QueueEntry) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let url = entry.descriptor.url.clone();
            let attempt = AssertUnwindSafe(Arc::clone(&inner).execute(entry));
            if attempt.catch_unwind().await.is_err() {
                warn!("Request to {} panicked, releasing its slot", url);
                inner.gate.release();
                inner.admit();
            }
        });
    }

    async fn execute(self: Arc<Self>, entry: QueueEntry) {
        let settings = self.settings.read().unwrap().clone();
        let transport = self.active_transport().transport.clone();
        let executor = RequestExecutor {
            reporter: self.reporter.as_ref(),
            classifier: &self.classifier,
            settings: &settings,
        };

        match executor.run(transport.as_ref(), &entry.descriptor).await {
            Attempt::Settled(outcome) => self.finish(entry, outcome),
            Attempt::Retry { reason, failure } => {
                let policy = RetryPolicy::new(settings.max_retry_attempts, settings.retry_delay);
                self.queue_for_retry(entry, reason, failure, policy);
            }
        }
    }

    fn finish(self: &Arc<Self>, entry: QueueEntry, outcome: Result<crate::ResponseBody>) {
        entry.settle(outcome);
        self.gate.release();
        self.admit();
    }

    /// Park `entry` for a later attempt, or settle it with `failure` when it
    /// may not be retried. The entry keeps its slot while parked.
    fn queue_for_retry(
        self: &Arc<Self>,
        mut entry: QueueEntry,
        reason: String,
        failure: NetError,
        policy: RetryPolicy,
    ) {
        let descriptor = &mut entry.descriptor;
        if !policy.allows(descriptor.is_get(), descriptor.retry_attempts) {
            debug!(
                "Not retrying {} {} after {} attempts",
                descriptor.method, descriptor.url, descriptor.retry_attempts
            );
            return self.finish(entry, Err(failure));
        }

        descriptor.retry_attempts += 1;
        if let Some(cleanup) = &descriptor.cleanup {
            cleanup();
        }
        entry.retry_reason = Some(reason.clone());

        let plan = self.retries.enqueue(entry);
        if plan.announce {
            self.reporter.info(&reason);
        }
        if plan.start_timer {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(policy.quiescence).await;
                let entries = inner.retries.drain();
                debug!("Resubmitting {} queued retries", entries.len());
                for entry in entries {
                    inner.spawn_execute(entry);
                }
            });
        }
    }
}
