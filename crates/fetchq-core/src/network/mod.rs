//! Network request layer: scheduling, retries, memoization and transport.
//!
//! This module provides:
//! - `RequestManager`, the façade callers issue requests through
//! - Bounded-concurrency admission and an offline-retry queue
//! - Transient-error classification
//! - A pluggable `Transport` with a reqwest implementation and HAR capture

mod cache;
mod classifier;
mod descriptor;
mod executor;
mod gate;
mod har;
mod manager;
mod retry;
mod transport;

pub use cache::ResponseFuture;
pub use classifier::{ConnectivityProbe, ErrorClassifier, RouteProbe, StaticProbe};
pub use descriptor::{
    ActivitySignal, Cleanup, RequestDescriptor, ResponseBody, ResponseHandler, ResponseProcessor,
};
pub use har::{HarCapture, HarEntry};
pub use manager::{RequestManager, RequestManagerStats};
pub use retry::RetryPolicy;
pub use transport::{
    BodyEncoding, BodyStream, Headers, ReqwestTransport, RequestBody, Transport, TransportError,
    TransportErrorCode, TransportRequest, TransportResponse,
};
