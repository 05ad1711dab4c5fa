//! fetchq Core - request scheduling and retry engine for package-manager traffic.
//!
//! Every outbound HTTP request made while resolving and fetching dependency
//! metadata and tarballs goes through a [`RequestManager`], which bounds
//! concurrency, collapses duplicate requests for the same URL, retries
//! transient failures after a quiescence delay, and applies proxy and TLS
//! configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use fetchq_core::{RequestDescriptor, RequestManager, RequestManagerOptions};
//!
//! #[tokio::main]
//! async fn main() -> fetchq_core::Result<()> {
//!     let manager = RequestManager::with_reqwest();
//!     manager.set_options(
//!         &RequestManagerOptions::new()
//!             .with_user_agent("fetchq/0.1")
//!             .with_concurrency(8),
//!     );
//!
//!     let body = manager
//!         .request(RequestDescriptor::get("https://registry.npmjs.org/left-pad").json())
//!         .await?;
//!     println!("{:?}", body.as_json().and_then(|v| v.get("name")));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod network;
pub mod reporter;

// Re-export commonly used types
pub use config::{split_pem_bundle, NetworkConfig, ProxySetting, RequestManagerOptions, Settings};
pub use error::{NetError, Result};
pub use network::{
    ActivitySignal, RequestDescriptor, RequestManager, RequestManagerStats, ResponseBody,
    ResponseFuture, ResponseProcessor, Transport, TransportError, TransportErrorCode,
    TransportRequest, TransportResponse,
};
pub use reporter::{MessageKey, NoopReporter, Reporter, TracingReporter};
