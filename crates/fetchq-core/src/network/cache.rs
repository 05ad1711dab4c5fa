//! Per-URL memoization of request outcomes.
//!
//! The first cacheable request for a URL stores its shared future; every
//! later request for that URL awaits the same future, so one network
//! exchange serves them all. Entries never expire; the cache is cleared as a
//! whole between resolution passes.

use crate::network::descriptor::ResponseBody;
use crate::Result;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Mutex;

/// Cloneable future for one request's outcome.
pub type ResponseFuture = Shared<BoxFuture<'static, Result<ResponseBody>>>;

#[derive(Default)]
pub(crate) struct ResponseCache {
    entries: Mutex<HashMap<String, ResponseFuture>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached future for `url`, or build, store and return one.
    ///
    /// `make` runs under the cache lock, so concurrent callers for the same
    /// URL cannot both miss.
    pub fn get_or_insert_with(
        &self,
        url: &str,
        make: impl FnOnce() -> ResponseFuture,
    ) -> (ResponseFuture, bool) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(hit) = entries.get(url) {
            return (hit.clone(), true);
        }
        let future = make();
        entries.insert(url.to_string(), future.clone());
        (future, false)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
