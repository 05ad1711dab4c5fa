//! Centralized configuration for the request layer.
//!
//! This module provides configuration constants, the partial option set
//! accepted by `RequestManager::set_options`, and the settings those options
//! are folded into.

use crate::{NetError, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const DEFAULT_CONCURRENCY: usize = 8;
    pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;
    pub const RETRY_QUIESCENCE: Duration = Duration::from_secs(3);
    /// `Server` header value whose 401s carry a JSON message worth surfacing.
    pub const GITHUB_SERVER: &'static str = "GitHub.com";
    pub const GITHUB_TOKEN_HINT: &'static str =
        "If using GITHUB_TOKEN in your env, check that it is valid.";
    /// Statuses resolved as "not found" instead of rejected.
    pub const NOT_FOUND_STATUSES: [u16; 3] = [400, 401, 404];
}

static PEM_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-----BEGIN .*\r?\n[^-]+\r?\n--.*").unwrap());

/// Split a CA bundle into its PEM blocks, dropping comments between them.
pub fn split_pem_bundle(bundle: &str) -> Vec<String> {
    PEM_BLOCK
        .find_iter(bundle)
        .map(|m| m.as_str().to_string())
        .filter(|block| block.starts_with("-----BEGIN "))
        .collect()
}

/// Proxy configuration for one URL scheme.
///
/// `Unset` lets the transport consult `HTTP_PROXY` / `HTTPS_PROXY`;
/// `Disabled` forbids that fallback.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxySetting {
    #[default]
    Unset,
    Disabled,
    Url(String),
}

impl ProxySetting {
    /// Parse a config-file style value: `""` is unset, `"false"` disables.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "" => ProxySetting::Unset,
            "false" => ProxySetting::Disabled,
            url => ProxySetting::Url(url.to_string()),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ProxySetting::Url(url) => Some(url),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for ProxySetting {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(false) => ProxySetting::Disabled,
            Raw::Flag(true) => ProxySetting::Unset,
            Raw::Text(text) => ProxySetting::parse(&text),
        })
    }
}

/// Partial option set; `None` leaves the current value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestManagerOptions {
    pub user_agent: Option<String>,
    /// Reject every request without touching the network.
    pub offline: Option<bool>,
    pub capture_har: Option<bool>,
    pub http_proxy: Option<ProxySetting>,
    pub https_proxy: Option<ProxySetting>,
    pub strict_ssl: Option<bool>,
    /// Inline PEM certificates.
    pub ca: Option<Vec<String>>,
    /// CA bundle on disk; overrides `ca`.
    pub cafile: Option<PathBuf>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub network_concurrency: Option<usize>,
    /// Milliseconds.
    pub network_timeout: Option<u64>,
    pub max_retry_attempts: Option<u32>,
    /// Milliseconds to wait before resubmitting queued retries.
    pub retry_delay: Option<u64>,
}

impl RequestManagerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| NetError::io_with_path(e, path))?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = Some(offline);
        self
    }

    pub fn with_capture_har(mut self, capture: bool) -> Self {
        self.capture_har = Some(capture);
        self
    }

    pub fn with_http_proxy(mut self, proxy: ProxySetting) -> Self {
        self.http_proxy = Some(proxy);
        self
    }

    pub fn with_https_proxy(mut self, proxy: ProxySetting) -> Self {
        self.https_proxy = Some(proxy);
        self
    }

    pub fn with_strict_ssl(mut self, strict: bool) -> Self {
        self.strict_ssl = Some(strict);
        self
    }

    pub fn with_ca(mut self, ca: Vec<String>) -> Self {
        self.ca = Some(ca);
        self
    }

    pub fn with_cafile(mut self, path: impl Into<PathBuf>) -> Self {
        self.cafile = Some(path.into());
        self
    }

    /// Client certificate and key, both PEM. The key must be PKCS#8
    /// (`BEGIN PRIVATE KEY`); convert PKCS#1 RSA keys with
    /// `openssl pkcs8 -topk8 -nocrypt`.
    pub fn with_client_identity(mut self, cert: impl Into<String>, key: impl Into<String>) -> Self {
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.network_concurrency = Some(limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = Some(attempts);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay.as_millis() as u64);
        self
    }
}

/// Effective configuration of a request manager.
#[derive(Debug, Clone)]
pub struct Settings {
    pub user_agent: String,
    pub offline: bool,
    pub capture_har: bool,
    pub http_proxy: ProxySetting,
    pub https_proxy: ProxySetting,
    pub strict_ssl: bool,
    pub ca: Option<Vec<String>>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub concurrency: usize,
    pub timeout: Option<Duration>,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_agent: String::new(),
            offline: false,
            capture_har: false,
            http_proxy: ProxySetting::Unset,
            https_proxy: ProxySetting::Unset,
            strict_ssl: true,
            ca: None,
            cert: None,
            key: None,
            concurrency: NetworkConfig::DEFAULT_CONCURRENCY,
            timeout: None,
            max_retry_attempts: NetworkConfig::DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_delay: NetworkConfig::RETRY_QUIESCENCE,
        }
    }
}

impl Settings {
    /// Fold a partial option set into these settings.
    ///
    /// Every present field is applied even when reading the CA file fails;
    /// that failure is returned for the caller to report.
    pub fn apply(&mut self, options: &RequestManagerOptions) -> Result<()> {
        if let Some(user_agent) = &options.user_agent {
            self.user_agent = user_agent.clone();
        }
        if let Some(offline) = options.offline {
            self.offline = offline;
        }
        if let Some(capture) = options.capture_har {
            self.capture_har = capture;
        }
        if let Some(proxy) = &options.http_proxy {
            self.http_proxy = proxy.clone();
        }
        match &options.https_proxy {
            // An empty HTTPS proxy inherits the HTTP proxy from the same update.
            Some(ProxySetting::Unset) => {
                self.https_proxy = options.http_proxy.clone().unwrap_or_default();
            }
            Some(proxy) => self.https_proxy = proxy.clone(),
            None => {}
        }
        if let Some(strict) = options.strict_ssl {
            self.strict_ssl = strict;
        }
        if let Some(ca) = options.ca.as_ref().filter(|ca| !ca.is_empty()) {
            self.ca = Some(ca.clone());
        }
        if let Some(limit) = options.network_concurrency {
            self.concurrency = limit.max(1);
        }
        if let Some(ms) = options.network_timeout {
            self.timeout = Some(Duration::from_millis(ms));
        }
        if let Some(attempts) = options.max_retry_attempts {
            self.max_retry_attempts = attempts;
        }
        if let Some(ms) = options.retry_delay {
            self.retry_delay = Duration::from_millis(ms);
        }
        if let Some(cert) = &options.cert {
            self.cert = Some(cert.clone());
        }
        if let Some(key) = &options.key {
            self.key = Some(key.clone());
        }

        if let Some(path) = options.cafile.as_ref().filter(|p| !p.as_os_str().is_empty()) {
            let bundle =
                std::fs::read_to_string(path).map_err(|e| NetError::io_with_path(e, path))?;
            self.ca = Some(split_pem_bundle(&bundle));
        }

        Ok(())
    }

    /// Proxy to use for `url`: HTTPS URLs use the HTTPS proxy.
    pub fn proxy_for(&self, url: &str) -> &ProxySetting {
        if url.starts_with("https:") {
            &self.https_proxy
        } else {
            &self.http_proxy
        }
    }
}
