//! Transient-failure classification.
//!
//! Decides whether a transport error looks like lost or flaky connectivity
//! (worth waiting out and retrying) or a permanent fault.

use crate::network::transport::{TransportError, TransportErrorCode};
use std::collections::HashSet;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Reports whether the machine currently has a usable network route.
pub trait ConnectivityProbe: Send + Sync {
    fn is_offline(&self) -> bool;
}

/// Probe that asks the OS for a route to a public address.
///
/// Connecting a UDP socket sends no packets; it only fails when no
/// interface can reach the target.
#[derive(Debug, Clone)]
pub struct RouteProbe {
    target: String,
}

impl RouteProbe {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl Default for RouteProbe {
    fn default() -> Self {
        Self::new("1.1.1.1:53")
    }
}

impl ConnectivityProbe for RouteProbe {
    fn is_offline(&self) -> bool {
        let offline = UdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| socket.connect(self.target.as_str()))
            .is_err();
        if offline {
            debug!("No route to {}, assuming offline", self.target);
        }
        offline
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub bool);

impl ConnectivityProbe for StaticProbe {
    fn is_offline(&self) -> bool {
        self.0
    }
}

/// Transient-error classifier plus the set of hosts seen to succeed.
pub struct ErrorClassifier {
    probe: Arc<dyn ConnectivityProbe>,
    /// Probe answer when this classifier was created.
    offline_at_start: bool,
    success_hosts: Mutex<HashSet<String>>,
}

impl ErrorClassifier {
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        let offline_at_start = probe.is_offline();
        Self {
            probe,
            offline_at_start,
            success_hosts: Mutex::new(HashSet::new()),
        }
    }

    pub fn offline_at_start(&self) -> bool {
        self.offline_at_start
    }

    /// Remember that `host` answered at least once.
    pub fn record_success(&self, host: &str) {
        let mut hosts = self.success_hosts.lock().unwrap();
        if !hosts.contains(host) {
            hosts.insert(host.to_string());
        }
    }

    pub fn has_succeeded(&self, host: &str) -> bool {
        self.success_hosts.lock().unwrap().contains(host)
    }

    /// Check if an error is possibly due to lost or poor connectivity.
    pub fn is_possible_offline_error(&self, err: &TransportError) -> bool {
        let Some(code) = &err.code else {
            return false;
        };

        match code {
            TransportErrorCode::NotFound => {
                // Was online at start and still is: the lookup failure may be
                // the network flapping.
                if !self.offline_at_start && !self.probe.is_offline() {
                    return true;
                }
                // Resolved this host earlier in the run.
                if let Some(host) = &err.hostname {
                    if self.has_succeeded(host) {
                        return true;
                    }
                }
                self.offline_at_start
            }
            TransportErrorCode::ConnectionReset => true,
            TransportErrorCode::TimedOut | TransportErrorCode::SocketTimedOut => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("offline_at_start", &self.offline_at_start)
            .finish_non_exhaustive()
    }
}
