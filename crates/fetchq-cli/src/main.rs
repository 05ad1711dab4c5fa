//! fetchq - fetch package metadata through the request manager.
//!
//! Issues one GET per URL argument, sharing the manager's concurrency limit,
//! retry queue and per-URL cache, and prints a one-line summary per URL.

use anyhow::{Context, Result};
use clap::Parser;
use fetchq_core::{
    ProxySetting, RequestDescriptor, RequestManager, RequestManagerOptions, ResponseBody,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "fetchq")]
#[command(about = "Fetch URLs through a throttled, retrying request manager")]
struct Args {
    /// URLs to fetch
    #[arg(required = true)]
    urls: Vec<String>,

    /// JSON file with request manager options (camelCase keys)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum number of requests in flight
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Fail every request without touching the network
    #[arg(long)]
    offline: bool,

    /// Proxy for http: URLs ("false" disables)
    #[arg(long)]
    http_proxy: Option<String>,

    /// Proxy for https: URLs ("false" disables, empty inherits --http-proxy)
    #[arg(long)]
    https_proxy: Option<String>,

    /// PEM bundle of extra trusted certificate authorities
    #[arg(long)]
    cafile: Option<PathBuf>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    insecure: bool,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Total attempts per GET, including the first
    #[arg(long)]
    max_retries: Option<u32>,

    /// Override the User-Agent header
    #[arg(long)]
    user_agent: Option<String>,

    /// Write captured traffic to this HAR file
    #[arg(long)]
    har: Option<PathBuf>,

    /// Print decoded response bodies
    #[arg(long)]
    print_body: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    /// Options from the config file, overridden by command-line flags.
    fn options(&self) -> Result<RequestManagerOptions> {
        let mut options = match &self.config {
            Some(path) => RequestManagerOptions::from_json_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => RequestManagerOptions::new(),
        };

        if options.user_agent.is_none() || self.user_agent.is_some() {
            let user_agent = self
                .user_agent
                .clone()
                .unwrap_or_else(|| format!("fetchq/{}", env!("CARGO_PKG_VERSION")));
            options = options.with_user_agent(user_agent);
        }
        if self.offline {
            options = options.with_offline(true);
        }
        if self.har.is_some() {
            options = options.with_capture_har(true);
        }
        if let Some(proxy) = &self.http_proxy {
            options = options.with_http_proxy(ProxySetting::parse(proxy));
        }
        if let Some(proxy) = &self.https_proxy {
            options = options.with_https_proxy(ProxySetting::parse(proxy));
        }
        if let Some(cafile) = &self.cafile {
            options = options.with_cafile(cafile.clone());
        }
        if self.insecure {
            options = options.with_strict_ssl(false);
        }
        if let Some(limit) = self.concurrency {
            options = options.with_concurrency(limit);
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        if let Some(attempts) = self.max_retries {
            options = options.with_max_retry_attempts(attempts);
        }
        Ok(options)
    }
}

fn summarize(body: &ResponseBody) -> String {
    match body {
        ResponseBody::Json(value) => match value.get("name").and_then(|n| n.as_str()) {
            Some(name) => format!("json ({})", name),
            None => "json".to_string(),
        },
        ResponseBody::Text(text) => format!("text, {} bytes", text.len()),
        ResponseBody::Bytes(bytes) => format!("binary, {} bytes", bytes.len()),
        ResponseBody::NotFound(status) => format!("not found ({})", status),
    }
}

async fn fetch_all(manager: &RequestManager, args: &Args) -> usize {
    let requests = args
        .urls
        .iter()
        .map(|url| manager.request(RequestDescriptor::get(url.clone()).json()));
    let results = futures::future::join_all(requests).await;

    let mut failures = 0;
    for (url, result) in args.urls.iter().zip(results) {
        match result {
            Ok(body) => {
                println!("{}  {}", url, summarize(&body));
                if args.print_body {
                    match &body {
                        ResponseBody::Json(value) => {
                            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default())
                        }
                        ResponseBody::Text(text) => println!("{}", text),
                        _ => {}
                    }
                }
            }
            Err(err) => {
                failures += 1;
                println!("{}  error: {}", url, err);
            }
        }
    }
    failures
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let manager = RequestManager::with_reqwest();
    manager.set_options(&args.options()?);
    info!("Fetching {} URL(s)", args.urls.len());

    let failures = tokio::select! {
        failures = fetch_all(&manager, &args) => failures,
        _ = tokio::signal::ctrl_c() => {
            let stats = manager.stats();
            warn!(
                "Interrupted with {} running, {} queued, {} awaiting retry",
                stats.running, stats.queued, stats.awaiting_retry
            );
            args.urls.len()
        }
    };

    if let Some(path) = &args.har {
        manager
            .save_har(path)
            .with_context(|| format!("saving HAR to {}", path.display()))?;
    }

    if failures > 0 {
        anyhow::bail!("{} of {} request(s) failed", failures, args.urls.len());
    }
    Ok(())
}
