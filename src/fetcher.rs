// =============================================================================
// HTTP Fetcher — shared resource behind every Poller.
// =============================================================================
//
// Issues HTTPS GETs with optional round-robin proxy rotation and a
// correlation id used only for log correlation. Never retries internally;
// retry/backoff scheduling is the Poller's responsibility (§4.B).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::{debug, warn};

/// A single upstream HTTP proxy entry, parsed from a `[PROXY_N]` config
/// section.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxyEntry {
    fn to_reqwest_proxy(&self) -> anyhow::Result<reqwest::Proxy> {
        let scheme = if self.user.is_some() {
            format!(
                "http://{}:{}@{}:{}",
                self.user.as_deref().unwrap_or_default(),
                self.password.as_deref().unwrap_or_default(),
                self.host,
                self.port
            )
        } else {
            format!("http://{}:{}", self.host, self.port)
        };
        Ok(reqwest::Proxy::all(scheme)?)
    }
}

/// Outcome of a fetch: only a status code and body ever escape this module.
/// A `TransportError` (connect failure, timeout, TLS error) is reported as
/// `Err` and is the caller's signal to apply SHORT_BACKOFF (§4.B).
pub struct FetchResponse {
    pub status: reqwest::StatusCode,
    pub body: String,
}

/// Shared fetcher: one `reqwest::Client` per configured proxy (or one
/// direct client if the pool is empty), selected round-robin. The proxy
/// list is immutable after construction (§5), so selection needs only an
/// `AtomicUsize` cursor, no lock.
pub struct HttpFetcher {
    clients: Vec<reqwest::Client>,
    cursor: AtomicUsize,
    next_request_id: AtomicU64,
}

impl HttpFetcher {
    pub fn new(proxies: &[ProxyEntry]) -> anyhow::Result<Self> {
        let mut clients = Vec::new();
        if proxies.is_empty() {
            clients.push(Self::build_client(None)?);
        } else {
            for proxy in proxies {
                clients.push(Self::build_client(Some(proxy))?);
            }
        }
        Ok(Self {
            clients,
            cursor: AtomicUsize::new(0),
            next_request_id: AtomicU64::new(1),
        })
    }

    fn build_client(proxy: Option<&ProxyEntry>) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));
        if let Some(p) = proxy {
            builder = builder.proxy(p.to_reqwest_proxy()?);
        }
        Ok(builder.build()?)
    }

    fn next_client(&self) -> &reqwest::Client {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        &self.clients[i]
    }

    /// Issue a GET request. Never retries: a transport failure is returned
    /// as `Err` for the caller to classify into a backoff class.
    pub async fn fetch(&self, url: &str, headers: HeaderMap) -> anyhow::Result<FetchResponse> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let client = self.next_client();
        debug!(request_id, url, "dispatching fetch");
        let resp = client.get(url).headers(headers).send().await;
        match resp {
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                debug!(request_id, status = status.as_u16(), "fetch completed");
                Ok(FetchResponse { status, body })
            }
            Err(e) => {
                warn!(request_id, url, error = %e, "transport error");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_proxy_pool_builds_one_direct_client() {
        let fetcher = HttpFetcher::new(&[]).unwrap();
        assert_eq!(fetcher.clients.len(), 1);
    }

    #[test]
    fn cursor_round_robins_across_clients() {
        let proxies = vec![
            ProxyEntry {
                host: "p1".to_string(),
                port: 8080,
                user: None,
                password: None,
            },
            ProxyEntry {
                host: "p2".to_string(),
                port: 8080,
                user: None,
                password: None,
            },
        ];
        let fetcher = HttpFetcher::new(&proxies).unwrap();
        assert_eq!(fetcher.clients.len(), 2);
        let first = fetcher.cursor.load(Ordering::Relaxed);
        let _ = fetcher.next_client();
        let second = fetcher.cursor.load(Ordering::Relaxed);
        assert_eq!(second, first + 1);
    }
}
