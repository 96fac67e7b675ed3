use crate::config::FetchConfig;
use crate::metadata::errors::ExtractError;
use anyhow::{anyhow, bail, Context, Result};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use std::{
    error::Error,
    future::Future,
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use url::{Host, Url};

const DNS_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);

fn is_ip_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

async fn resolves_to_private(url: &Url, lookup_timeout: Duration) -> bool {
    match url.host() {
        Some(Host::Ipv4(ip)) => is_ip_private(&IpAddr::V4(ip)),
        Some(Host::Ipv6(ip)) => is_ip_private(&IpAddr::V6(ip)),
        Some(Host::Domain(domain)) => {
            let port = url.port_or_known_default().unwrap_or(80);
            let lookup = tokio::net::lookup_host((domain, port));
            any_private(domain, lookup, lookup_timeout).await
        }
        None => false,
    }
}

/// A lookup that fails or outlives `limit` counts as public; the stages will
/// hit the same resolver and fail on their own.
async fn any_private<I>(
    domain: &str,
    lookup: impl Future<Output = io::Result<I>>,
    limit: Duration,
) -> bool
where
    I: Iterator<Item = SocketAddr>,
{
    match tokio::time::timeout(limit, lookup).await {
        Ok(Ok(mut addrs)) => addrs.any(|addr| is_ip_private(&addr.ip())),
        Ok(Err(err)) => {
            log::debug!("{domain}: lookup failed: {err}");
            false
        }
        Err(_) => {
            log::warn!("{domain}: lookup timed out after {limit:?}");
            false
        }
    }
}

/// The innermost cause is usually the useful one (dns, refused, tls...).
pub fn get_error(error: &reqwest::Error) -> String {
    match error.source() {
        Some(e) => match e.source() {
            Some(e) => e.to_string(),
            None => e.to_string(),
        },
        None => error.to_string(),
    }
}

/// Which target urls the engine agrees to fetch at all.
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    allowed_schemes: Vec<String>,
    blocked_hosts: Vec<String>,
    block_private_ips: bool,
    lookup_timeout: Duration,
}

impl UrlPolicy {
    pub fn new(config: &FetchConfig) -> Self {
        Self {
            allowed_schemes: config
                .allowed_schemes
                .iter()
                .map(|s| s.trim().to_lowercase())
                .collect(),
            blocked_hosts: config
                .blocked_hosts
                .iter()
                .map(|h| h.trim().to_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            block_private_ips: config.block_private_ips,
            lookup_timeout: DNS_LOOKUP_TIMEOUT,
        }
    }

    pub async fn check(&self, url: &Url) -> Result<(), ExtractError> {
        let scheme = url.scheme();
        if !self.allowed_schemes.iter().any(|s| s == scheme) {
            log::warn!("URL scheme '{scheme}' not allowed");
            return Err(ExtractError::UnsupportedScheme(scheme.to_string()));
        }

        let host = url.host_str().unwrap_or_default().to_lowercase();

        let blocked = self.blocked_hosts.iter().any(|blocked| {
            host == *blocked
                || host
                    .strip_suffix(blocked.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        });
        if blocked {
            log::warn!("Host '{host}' is blocked");
            return Err(ExtractError::BlockedHost(host));
        }

        if self.block_private_ips && resolves_to_private(url, self.lookup_timeout).await {
            log::warn!("Host '{host}' resolves to private IP (blocked by SSRF policy)");
            return Err(ExtractError::BlockedHost(host));
        }

        Ok(())
    }
}

/// Async client shared by every network stage.
///
/// Sends a desktop browser user agent; when a proxy is configured a request
/// that fails at the network level is retried once through it.
pub struct HttpClient {
    client: reqwest::Client,
    proxied: Option<reqwest::Client>,
    max_body_bytes: usize,
}

impl HttpClient {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = client_builder(config)?
            .build()
            .context("failed to build http client")?;

        let proxied = match config.proxy.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy)
                    .with_context(|| format!("invalid proxy {proxy:?}"))?;
                Some(
                    client_builder(config)?
                        .proxy(proxy)
                        .build()
                        .context("failed to build proxied http client")?,
                )
            }
            None => None,
        };

        Ok(Self {
            client,
            proxied,
            max_body_bytes: config.max_body_bytes,
        })
    }

    /// Body of a 2xx response, lossily decoded. Anything else is an error.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        let bytes = self.get_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let bytes = self.get_bytes(url).await?;
        serde_json::from_slice(&bytes).with_context(|| format!("{url}: response is not valid json"))
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        log::debug!("{url}: requesting");

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(err) => {
                let Some(proxied) = &self.proxied else {
                    bail!("{url}: {}", get_error(&err));
                };
                log::debug!("{url}: {}, retrying through proxy", get_error(&err));
                proxied
                    .get(url)
                    .send()
                    .await
                    .map_err(|err| anyhow!("{url}: proxy: {}", get_error(&err)))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            bail!("{url}: status {status}");
        }

        self.read_limited(response).await
    }

    async fn read_limited(&self, mut response: reqwest::Response) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = self.max_body_bytes.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
            if body.len() >= self.max_body_bytes {
                log::debug!("{}: body truncated at {} bytes", response.url(), body.len());
                break;
            }
        }
        Ok(body)
    }
}

fn client_builder(config: &FetchConfig) -> Result<reqwest::ClientBuilder> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("en-US,en;q=0.9"),
    );

    let user_agent = HeaderValue::from_str(&config.user_agent)
        .with_context(|| format!("invalid user agent {:?}", config.user_agent))?;

    Ok(reqwest::Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .danger_accept_invalid_hostnames(config.accept_invalid_certs)
        .pool_idle_timeout(std::time::Duration::from_secs(10)))
}
