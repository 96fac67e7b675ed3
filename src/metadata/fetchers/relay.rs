use crate::config::RelayConfig;
use crate::metadata::fetchers::{Strategy, Target};
use crate::metadata::types::{FetchOutcome, RawMetadata};
use crate::scrape::{http::HttpClient, looks_blocked, Scraper};
use anyhow::bail;
use async_trait::async_trait;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};

/// JSON envelope used by relays like allorigins `/get`.
#[derive(Debug, Deserialize)]
struct RelayEnvelope {
    contents: Option<String>,
    status: Option<RelayStatus>,
}

#[derive(Debug, Deserialize)]
struct RelayStatus {
    http_code: Option<u16>,
}

/// Fetches the page through third-party CORS relays, in order.
pub struct RelayStage {
    http: Arc<HttpClient>,
    scraper: Arc<Scraper>,
    endpoints: Vec<String>,
    timeout: Duration,
}

impl RelayStage {
    pub fn new(
        config: &RelayConfig,
        http: Arc<HttpClient>,
        scraper: Arc<Scraper>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            scraper,
            endpoints: config.endpoints.clone(),
            timeout,
        }
    }

    async fn fetch_through(&self, template: &str, target: &Target) -> anyhow::Result<RawMetadata> {
        let relay_url = relay_url(template, target.url.as_str());
        let body = self.http.get_text(&relay_url).await?;
        let html = unwrap_body(body)?;

        if looks_blocked(&html) {
            bail!("relay returned an anti-bot page");
        }

        Ok(self
            .scraper
            .scrape_as(&html, target.url.as_str(), &target.platform)
            .into_raw())
    }
}

pub(crate) fn relay_url(template: &str, target: &str) -> String {
    if template.contains("{url}") {
        template.replace("{url}", &urlencoding::encode(target))
    } else if template.contains("{raw_url}") {
        template.replace("{raw_url}", target)
    } else {
        format!("{template}{}", urlencoding::encode(target))
    }
}

/// Relays answer either with the page itself or with `{"contents": "<html>..."}`.
fn unwrap_body(body: String) -> anyhow::Result<String> {
    if !body.trim_start().starts_with('{') {
        return Ok(body);
    }

    match serde_json::from_str::<RelayEnvelope>(&body) {
        Ok(envelope) => {
            if let Some(code) = envelope.status.and_then(|s| s.http_code) {
                if !(200..300).contains(&code) {
                    bail!("relayed request returned status {code}");
                }
            }
            match envelope.contents {
                Some(contents) if !contents.trim().is_empty() => Ok(contents),
                _ => bail!("relay returned no contents"),
            }
        }
        Err(_) => Ok(body),
    }
}

#[async_trait]
impl Strategy for RelayStage {
    async fn fetch(&self, target: &Target) -> anyhow::Result<FetchOutcome> {
        let mut partial = RawMetadata::default();
        let mut errors = Vec::new();

        for template in &self.endpoints {
            match self.fetch_through(template, target).await {
                Ok(raw) if raw.has_title() => return Ok(FetchOutcome::Data(raw.fill_gaps(partial))),
                Ok(raw) => partial = partial.fill_gaps(raw),
                Err(err) => {
                    log::debug!("relay {template}: {err:#}");
                    errors.push(format!("{err:#}"));
                }
            }
        }

        if partial.has_any_data() {
            return Ok(FetchOutcome::Data(partial));
        }

        if errors.is_empty() {
            return Ok(FetchOutcome::Skip("relayed pages have no metadata".into()));
        }

        bail!("all relays failed: {}", errors.join("; "))
    }

    fn name(&self) -> &'static str {
        "relay"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
