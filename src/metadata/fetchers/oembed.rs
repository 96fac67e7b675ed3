use crate::config::OembedConfig;
use crate::metadata::fetchers::{Strategy, Target};
use crate::metadata::platform::Platform;
use crate::metadata::types::{FetchOutcome, RawMetadata};
use crate::scrape::http::HttpClient;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OembedResponse {
    #[serde(rename = "type")]
    oembed_type: Option<String>,
    title: Option<String>,
    author_name: Option<String>,
    provider_name: Option<String>,
    thumbnail_url: Option<String>,
    description: Option<String>,
}

impl From<OembedResponse> for RawMetadata {
    fn from(oembed: OembedResponse) -> Self {
        RawMetadata {
            title: oembed.title,
            description: oembed.description,
            thumbnail: oembed.thumbnail_url,
            favicon: None,
            channel_name: oembed.author_name,
            channel_avatar: None,
        }
    }
}

/// Looks the url up at the platform's public oEmbed endpoint.
pub struct OembedStage {
    http: Arc<HttpClient>,
    endpoints: Vec<(Platform, String)>,
    timeout: Duration,
}

impl OembedStage {
    pub fn new(config: &OembedConfig, http: Arc<HttpClient>, timeout: Duration) -> Self {
        let endpoints = config
            .providers
            .iter()
            .map(|p| (Platform::from_name(&p.platform), p.endpoint.trim().to_string()))
            .collect();

        Self {
            http,
            endpoints,
            timeout,
        }
    }

    fn endpoint_for(&self, platform: &Platform) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|(p, _)| p == platform)
            .map(|(_, endpoint)| endpoint.as_str())
    }
}

/// `{endpoint}?url={target}&format=json`, keeping any query the endpoint already has.
fn request_url(endpoint: &str, target: &Url) -> anyhow::Result<String> {
    let mut url =
        Url::parse(endpoint).with_context(|| format!("invalid oEmbed endpoint {endpoint:?}"))?;
    url.query_pairs_mut()
        .append_pair("url", target.as_str())
        .append_pair("format", "json");
    Ok(url.to_string())
}

#[async_trait]
impl Strategy for OembedStage {
    async fn fetch(&self, target: &Target) -> anyhow::Result<FetchOutcome> {
        let Some(endpoint) = self.endpoint_for(&target.platform) else {
            return Ok(FetchOutcome::Skip(format!(
                "no oEmbed endpoint for {}",
                target.platform
            )));
        };

        let full_url = request_url(endpoint, &target.url)?;
        log::debug!("Fetching oEmbed from: {full_url}");

        let oembed: OembedResponse = self.http.get_json(&full_url).await?;
        log::debug!(
            "oEmbed {} response from {:?}",
            oembed.oembed_type.as_deref().unwrap_or("unknown"),
            oembed.provider_name.as_deref().unwrap_or("unknown provider")
        );

        let metadata = RawMetadata::from(oembed);
        if metadata.has_any_data() {
            Ok(FetchOutcome::Data(metadata))
        } else {
            Ok(FetchOutcome::Skip("oEmbed response empty".into()))
        }
    }

    fn name(&self) -> &'static str {
        "oembed"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
