pub mod cache;
pub mod errors;
pub mod fetchers;
pub mod normalize;
pub mod platform;
pub mod types;

pub use errors::ExtractError;
pub use platform::Platform;
pub use types::{MetadataResult, ResolveReport};

use crate::config::Config;
use crate::scrape::{
    http::{HttpClient, UrlPolicy},
    Scraper,
};
use cache::ResultCache;
use fetchers::{Pipeline, Target};
use normalize::{normalize_url, Normalizer};
use platform::PlatformClassifier;
use std::{sync::Arc, time::Duration, time::Instant};
use url::Url;

/// A resolved result together with how it was obtained.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub result: Arc<MetadataResult>,
    pub report: ResolveReport,
}

/// Turns a url into a [`MetadataResult`]: classify, run the stages, normalize.
///
/// Holds no per-request state, so one engine is shared by every request.
pub struct Engine {
    classifier: PlatformClassifier,
    normalizer: Normalizer,
    pipeline: Pipeline,
    policy: UrlPolicy,
    cache: ResultCache,
}

impl Engine {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = Arc::new(HttpClient::new(&config.fetch)?);
        let scraper = Arc::new(Scraper::new(&config.scrape));
        let pipeline = Pipeline::from_config(config, http, scraper);
        log::debug!("stages: {:?}", pipeline.stage_names());

        Self::with_pipeline(config, pipeline)
    }

    pub fn with_pipeline(config: &Config, pipeline: Pipeline) -> anyhow::Result<Self> {
        Ok(Self {
            classifier: PlatformClassifier::new(&config.platforms)?,
            normalizer: Normalizer::new(&config.result),
            pipeline,
            policy: UrlPolicy::new(&config.fetch),
            cache: ResultCache::new(Duration::from_secs(config.cache.ttl_secs)),
        })
    }

    pub fn classify(&self, url: &str) -> Platform {
        self.classifier.classify(url)
    }

    /// Classification-only record returned alongside input errors.
    pub fn fallback_for(&self, url: &str) -> MetadataResult {
        self.normalizer.classification_only(self.classify(url))
    }

    pub async fn resolve(&self, url: &str) -> Result<Arc<MetadataResult>, ExtractError> {
        self.resolve_with_report(url).await.map(|r| r.result)
    }

    /// Only input problems are errors. Every stage failing still yields a
    /// result carrying the platform and the placeholder title.
    pub async fn resolve_with_report(&self, url: &str) -> Result<Resolution, ExtractError> {
        let started = Instant::now();
        let input = url.trim();
        if input.is_empty() {
            return Err(ExtractError::MissingUrl);
        }

        let normalized = normalize_url(input);
        let parsed = Url::parse(&normalized).map_err(|err| ExtractError::InvalidUrl {
            url: input.to_string(),
            reason: err.to_string(),
        })?;
        if parsed.host_str().unwrap_or_default().is_empty() {
            return Err(ExtractError::InvalidUrl {
                url: input.to_string(),
                reason: "url has no host".into(),
            });
        }

        self.policy.check(&parsed).await?;

        let platform = self.classifier.classify_url(&parsed);
        let mut report = ResolveReport {
            url: normalized.clone(),
            platform: platform.to_string(),
            ..Default::default()
        };

        if let Some(result) = self.cache.get(&normalized) {
            log::debug!("cache hit for {normalized}");
            report.cached = true;
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(Resolution { result, report });
        }

        let target = Target {
            url: parsed,
            platform: platform.clone(),
        };
        let outcome = self.pipeline.run(&target).await;
        let found_anything = outcome.raw.has_any_data();

        let result = Arc::new(self.normalizer.normalize(outcome.raw, &platform, &normalized));
        if found_anything {
            self.cache.insert(normalized.clone(), result.clone());
        }

        report.stages = outcome.stages;
        report.winner = outcome.winner;
        report.duration_ms = started.elapsed().as_millis() as u64;

        log::info!(
            "resolved {normalized} platform={platform} winner={} elapsed_ms={}",
            report.winner.as_deref().unwrap_or("none"),
            report.duration_ms
        );

        Ok(Resolution { result, report })
    }
}
