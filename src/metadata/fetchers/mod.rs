pub mod direct;
pub mod headless;
pub mod oembed;
pub mod relay;

use crate::config::Config;
use crate::metadata::platform::Platform;
use crate::metadata::types::{FetchOutcome, RawMetadata, StageReport, StageStatus};
use crate::scrape::{http::HttpClient, Scraper};
use anyhow::anyhow;
use async_trait::async_trait;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use url::Url;

/// What the stages are asked to resolve.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: Url,
    pub platform: Platform,
}

/// One way of getting metadata for a url.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// `Err` and [`FetchOutcome::Skip`] both mean "no result" to the pipeline;
    /// the difference only shows up in logs and the report.
    async fn fetch(&self, target: &Target) -> anyhow::Result<FetchOutcome>;

    /// Get the name of this stage for logging/debugging
    fn name(&self) -> &'static str;

    /// Hard limit for one `fetch`; the future is aborted once it elapses.
    fn timeout(&self) -> Duration;
}

pub struct PipelineOutcome {
    pub raw: RawMetadata,
    pub stages: Vec<StageReport>,
    pub winner: Option<String>,
}

/// Ordered stages, tried in sequence until one yields a title.
pub struct Pipeline {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl Pipeline {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self { strategies }
    }

    /// oEmbed, direct fetch, relay, then headless browser; disabled stages are left out.
    pub fn from_config(config: &Config, http: Arc<HttpClient>, scraper: Arc<Scraper>) -> Self {
        let stages = &config.stages;
        let mut strategies: Vec<Arc<dyn Strategy>> = Vec::new();

        if stages.oembed_enabled {
            strategies.push(Arc::new(oembed::OembedStage::new(
                &config.oembed,
                http.clone(),
                stages.oembed_timeout(),
            )));
        }

        if stages.direct_enabled {
            strategies.push(Arc::new(direct::DirectStage::new(
                http.clone(),
                scraper.clone(),
                stages.direct_timeout(),
            )));
        }

        if stages.relay_enabled && !config.relay.endpoints.is_empty() {
            strategies.push(Arc::new(relay::RelayStage::new(
                &config.relay,
                http,
                scraper.clone(),
                stages.relay_timeout(),
            )));
        }

        if stages.browser_enabled {
            match headless::HeadlessStage::with_chrome(config, scraper) {
                Some(stage) => strategies.push(Arc::new(stage)),
                None => log::debug!("built without headless support, browser stage disabled"),
            }
        }

        Self::new(strategies)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Never fails: stage errors, panics and timeouts all count as "no result".
    ///
    /// Output from stages that found something but no title is kept and used
    /// to fill the gaps of the stage that finally does.
    pub async fn run(&self, target: &Target) -> PipelineOutcome {
        let mut partial = RawMetadata::default();
        let mut stages = Vec::with_capacity(self.strategies.len());
        let mut winner = None;

        for strategy in &self.strategies {
            let name = strategy.name();
            let started = Instant::now();
            let outcome = run_stage(strategy.clone(), target.clone()).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (status, fields) = match outcome {
                StageResult::Done(FetchOutcome::Data(raw)) => {
                    let fields = raw.describe_fields();
                    if raw.has_title() {
                        log::info!(
                            "stage={name} outcome=success fields=[{fields}] elapsed_ms={elapsed_ms}"
                        );
                        partial = raw.fill_gaps(partial);
                        winner = Some(name.to_string());
                        (StageStatus::Success, Some(fields))
                    } else {
                        log::info!(
                            "stage={name} outcome=partial fields=[{fields}] elapsed_ms={elapsed_ms}"
                        );
                        partial = partial.fill_gaps(raw);
                        (StageStatus::Partial, Some(fields))
                    }
                }
                StageResult::Done(FetchOutcome::Skip(reason)) => {
                    log::info!(
                        "stage={name} outcome=skip reason={reason:?} elapsed_ms={elapsed_ms}"
                    );
                    (StageStatus::Skip(reason), None)
                }
                StageResult::Failed(err) => {
                    log::warn!("stage={name} outcome=error err={err:#} elapsed_ms={elapsed_ms}");
                    (StageStatus::Error(format!("{err:#}")), None)
                }
                StageResult::TimedOut => {
                    log::warn!("stage={name} outcome=timeout elapsed_ms={elapsed_ms}");
                    (StageStatus::Timeout, None)
                }
            };

            stages.push(StageReport {
                name: name.to_string(),
                status,
                duration_ms: elapsed_ms,
                fields,
            });

            if winner.is_some() {
                break;
            }
        }

        PipelineOutcome {
            raw: partial,
            stages,
            winner,
        }
    }
}

enum StageResult {
    Done(FetchOutcome),
    Failed(anyhow::Error),
    TimedOut,
}

/// Runs the stage on its own task so a panic stays contained and a timeout
/// can abort it.
async fn run_stage(strategy: Arc<dyn Strategy>, target: Target) -> StageResult {
    let budget = strategy.timeout();
    let mut handle = tokio::spawn(async move { strategy.fetch(&target).await });

    match tokio::time::timeout(budget, &mut handle).await {
        Ok(Ok(Ok(outcome))) => StageResult::Done(outcome),
        Ok(Ok(Err(err))) => StageResult::Failed(err),
        Ok(Err(join_err)) => StageResult::Failed(anyhow!("stage task failed: {join_err}")),
        Err(_) => {
            handle.abort();
            StageResult::TimedOut
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub enum Behavior {
        Data(RawMetadata),
        Skip,
        Fail,
        Panic,
        Hang,
    }

    /// A scripted stage that counts its calls.
    pub struct StubStage {
        pub name: &'static str,
        pub behavior: Behavior,
        pub timeout: Duration,
        pub calls: Arc<AtomicUsize>,
    }

    impl StubStage {
        pub fn new(name: &'static str, behavior: Behavior) -> Self {
            Self {
                name,
                behavior,
                timeout: Duration::from_millis(300),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn titled(name: &'static str, title: &str) -> Self {
            Self::new(
                name,
                Behavior::Data(RawMetadata {
                    title: Some(title.to_string()),
                    ..Default::default()
                }),
            )
        }
    }

    #[async_trait]
    impl Strategy for StubStage {
        async fn fetch(&self, _target: &Target) -> anyhow::Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Data(raw) => Ok(FetchOutcome::Data(raw.clone())),
                Behavior::Skip => Ok(FetchOutcome::Skip("not applicable".into())),
                Behavior::Fail => Err(anyhow!("connection refused")),
                Behavior::Panic => panic!("stage exploded"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(FetchOutcome::Skip("woke up".into()))
                }
            }
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Behavior, StubStage};
    use super::*;
    use std::sync::atomic::Ordering;

    fn target() -> Target {
        Target {
            url: Url::parse("https://example.com/post").unwrap(),
            platform: Platform::Other,
        }
    }

    #[tokio::test]
    async fn test_stops_at_first_title() {
        let first = StubStage::new("first", Behavior::Fail);
        let second = StubStage::titled("second", "Found");
        let third = StubStage::titled("third", "Never");
        let third_calls = third.calls.clone();

        let pipeline = Pipeline::new(vec![Arc::new(first), Arc::new(second), Arc::new(third)]);
        let outcome = pipeline.run(&target()).await;

        assert_eq!(outcome.raw.title.as_deref(), Some("Found"));
        assert_eq!(outcome.winner.as_deref(), Some("second"));
        assert_eq!(outcome.stages.len(), 2);
        assert!(matches!(outcome.stages[0].status, StageStatus::Error(_)));
        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_panics_and_timeouts_fall_through() {
        let pipeline = Pipeline::new(vec![
            Arc::new(StubStage::new("panics", Behavior::Panic)),
            Arc::new(StubStage::new("hangs", Behavior::Hang)),
            Arc::new(StubStage::new("skips", Behavior::Skip)),
            Arc::new(StubStage::titled("works", "Title")),
        ]);
        let started = Instant::now();
        let outcome = pipeline.run(&target()).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.winner.as_deref(), Some("works"));
        let statuses: Vec<_> = outcome.stages.iter().map(|s| s.status.clone()).collect();
        assert!(matches!(statuses[0], StageStatus::Error(_)));
        assert_eq!(statuses[1], StageStatus::Timeout);
        assert!(matches!(statuses[2], StageStatus::Skip(_)));
        assert_eq!(statuses[3], StageStatus::Success);
    }

    #[tokio::test]
    async fn test_partial_output_fills_gaps() {
        let partial = StubStage::new(
            "partial",
            Behavior::Data(RawMetadata {
                thumbnail: Some("https://example.com/a.jpg".into()),
                channel_name: Some("Someone".into()),
                ..Default::default()
            }),
        );
        let winner = StubStage::new(
            "winner",
            Behavior::Data(RawMetadata {
                title: Some("Title".into()),
                thumbnail: Some("https://example.com/b.jpg".into()),
                ..Default::default()
            }),
        );

        let outcome = Pipeline::new(vec![Arc::new(partial), Arc::new(winner)])
            .run(&target())
            .await;

        assert_eq!(outcome.raw.title.as_deref(), Some("Title"));
        assert_eq!(outcome.raw.thumbnail.as_deref(), Some("https://example.com/b.jpg"));
        assert_eq!(outcome.raw.channel_name.as_deref(), Some("Someone"));
        assert_eq!(outcome.stages[0].status, StageStatus::Partial);
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_an_error() {
        let outcome = Pipeline::new(vec![
            Arc::new(StubStage::new("a", Behavior::Fail)),
            Arc::new(StubStage::new("b", Behavior::Skip)),
        ])
        .run(&target())
        .await;

        assert!(outcome.winner.is_none());
        assert_eq!(outcome.raw, RawMetadata::default());
        assert_eq!(outcome.stages.len(), 2);
    }

    #[test]
    fn test_from_config_respects_flags() {
        let mut config = Config::default();
        config.stages.relay_enabled = false;
        config.stages.browser_enabled = false;

        let http = Arc::new(HttpClient::new(&config.fetch).unwrap());
        let scraper = Arc::new(Scraper::new(&config.scrape));
        let pipeline = Pipeline::from_config(&config, http, scraper);
        assert_eq!(pipeline.stage_names(), vec!["oembed", "direct"]);
    }
}
