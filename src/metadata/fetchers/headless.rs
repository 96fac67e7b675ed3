use crate::config::Config;
use crate::metadata::fetchers::{Strategy, Target};
use crate::metadata::types::FetchOutcome;
use crate::scrape::{
    browser::{render_page, BrowserLauncher, RenderRequest, SessionOptions},
    looks_blocked, Scraper,
};
use anyhow::Context;
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Semaphore;

/// Raises the flag when dropped, which is how an aborted stage tells the
/// blocking render worker to let go of its session.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Renders the page in a headless browser and scrapes the live DOM.
pub struct HeadlessStage {
    launcher: Arc<dyn BrowserLauncher>,
    sessions: Arc<Semaphore>,
    scraper: Arc<Scraper>,
    options: SessionOptions,
    timeout: Duration,
    settle_timeout: Duration,
    scroll_cycles: u8,
}

impl HeadlessStage {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn BrowserLauncher>,
        scraper: Arc<Scraper>,
    ) -> Self {
        let browser = &config.browser;
        let timeout = config.stages.browser_timeout();

        Self {
            launcher,
            sessions: Arc::new(Semaphore::new(browser.max_sessions)),
            scraper,
            options: SessionOptions {
                user_agent: config.fetch.user_agent.clone(),
                viewport: (browser.viewport_width, browser.viewport_height),
                chrome_path: browser
                    .chrome_path
                    .clone()
                    .or_else(|| std::env::var_os("CHROME_PATH").map(Into::into)),
                proxy: config.fetch.proxy.clone(),
                idle_timeout: timeout,
            },
            timeout,
            settle_timeout: Duration::from_millis(browser.settle_timeout_ms),
            scroll_cycles: browser.scroll_cycles,
        }
    }

    #[cfg(feature = "headless")]
    pub fn with_chrome(config: &Config, scraper: Arc<Scraper>) -> Option<Self> {
        let launcher = Arc::new(crate::scrape::browser::ChromeLauncher);
        Some(Self::new(config, launcher, scraper))
    }

    #[cfg(not(feature = "headless"))]
    pub fn with_chrome(_config: &Config, _scraper: Arc<Scraper>) -> Option<Self> {
        None
    }

    async fn render(&self, url: &str) -> anyhow::Result<String> {
        // the stage budget starts now, not when a session slot frees up
        let deadline = Instant::now() + self.timeout;
        let permit = self
            .sessions
            .clone()
            .acquire_owned()
            .await
            .context("browser pool is closed")?;

        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(cancel.clone());

        let request = RenderRequest {
            url: url.to_string(),
            options: self.options.clone(),
            deadline,
            settle_timeout: self.settle_timeout,
            scroll_cycles: self.scroll_cycles,
            cancel,
        };
        let launcher = self.launcher.clone();

        tokio::task::spawn_blocking(move || {
            // the slot is held until the session is gone, not until the stage gives up
            let _permit = permit;
            render_page(launcher.as_ref(), &request)
        })
        .await
        .context("browser worker failed")?
    }
}

#[async_trait]
impl Strategy for HeadlessStage {
    async fn fetch(&self, target: &Target) -> anyhow::Result<FetchOutcome> {
        let url = target.url.as_str();
        let html = self.render(url).await?;

        if looks_blocked(&html) {
            return Ok(FetchOutcome::Skip("blocked by anti-bot page".into()));
        }

        let raw = self.scraper.scrape_as(&html, url, &target.platform).into_raw();
        if raw.has_any_data() {
            Ok(FetchOutcome::Data(raw))
        } else {
            Ok(FetchOutcome::Skip("rendered page has no metadata".into()))
        }
    }

    fn name(&self) -> &'static str {
        "headless"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fetchers::{Pipeline, Target};
    use crate::metadata::platform::Platform;
    use crate::metadata::types::StageStatus;
    use crate::scrape::browser::testing::{FailAt, MockLauncher};
    use url::Url;

    const RENDERED: &str = r#"<html><head><title>Rendered - YouTube</title></head><body>
        <img src="https://example.com/icon.png" width="16" height="16">
        <img src="https://example.com/lazy.jpg" width="1280" height="720">
    </body></html>"#;

    fn config(max_sessions: usize) -> Config {
        let mut config = Config::default();
        config.browser.max_sessions = max_sessions;
        config.browser.settle_timeout_ms = 50;
        config
    }

    fn stage(config: &Config, launcher: Arc<MockLauncher>) -> HeadlessStage {
        let scraper = Arc::new(Scraper::new(&config.scrape));
        HeadlessStage::new(config, launcher, scraper)
    }

    fn target() -> Target {
        Target {
            url: Url::parse("https://example.com/app").unwrap(),
            platform: Platform::Other,
        }
    }

    #[tokio::test]
    async fn test_scrapes_rendered_dom() {
        let launcher = Arc::new(MockLauncher::new(RENDERED));
        let outcome = stage(&config(2), launcher.clone()).fetch(&target()).await.unwrap();

        let FetchOutcome::Data(raw) = outcome else {
            panic!("expected data");
        };
        assert_eq!(raw.title.as_deref(), Some("Rendered"));
        assert_eq!(raw.thumbnail.as_deref(), Some("https://example.com/lazy.jpg"));
        assert_eq!(launcher.counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scrape_failure_still_closes_session() {
        let mut mock = MockLauncher::new(RENDERED);
        mock.fail_at = FailAt::Content;
        let launcher = Arc::new(mock);

        let result = stage(&config(2), launcher.clone()).fetch(&target()).await;
        assert!(result.is_err());
        assert_eq!(launcher.counters.launched.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_launch_failure_falls_through() {
        let mut mock = MockLauncher::new(RENDERED);
        mock.fail_launch = true;
        let launcher = Arc::new(mock);

        let outcome = Pipeline::new(vec![Arc::new(stage(&config(1), launcher.clone()))])
            .run(&target())
            .await;
        assert!(outcome.winner.is_none());
        assert_eq!(launcher.counters.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stage_timeout_releases_session() {
        let mut mock = MockLauncher::new(RENDERED);
        mock.navigate_delay = Duration::from_millis(600);
        let launcher = Arc::new(mock);

        let mut config = config(1);
        config.stages.browser_timeout_secs = 1;
        let mut stage = stage(&config, launcher.clone());
        // a stage budget shorter than the navigation
        stage.timeout = Duration::from_millis(200);

        let outcome = Pipeline::new(vec![Arc::new(stage)]).run(&target()).await;
        assert!(outcome.winner.is_none());

        // navigation is cut at the stage deadline and the session closed
        let started = Instant::now();
        while launcher.counters.closed.load(Ordering::SeqCst) == 0 {
            assert!(started.elapsed() < Duration::from_secs(3), "session never closed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(launcher.counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queued_session_bounded_by_stage_deadline() {
        let mut mock = MockLauncher::new(RENDERED);
        mock.navigate_delay = Duration::from_secs(60);
        let launcher = Arc::new(mock);

        let mut config = config(1);
        config.stages.browser_timeout_secs = 2;
        let stage: Arc<HeadlessStage> = Arc::new(stage(&config, launcher.clone()));

        let run = |stage: Arc<HeadlessStage>| {
            tokio::spawn(async move { Pipeline::new(vec![stage]).run(&target()).await })
        };

        let first = run(stage.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second_started = Instant::now();
        let second = run(stage.clone());

        // the second stage waits a second for the only slot, then has one second left
        while launcher.counters.closed.load(Ordering::SeqCst) < 2 {
            assert!(
                second_started.elapsed() < Duration::from_secs(5),
                "queued session never closed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lag = second_started.elapsed();
        assert!(lag < Duration::from_millis(2500), "queued session outlived its stage: {lag:?}");

        for handle in [first, second] {
            let outcome = handle.await.unwrap();
            assert!(outcome.winner.is_none());
            assert_ne!(outcome.stages[0].status, StageStatus::Success);
        }
        assert_eq!(launcher.counters.launched.load(Ordering::SeqCst), 2);
        assert_eq!(launcher.counters.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_session_cap() {
        let mut mock = MockLauncher::new(RENDERED);
        mock.navigate_delay = Duration::from_millis(150);
        let launcher = Arc::new(mock);
        let stage = Arc::new(stage(&config(2), launcher.clone()));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let stage = stage.clone();
                tokio::spawn(async move { stage.fetch(&target()).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(launcher.counters.launched.load(Ordering::SeqCst), 6);
        assert_eq!(launcher.counters.closed.load(Ordering::SeqCst), 6);
        assert!(launcher.counters.peak.load(Ordering::SeqCst) <= 2);
    }
}
