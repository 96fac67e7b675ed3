//! Headless browser sessions.
//!
//! A session is an OS process, so every session handed out by a
//! [`BrowserLauncher`] is wrapped in a [`SessionGuard`] which closes it exactly
//! once, whichever way [`render_page`] exits. All waits are bounded by the
//! render deadline and a shared cancel flag checked between steps.

use anyhow::{bail, Result};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub user_agent: String,
    pub viewport: (u32, u32),
    pub chrome_path: Option<PathBuf>,
    pub proxy: Option<String>,
    /// Upper bound for the whole session; the process is reaped after this even if orphaned.
    pub idle_timeout: Duration,
}

pub trait BrowserLauncher: Send + Sync {
    fn launch(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>>;
}

pub trait BrowserSession: Send {
    /// Navigate and wait for the load event, giving up after `timeout`.
    fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;

    /// Wait until the document is complete and no new resources arrive, up to `timeout`.
    fn settle(&mut self, timeout: Duration) -> Result<()>;

    /// Scroll to the bottom to trigger lazy content, then settle.
    fn scroll(&mut self, timeout: Duration) -> Result<()>;

    fn is_challenge(&mut self) -> bool;

    /// Serialized live DOM, with rendered image sizes written back as `width`/`height`.
    fn content(&mut self) -> Result<String>;

    fn close(&mut self);
}

/// Owns a session and closes it exactly once, on [`SessionGuard::close`] or on drop.
pub struct SessionGuard {
    session: Box<dyn BrowserSession>,
    closed: bool,
}

impl SessionGuard {
    pub fn new(session: Box<dyn BrowserSession>) -> Self {
        Self {
            session,
            closed: false,
        }
    }

    pub fn session(&mut self) -> &mut dyn BrowserSession {
        self.session.as_mut()
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.session.close();
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub options: SessionOptions,
    /// Set by the caller before queueing for a session; waiting counts against it.
    pub deadline: Instant,
    pub settle_timeout: Duration,
    pub scroll_cycles: u8,
    pub cancel: Arc<AtomicBool>,
}

/// Launch a session, load `url` and return the rendered DOM.
///
/// Blocking; meant to run on a blocking thread.
pub fn render_page(launcher: &dyn BrowserLauncher, request: &RenderRequest) -> Result<String> {
    let deadline = request.deadline;
    checkpoint(request, deadline)?;

    let mut guard = SessionGuard::new(launcher.launch(&request.options)?);
    let result = drive(guard.session(), request, deadline);
    guard.close();
    result
}

fn drive(
    session: &mut dyn BrowserSession,
    request: &RenderRequest,
    deadline: Instant,
) -> Result<String> {
    let remaining = checkpoint(request, deadline)?;
    session.navigate(&request.url, remaining)?;

    let remaining = checkpoint(request, deadline)?;
    if let Err(err) = session.settle(request.settle_timeout.min(remaining)) {
        log::debug!("{}: page did not settle: {err}", request.url);
    }

    for cycle in 0..request.scroll_cycles {
        let remaining = checkpoint(request, deadline)?;
        if let Err(err) = session.scroll(request.settle_timeout.min(remaining)) {
            log::debug!("{}: scroll cycle {cycle} failed: {err}", request.url);
            break;
        }
    }

    checkpoint(request, deadline)?;
    if session.is_challenge() {
        bail!("{}: challenge page detected", request.url);
    }

    session.content()
}

fn checkpoint(request: &RenderRequest, deadline: Instant) -> Result<Duration> {
    if request.cancel.load(Ordering::SeqCst) {
        bail!("{}: render cancelled", request.url);
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        bail!("{}: render deadline elapsed", request.url);
    }

    Ok(remaining)
}

#[cfg(feature = "headless")]
pub use chrome::ChromeLauncher;

#[cfg(feature = "headless")]
mod chrome {
    use super::{BrowserLauncher, BrowserSession, SessionOptions};
    use anyhow::{anyhow, Result};
    use headless_chrome::{protocol::cdp::Page, Browser, LaunchOptionsBuilder, Tab};
    use std::{
        sync::Arc,
        thread::sleep,
        time::{Duration, Instant},
    };

    const POLL_INTERVAL: Duration = Duration::from_millis(100);
    const QUIET_PERIOD: Duration = Duration::from_millis(500);

    const HIDE_WEBDRIVER: &str =
        "Object.defineProperty(navigator, 'webdriver', {get: () => undefined});";

    const LOAD_STATE: &str =
        "document.readyState + ':' + performance.getEntriesByType('resource').length";

    const CHALLENGE_CHECK: &str = r#"
        !!(document.querySelector('iframe[src*="challenge"]')
           || document.querySelector('div[id*="cf-"], div[class*="cf-"]')
           || document.querySelector('iframe[src*="hcaptcha"], iframe[src*="turnstile"]'))
    "#;

    const MARK_IMAGE_SIZES: &str = r#"
        (() => {
            for (const img of document.images) {
                if (img.naturalWidth > 0 && img.naturalHeight > 0) {
                    img.setAttribute('width', String(img.naturalWidth));
                    img.setAttribute('height', String(img.naturalHeight));
                }
                if (!img.getAttribute('src') && img.currentSrc) {
                    img.setAttribute('src', img.currentSrc);
                }
            }
            return document.images.length;
        })()
    "#;

    /// Launches a fresh Chrome process per session.
    pub struct ChromeLauncher;

    impl BrowserLauncher for ChromeLauncher {
        fn launch(&self, options: &SessionOptions) -> Result<Box<dyn BrowserSession>> {
            let launch_options = LaunchOptionsBuilder::default()
                .sandbox(false)
                .headless(true)
                .window_size(Some(options.viewport))
                .path(options.chrome_path.clone())
                .proxy_server(options.proxy.as_deref())
                .idle_browser_timeout(options.idle_timeout)
                .build()
                .map_err(|err| anyhow!("invalid chrome launch options: {err}"))?;

            let browser = Browser::new(launch_options)?;
            // from here on the process is owned by the session and reaped by close()
            let mut session = ChromeSession {
                browser: Some(browser),
                tab: None,
            };

            let tab = session
                .browser
                .as_ref()
                .ok_or_else(|| anyhow!("browser already closed"))?
                .new_tab()?;
            session.tab = Some(tab.clone());

            if let Err(err) = prepare_tab(&tab, options) {
                session.close();
                return Err(err);
            }

            Ok(Box::new(session))
        }
    }

    fn prepare_tab(tab: &Tab, options: &SessionOptions) -> Result<()> {
        tab.enable_stealth_mode()?;
        tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
            run_immediately: Some(true),
            source: HIDE_WEBDRIVER.to_string(),
            world_name: None,
            include_command_line_api: None,
        })?;
        tab.set_user_agent(&options.user_agent, Some("en-US,en"), None)?;
        Ok(())
    }

    struct ChromeSession {
        browser: Option<Browser>,
        tab: Option<Arc<Tab>>,
    }

    impl ChromeSession {
        fn tab(&self) -> Result<&Arc<Tab>> {
            self.tab.as_ref().ok_or_else(|| anyhow!("session is closed"))
        }

        fn load_state(&self) -> Result<(bool, u64)> {
            let value = self
                .tab()?
                .evaluate(LOAD_STATE, false)?
                .value
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();

            let (state, resources) = value.split_once(':').unwrap_or((value.as_str(), "0"));
            Ok((state == "complete", resources.parse().unwrap_or(0)))
        }
    }

    impl BrowserSession for ChromeSession {
        fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
            let tab = self.tab()?;
            tab.set_default_timeout(timeout);
            tab.navigate_to(url)?;
            tab.wait_until_navigated()?;
            Ok(())
        }

        fn settle(&mut self, timeout: Duration) -> Result<()> {
            let started = Instant::now();
            let mut last_count = None;
            let mut quiet_since = Instant::now();

            while started.elapsed() < timeout {
                let (complete, count) = self.load_state()?;
                if last_count != Some(count) {
                    last_count = Some(count);
                    quiet_since = Instant::now();
                } else if complete && quiet_since.elapsed() >= QUIET_PERIOD {
                    return Ok(());
                }
                sleep(POLL_INTERVAL.min(timeout.saturating_sub(started.elapsed())));
            }

            Err(anyhow!("network did not go idle within {timeout:?}"))
        }

        fn scroll(&mut self, timeout: Duration) -> Result<()> {
            self.tab()?
                .evaluate("window.scrollTo(0, document.body.scrollHeight)", false)?;
            self.settle(timeout)
        }

        fn is_challenge(&mut self) -> bool {
            let Ok(tab) = self.tab() else {
                return false;
            };

            let title = tab.get_title().unwrap_or_default();
            if title.to_lowercase().contains("just a moment") {
                return true;
            }

            tab.evaluate(CHALLENGE_CHECK, false)
                .ok()
                .and_then(|v| v.value.and_then(|x| x.as_bool()))
                .unwrap_or(false)
        }

        fn content(&mut self) -> Result<String> {
            let tab = self.tab()?;
            if let Err(err) = tab.evaluate(MARK_IMAGE_SIZES, false) {
                log::debug!("could not mark rendered image sizes: {err}");
            }
            tab.get_content()
        }

        fn close(&mut self) {
            if let Some(tab) = self.tab.take() {
                if let Err(err) = tab.close(false) {
                    log::debug!("failed to close tab: {err}");
                }
            }
            // dropping the browser kills the chrome process
            self.browser.take();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Where a scripted session should fail.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum FailAt {
        Nowhere,
        Navigate,
        Content,
        Challenge,
    }

    #[derive(Default)]
    pub struct Counters {
        pub launched: AtomicUsize,
        pub closed: AtomicUsize,
        pub active: AtomicUsize,
        pub peak: AtomicUsize,
    }

    pub struct MockLauncher {
        pub counters: Arc<Counters>,
        pub html: String,
        pub fail_at: FailAt,
        pub fail_launch: bool,
        /// Time spent in navigate, to hold sessions open.
        pub navigate_delay: Duration,
    }

    impl MockLauncher {
        pub fn new(html: &str) -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                html: html.to_string(),
                fail_at: FailAt::Nowhere,
                fail_launch: false,
                navigate_delay: Duration::ZERO,
            }
        }
    }

    impl BrowserLauncher for MockLauncher {
        fn launch(&self, _options: &SessionOptions) -> Result<Box<dyn BrowserSession>> {
            if self.fail_launch {
                bail!("chrome binary not found");
            }

            self.counters.launched.fetch_add(1, Ordering::SeqCst);
            let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.peak.fetch_max(active, Ordering::SeqCst);

            Ok(Box::new(MockSession {
                counters: self.counters.clone(),
                html: self.html.clone(),
                fail_at: self.fail_at,
                navigate_delay: self.navigate_delay,
            }))
        }
    }

    struct MockSession {
        counters: Arc<Counters>,
        html: String,
        fail_at: FailAt,
        navigate_delay: Duration,
    }

    impl BrowserSession for MockSession {
        fn navigate(&mut self, _url: &str, timeout: Duration) -> Result<()> {
            std::thread::sleep(self.navigate_delay.min(timeout));
            if self.fail_at == FailAt::Navigate {
                bail!("net::ERR_NAME_NOT_RESOLVED");
            }
            Ok(())
        }

        fn settle(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn scroll(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn is_challenge(&mut self) -> bool {
            self.fail_at == FailAt::Challenge
        }

        fn content(&mut self) -> Result<String> {
            if self.fail_at == FailAt::Content {
                bail!("Execution context was destroyed");
            }
            Ok(self.html.clone())
        }

        fn close(&mut self) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn request(url: &str, timeout: Duration) -> RenderRequest {
        RenderRequest {
            url: url.to_string(),
            options: SessionOptions {
                user_agent: "test".into(),
                viewport: (1280, 800),
                chrome_path: None,
                proxy: None,
                idle_timeout: timeout,
            },
            deadline: Instant::now() + timeout,
            settle_timeout: Duration::from_millis(50),
            scroll_cycles: 2,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}
