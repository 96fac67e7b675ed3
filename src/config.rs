use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_ADDR: &str = "0.0.0.0:3001";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";
const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

const DEFAULT_OEMBED_TIMEOUT_SECS: u64 = 8;
const DEFAULT_DIRECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RELAY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BROWSER_TIMEOUT_SECS: u64 = 30;

const DEFAULT_BROWSER_SESSIONS: usize = 2;
const DEFAULT_SCROLL_CYCLES: u8 = 2;
const DEFAULT_SETTLE_TIMEOUT_MS: u64 = 3000;

const DEFAULT_PLACEHOLDER_TITLE: &str = "Untitled";
const DEFAULT_CACHE_TTL_SECS: u64 = 300;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub oembed: OembedConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub result: ResultConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

/// Outbound HTTP settings shared by every network stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Sent on direct and relayed page fetches. Script-looking agents get blocked.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Retried once through this proxy when a direct fetch fails at the network level.
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,

    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    #[serde(default)]
    pub block_private_ips: bool,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            accept_invalid_certs: false,
            proxy: None,
            allowed_schemes: default_allowed_schemes(),
            blocked_hosts: Vec::new(),
            block_private_ips: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

/// Per-stage switches and deadlines for the strategy pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagesConfig {
    #[serde(default = "yes")]
    pub oembed_enabled: bool,
    #[serde(default = "yes")]
    pub direct_enabled: bool,
    #[serde(default = "yes")]
    pub relay_enabled: bool,
    #[serde(default = "yes")]
    pub browser_enabled: bool,

    #[serde(default = "default_oembed_timeout_secs")]
    pub oembed_timeout_secs: u64,
    #[serde(default = "default_direct_timeout_secs")]
    pub direct_timeout_secs: u64,
    #[serde(default = "default_relay_timeout_secs")]
    pub relay_timeout_secs: u64,
    #[serde(default = "default_browser_timeout_secs")]
    pub browser_timeout_secs: u64,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            oembed_enabled: true,
            direct_enabled: true,
            relay_enabled: true,
            browser_enabled: true,
            oembed_timeout_secs: DEFAULT_OEMBED_TIMEOUT_SECS,
            direct_timeout_secs: DEFAULT_DIRECT_TIMEOUT_SECS,
            relay_timeout_secs: DEFAULT_RELAY_TIMEOUT_SECS,
            browser_timeout_secs: DEFAULT_BROWSER_TIMEOUT_SECS,
        }
    }
}

impl StagesConfig {
    pub fn oembed_timeout(&self) -> Duration {
        Duration::from_secs(self.oembed_timeout_secs)
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_timeout_secs)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn browser_timeout(&self) -> Duration {
        Duration::from_secs(self.browser_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OembedProvider {
    /// Platform tag as produced by the classifier, e.g. "YouTube".
    pub platform: String,
    pub endpoint: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OembedConfig {
    #[serde(default = "default_oembed_providers")]
    pub providers: Vec<OembedProvider>,
}

impl Default for OembedConfig {
    fn default() -> Self {
        Self {
            providers: default_oembed_providers(),
        }
    }
}

/// CORS relays, tried in order. `{url}` is replaced by the url-encoded target,
/// `{raw_url}` by the target as is; without a placeholder the encoded target is appended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_endpoints")]
    pub endpoints: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoints: default_relay_endpoints(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlatformRule {
    /// A domain (matches itself and its subdomains) or, with `regex: true`, a
    /// case-insensitive pattern tested against the hostname.
    pub pattern: String,
    pub platform: String,
    #[serde(default)]
    pub regex: bool,
}

impl PlatformRule {
    pub(crate) fn domain(pattern: &str, platform: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            platform: platform.to_string(),
            regex: false,
        }
    }

    pub(crate) fn regex(pattern: &str, platform: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            platform: platform.to_string(),
            regex: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformsConfig {
    /// First match wins.
    #[serde(default = "default_platform_rules")]
    pub rules: Vec<PlatformRule>,

    /// Labels skipped from the right when deriving a brand name from an unknown host.
    #[serde(default = "default_brand_suffixes")]
    pub brand_suffixes: Vec<String>,
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            rules: default_platform_rules(),
            brand_suffixes: default_brand_suffixes(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Image candidates whose url contains any of these are never picked.
    #[serde(default = "default_image_denylist")]
    pub image_denylist: Vec<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            image_denylist: default_image_denylist(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Upper bound on simultaneous headless sessions.
    #[serde(default = "default_browser_sessions")]
    pub max_sessions: usize,

    #[serde(default)]
    pub chrome_path: Option<PathBuf>,

    #[serde(default = "default_viewport_width")]
    pub viewport_width: u32,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: u32,

    #[serde(default = "default_scroll_cycles")]
    pub scroll_cycles: u8,

    /// Bound on each wait-for-quiet poll after navigation and after a scroll.
    #[serde(default = "default_settle_timeout_ms")]
    pub settle_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_BROWSER_SESSIONS,
            chrome_path: None,
            viewport_width: default_viewport_width(),
            viewport_height: default_viewport_height(),
            scroll_cycles: DEFAULT_SCROLL_CYCLES,
            settle_timeout_ms: DEFAULT_SETTLE_TIMEOUT_MS,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResultConfig {
    #[serde(default = "default_placeholder_title")]
    pub placeholder_title: String,
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            placeholder_title: default_placeholder_title(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 0 disables the cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

fn yes() -> bool {
    true
}

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_allowed_schemes() -> Vec<String> {
    vec!["http".to_string(), "https".to_string()]
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_oembed_timeout_secs() -> u64 {
    DEFAULT_OEMBED_TIMEOUT_SECS
}

fn default_direct_timeout_secs() -> u64 {
    DEFAULT_DIRECT_TIMEOUT_SECS
}

fn default_relay_timeout_secs() -> u64 {
    DEFAULT_RELAY_TIMEOUT_SECS
}

fn default_browser_timeout_secs() -> u64 {
    DEFAULT_BROWSER_TIMEOUT_SECS
}

fn default_oembed_providers() -> Vec<OembedProvider> {
    [
        ("YouTube", "https://www.youtube.com/oembed"),
        ("TikTok", "https://www.tiktok.com/oembed"),
        ("Twitter", "https://publish.twitter.com/oembed"),
        ("Instagram", "https://api.instagram.com/oembed/"),
    ]
    .into_iter()
    .map(|(platform, endpoint)| OembedProvider {
        platform: platform.to_string(),
        endpoint: endpoint.to_string(),
    })
    .collect()
}

fn default_relay_endpoints() -> Vec<String> {
    vec![
        "https://api.allorigins.win/get?url={url}".to_string(),
        "https://thingproxy.freeboard.io/fetch/{raw_url}".to_string(),
    ]
}

fn default_platform_rules() -> Vec<PlatformRule> {
    vec![
        PlatformRule::domain("youtube.com", "YouTube"),
        PlatformRule::domain("youtu.be", "YouTube"),
        PlatformRule::domain("instagram.com", "Instagram"),
        PlatformRule::domain("instagr.am", "Instagram"),
        PlatformRule::domain("tiktok.com", "TikTok"),
        PlatformRule::domain("facebook.com", "Facebook"),
        PlatformRule::domain("fb.watch", "Facebook"),
        PlatformRule::domain("fb.com", "Facebook"),
        PlatformRule::domain("twitter.com", "Twitter"),
        PlatformRule::domain("x.com", "Twitter"),
        PlatformRule::regex(r"(^|\.)shopee\.", "Shopee"),
        PlatformRule::regex(r"(^|\.)lazada\.", "Lazada"),
        PlatformRule::domain("twitch.tv", "Twitch"),
    ]
}

fn default_brand_suffixes() -> Vec<String> {
    ["co", "com", "net", "org", "tv", "io", "th"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_image_denylist() -> Vec<String> {
    [
        "unsplash.com",
        "placeholder.com",
        "placehold.co",
        "placekitten.com",
        "dummyimage.com",
        "to-do-doing-done",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_browser_sessions() -> usize {
    DEFAULT_BROWSER_SESSIONS
}

fn default_viewport_width() -> u32 {
    1280
}

fn default_viewport_height() -> u32 {
    800
}

fn default_scroll_cycles() -> u8 {
    DEFAULT_SCROLL_CYCLES
}

fn default_settle_timeout_ms() -> u64 {
    DEFAULT_SETTLE_TIMEOUT_MS
}

fn default_placeholder_title() -> String {
    DEFAULT_PLACEHOLDER_TITLE.to_string()
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let stages = &self.stages;
        for (name, secs) in [
            ("stages.oembed_timeout_secs", stages.oembed_timeout_secs),
            ("stages.direct_timeout_secs", stages.direct_timeout_secs),
            ("stages.relay_timeout_secs", stages.relay_timeout_secs),
            ("stages.browser_timeout_secs", stages.browser_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{name} must be greater than 0");
            }
        }

        if self.browser.max_sessions == 0 {
            bail!("browser.max_sessions must be greater than 0");
        }

        if self.browser.scroll_cycles > 5 {
            bail!(
                "browser.scroll_cycles must be at most 5, got {}",
                self.browser.scroll_cycles
            );
        }

        if self.fetch.allowed_schemes.is_empty() {
            bail!("fetch.allowed_schemes must not be empty");
        }

        for (idx, rule) in self.platforms.rules.iter().enumerate() {
            let idx = idx + 1;
            if rule.pattern.trim().is_empty() || rule.platform.trim().is_empty() {
                bail!("platform rule #{idx} is empty");
            }
            if rule.regex {
                regex::Regex::new(&rule.pattern)
                    .with_context(|| format!("platform rule #{idx} has an invalid regex"))?;
            }
        }

        if self.result.placeholder_title.trim().is_empty() {
            bail!("result.placeholder_title must not be empty");
        }

        for relay in &self.relay.endpoints {
            if !relay.starts_with("http://") && !relay.starts_with("https://") {
                bail!("relay endpoint {relay:?} must be an http(s) url");
            }
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing the defaults on first run.
    pub fn load_with(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref();
        let config_path = base_path.join(CONFIG_FILE);

        if !config_path.exists() {
            std::fs::create_dir_all(base_path)
                .with_context(|| format!("failed to create {}", base_path.display()))?;
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&config_path, defaults)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
            log::info!("wrote default config to {}", config_path.display());
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", config_path.display()))?;

        config.validate()?;

        Ok(config)
    }
}

/// `LINKKEEP_BASE_PATH`, falling back to `~/.config/linkkeep`.
pub fn default_base_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("LINKKEEP_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = homedir::my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;

    Ok(home.join(".config").join("linkkeep"))
}
