pub mod browser;
pub mod heuristics;
pub mod http;

use crate::config::ScrapeConfig;
use crate::metadata::platform::Platform;
use crate::metadata::types::RawMetadata;
use heuristics::ThumbnailHeuristic;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use std::{cmp::Ordering, collections::HashMap};
use url::Url;

static META_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta").expect("meta selector"));
static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("title selector"));
static H1_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").expect("h1 selector"));
static LINK_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("link").expect("link selector"));
static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("img selector"));
static JSON_LD_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("json-ld selector")
});
static AUTHOR_NAME_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"[itemprop="author"] link[itemprop="name"], link[itemprop="name"]"#)
        .expect("author name selector")
});
static AUTHOR_AVATAR_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"[itemprop="author"] link[itemprop="thumbnailUrl"], img[class*="channel"]"#)
        .expect("author avatar selector")
});

/// Noise around page titles, applied in order.
static TITLE_NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // notification counters, "(3) Facebook"
        r"^\([^)]*\)\s+",
        r"(?is)\s+on\s+(Instagram|Twitter|X):\s+.*$",
        r"(?i)\s+[-|•·/]\s+(YouTube|Instagram|TikTok|Facebook|Twitter|X)$",
        r"\s*[-|•·/:]+\s*$",
    ]
    .into_iter()
    .map(|re| Regex::new(re).expect("title noise regex"))
    .collect()
});

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

const BLOCKED_PAGE_MARKERS: [&str; 4] = [
    "sorry, you have been blocked",
    "verify you are human by completing the action below",
    "<title>just a moment...</title>",
    "attention required! | cloudflare",
];

/// Result of scraping a single document.
///
/// `thumbnail` only holds real preview images; the favicon is kept apart so
/// callers can decide whether an icon is an acceptable stand-in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapedPage {
    pub title: String,
    pub description: String,
    pub thumbnail: String,
    pub favicon: String,
    pub channel_name: Option<String>,
    pub channel_avatar: Option<String>,
}

impl ScrapedPage {
    /// Stage output. The favicon travels separately and is only used by the
    /// normalizer once every other thumbnail source came up empty.
    pub fn into_raw(self) -> RawMetadata {
        RawMetadata {
            title: non_empty(self.title),
            description: non_empty(self.description),
            thumbnail: non_empty(self.thumbnail),
            favicon: non_empty(self.favicon),
            channel_name: self.channel_name.and_then(non_empty),
            channel_avatar: self.channel_avatar.and_then(non_empty),
        }
    }
}

pub struct Scraper {
    image_denylist: Vec<String>,
    heuristics: Vec<Box<dyn ThumbnailHeuristic>>,
}

impl Scraper {
    pub fn new(config: &ScrapeConfig) -> Self {
        Self {
            image_denylist: config
                .image_denylist
                .iter()
                .map(|entry| entry.trim().to_lowercase())
                .filter(|entry| !entry.is_empty())
                .collect(),
            heuristics: heuristics::default_heuristics(),
        }
    }

    pub fn with_heuristics(mut self, heuristics: Vec<Box<dyn ThumbnailHeuristic>>) -> Self {
        self.heuristics = heuristics;
        self
    }

    pub fn scrape(&self, html: &str, source_url: &str) -> ScrapedPage {
        self.scrape_as(html, source_url, &Platform::Other)
    }

    /// Same as [`Scraper::scrape`], with the per-platform thumbnail heuristics for `platform`.
    pub fn scrape_as(&self, html: &str, source_url: &str, platform: &Platform) -> ScrapedPage {
        let document = Html::parse_document(html);
        let base = Url::parse(source_url).ok();
        let meta = MetaTags::collect(&document);
        let structured = StructuredData::collect(&document);

        let title = meta
            .first(&["og:title", "twitter:title", "title"])
            .map(str::to_string)
            .or_else(|| first_text(&document, &TITLE_SELECTOR))
            .or_else(|| first_text(&document, &H1_SELECTOR))
            .or_else(|| structured.name.clone())
            .map(|t| clean_title(&t))
            .unwrap_or_default();

        let description = meta
            .first(&["og:description", "twitter:description", "description"])
            .map(str::to_string)
            .or_else(|| structured.description.clone())
            .map(|d| collapse_whitespace(&d))
            .unwrap_or_default();

        let thumbnail = self
            .meta_image(&meta, base.as_ref())
            .or_else(|| {
                structured
                    .image
                    .as_deref()
                    .and_then(|img| self.accept_image(img, base.as_ref()))
            })
            .or_else(|| self.heuristic_image(&document, platform, base.as_ref()))
            .or_else(|| self.largest_image(&document, base.as_ref()))
            .unwrap_or_default();

        let favicon = favicon(&document, base.as_ref()).unwrap_or_default();

        let channel_name = meta
            .first(&["author"])
            .map(str::to_string)
            .or_else(|| {
                document
                    .select(&AUTHOR_NAME_SELECTOR)
                    .filter_map(|el| el.attr("content"))
                    .map(str::trim)
                    .find(|name| !name.is_empty())
                    .map(str::to_string)
            })
            .or_else(|| structured.author.clone());

        let channel_avatar = document
            .select(&AUTHOR_AVATAR_SELECTOR)
            .filter_map(|el| el.attr("href").or_else(|| el.attr("src")))
            .find_map(|src| self.accept_image(src, base.as_ref()));

        ScrapedPage {
            title,
            description,
            thumbnail,
            favicon,
            channel_name,
            channel_avatar,
        }
    }

    fn meta_image(&self, meta: &MetaTags, base: Option<&Url>) -> Option<String> {
        [
            "og:image",
            "og:image:secure_url",
            "og:image:url",
            "twitter:image",
            "twitter:image:src",
        ]
        .into_iter()
        .filter_map(|key| meta.get(key))
        .find_map(|img| self.accept_image(img, base))
    }

    fn heuristic_image(
        &self,
        document: &Html,
        platform: &Platform,
        base: Option<&Url>,
    ) -> Option<String> {
        self.heuristics
            .iter()
            .filter(|h| h.applies_to(platform))
            .find_map(|h| {
                let found = h.thumbnail(document)?;
                log::debug!("thumbnail heuristic {} matched", h.name());
                self.accept_image(&found, base)
            })
    }

    /// Largest `<img>` by declared area. Images without both dimensions never qualify.
    fn largest_image(&self, document: &Html, base: Option<&Url>) -> Option<String> {
        let mut best: Option<(u64, String)> = None;

        for element in document.select(&IMG_SELECTOR) {
            let (Some(width), Some(height)) = (
                dimension(element.attr("width")),
                dimension(element.attr("height")),
            ) else {
                continue;
            };

            let src = element
                .attr("src")
                .filter(|s| !s.trim().is_empty())
                .or_else(|| element.attr("data-src"))
                .unwrap_or_default();

            let Some(src) = self.accept_image(src, base) else {
                continue;
            };

            let area = width.saturating_mul(height);
            if best.as_ref().map_or(true, |(best_area, _)| area > *best_area) {
                best = Some((area, src));
            }
        }

        best.map(|(_, src)| src)
    }

    fn accept_image(&self, src: &str, base: Option<&Url>) -> Option<String> {
        let resolved = resolve_url(src, base)?;
        let lowered = resolved.to_lowercase();
        if self.image_denylist.iter().any(|entry| lowered.contains(entry)) {
            log::debug!("skipping denylisted image {resolved}");
            return None;
        }
        Some(resolved)
    }
}

/// Rewrites `//` to https and resolves relative paths against `base`.
/// Anything that does not end up as an absolute http(s) url is dropped, `data:` included.
pub fn resolve_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.to_ascii_lowercase().starts_with("data:") {
        return None;
    }

    let parsed = if let Some(rest) = raw.strip_prefix("//") {
        Url::parse(&format!("https://{rest}")).ok()?
    } else {
        match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok()?,
            Err(_) => return None,
        }
    };

    matches!(parsed.scheme(), "http" | "https").then(|| parsed.to_string())
}

/// Strips platform suffixes, notification counters and dangling separators.
pub fn clean_title(title: &str) -> String {
    let original = collapse_whitespace(title);
    let mut cleaned = original.clone();
    for noise in TITLE_NOISE.iter() {
        cleaned = noise.replace(&cleaned, "").trim().to_string();
    }

    if cleaned.is_empty() {
        original
    } else {
        cleaned
    }
}

/// Challenge and block pages scrape into misleading titles.
pub fn looks_blocked(html: &str) -> bool {
    let lowered = html.to_lowercase();
    BLOCKED_PAGE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

fn collapse_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").into_owned()
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|text| !text.is_empty())
}

fn dimension(value: Option<&str>) -> Option<u64> {
    let value = value?.trim().trim_end_matches("px").trim();
    let parsed = value.parse::<f64>().ok()?;
    (parsed.is_finite() && parsed >= 1.0).then_some(parsed as u64)
}

/// Declared favicon, png preferred over ico, else `{origin}/favicon.ico`.
fn favicon(document: &Html, base: Option<&Url>) -> Option<String> {
    let mut icons = Vec::new();
    for element in document.select(&LINK_SELECTOR) {
        let rel = element.attr("rel").unwrap_or_default().to_lowercase();
        let href = element.attr("href").unwrap_or_default();
        if !rel.contains("icon") || href.is_empty() {
            continue;
        }

        if href.contains("base64,") {
            log::debug!("base64 icons are not supported");
            continue;
        }

        if let Some(href) = resolve_url(href, base) {
            icons.push(href);
        }
    }

    icons.sort_by(|a, b| {
        let (a_ico, b_ico) = (a.contains(".ico"), b.contains(".ico"));
        let (a_png, b_png) = (a.contains(".png"), b.contains(".png"));
        match (a_ico, b_ico) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => b_png.cmp(&a_png),
        }
    });

    icons.into_iter().next().or_else(|| {
        let base = base?;
        if !matches!(base.scheme(), "http" | "https") {
            return None;
        }
        base.join("/favicon.ico").ok().map(String::from)
    })
}

/// `<meta>` content keyed by lowercased `property` and `name`. The first non-empty value wins.
struct MetaTags(HashMap<String, String>);

impl MetaTags {
    fn collect(document: &Html) -> Self {
        let mut tags = HashMap::new();
        for element in document.select(&META_SELECTOR) {
            let content = element.attr("content").unwrap_or_default().trim();
            if content.is_empty() {
                continue;
            }

            for key in [element.attr("property"), element.attr("name")]
                .into_iter()
                .flatten()
            {
                tags.entry(key.trim().to_lowercase())
                    .or_insert_with(|| content.to_string());
            }
        }
        Self(tags)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn first(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }
}

#[derive(Default)]
struct StructuredData {
    name: Option<String>,
    description: Option<String>,
    image: Option<String>,
    author: Option<String>,
}

impl StructuredData {
    fn collect(document: &Html) -> Self {
        let mut data = Self::default();
        for element in document.select(&JSON_LD_SELECTOR) {
            let json_text = element.text().collect::<String>();
            match serde_json::from_str::<serde_json::Value>(&json_text) {
                Ok(json) => data.absorb(&json),
                Err(err) => log::debug!("ignoring malformed json-ld: {err}"),
            }
        }
        data
    }

    /// Only fills empty slots, so the first object carrying a field wins.
    fn absorb(&mut self, json: &serde_json::Value) {
        if let Some(graph) = json.get("@graph").and_then(|g| g.as_array()) {
            graph.iter().for_each(|item| self.absorb(item));
            return;
        }
        if let Some(items) = json.as_array() {
            items.iter().for_each(|item| self.absorb(item));
            return;
        }

        if self.name.is_none() {
            self.name = json
                .get("headline")
                .or_else(|| json.get("name"))
                .and_then(|v| v.as_str())
                .and_then(|v| non_empty(v.to_string()));
        }
        if self.description.is_none() {
            self.description = json
                .get("description")
                .and_then(|v| v.as_str())
                .and_then(|v| non_empty(v.to_string()));
        }
        if self.image.is_none() {
            self.image = json
                .get("image")
                .or_else(|| json.get("thumbnailUrl"))
                .and_then(url_of);
        }
        if self.author.is_none() {
            self.author = json.get("author").and_then(name_of);
        }
    }
}

fn url_of(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(url) => non_empty(url.clone()),
        serde_json::Value::Array(items) => items.first().and_then(url_of),
        serde_json::Value::Object(_) => value
            .get("url")
            .or_else(|| value.get("contentUrl"))
            .and_then(url_of),
        _ => None,
    }
}

fn name_of(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(name) => non_empty(name.clone()),
        serde_json::Value::Array(items) => items.iter().find_map(name_of),
        serde_json::Value::Object(_) => value.get("name").and_then(name_of),
        _ => None,
    }
}
