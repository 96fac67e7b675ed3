//! Result normalization and url canonicalization.

use crate::config::ResultConfig;
use crate::metadata::platform::Platform;
use crate::metadata::types::{MetadataResult, RawMetadata};
use crate::scrape::{clean_title, resolve_url};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static YOUTUBE_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:youtube\.com/(?:watch\?(?:[^#]*&)?v=|embed/|shorts/|live/|v/)|youtu\.be/)([A-Za-z0-9_-]{11})",
    )
    .expect("Failed to compile YouTube regex")
});

static SHOPEE_ITEM_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-i\.[0-9]+\.[0-9]+$").expect("Failed to compile Shopee regex"));

const TRACKING_PARAMS: [&str; 10] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "ref",
    "mc_cid",
    "mc_eid",
];

/// The only place a [`MetadataResult`] is built.
pub struct Normalizer {
    placeholder_title: String,
}

impl Normalizer {
    pub fn new(config: &ResultConfig) -> Self {
        Self {
            placeholder_title: config.placeholder_title.trim().to_string(),
        }
    }

    /// Turn whatever the stages found into a well-formed result. Never fails.
    ///
    /// YouTube pages without a thumbnail get the deterministic `hqdefault` image
    /// for their video id. Shopee pages without a title get one derived from the
    /// product slug in the path. The favicon is the last resort for a thumbnail.
    pub fn normalize(
        &self,
        raw: RawMetadata,
        platform: &Platform,
        source_url: &str,
    ) -> MetadataResult {
        let base = Url::parse(source_url).ok();

        let mut title = raw
            .title
            .as_deref()
            .map(clean_title)
            .unwrap_or_default();
        if title.is_empty() && *platform == Platform::Shopee {
            title = shopee_slug_title(source_url).unwrap_or_default();
        }
        if title.is_empty() {
            title = self.placeholder_title.clone();
        }

        let description = raw
            .description
            .as_deref()
            .map(|d| d.split_whitespace().collect::<Vec<_>>().join(" "))
            .unwrap_or_default();

        let mut thumbnail = raw
            .thumbnail
            .as_deref()
            .and_then(|t| resolve_url(t, base.as_ref()))
            .unwrap_or_default();
        if thumbnail.is_empty() && *platform == Platform::YouTube {
            if let Some(id) = youtube_video_id(source_url) {
                thumbnail = format!("https://img.youtube.com/vi/{id}/hqdefault.jpg");
            }
        }
        if thumbnail.is_empty() {
            thumbnail = raw
                .favicon
                .as_deref()
                .and_then(|icon| resolve_url(icon, base.as_ref()))
                .unwrap_or_default();
        }

        let channel_name = raw
            .channel_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        let channel_avatar = raw
            .channel_avatar
            .as_deref()
            .and_then(|avatar| resolve_url(avatar, base.as_ref()));

        MetadataResult::new(
            title,
            description,
            thumbnail,
            platform.clone(),
            channel_name,
            channel_avatar,
        )
    }

    /// Placeholder record carrying only the platform, for input that could not be fetched at all.
    pub fn classification_only(&self, platform: Platform) -> MetadataResult {
        MetadataResult::new(
            self.placeholder_title.clone(),
            String::new(),
            String::new(),
            platform,
            None,
            None,
        )
    }
}

pub fn youtube_video_id(url: &str) -> Option<String> {
    YOUTUBE_ID
        .captures(url)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_owned()))
}

/// `https://shopee.co.th/Some-Product-Name-i.123.456` → `Some Product Name`.
pub fn shopee_slug_title(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.find(|s| !s.is_empty())?;
    let decoded = urlencoding::decode(segment).ok()?;

    if !SHOPEE_ITEM_SUFFIX.is_match(&decoded) {
        return None;
    }

    let name = SHOPEE_ITEM_SUFFIX
        .replace(&decoded, "")
        .split('-')
        .filter(|word| !word.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    (!name.is_empty()).then_some(name)
}

/// Canonical form of a url, used before fetching and as the cache key.
///
/// Applies the following transformations:
/// - Strips known tracking query parameters (utm_*, fbclid, gclid, ref, mc_*)
/// - Removes trailing slashes from the path (preserves root `/`)
/// - Lowercases the hostname
/// - Converts protocol-relative URLs to https
///
/// Returns the original string if the URL cannot be parsed.
pub fn normalize_url(url: &str) -> String {
    // Handle protocol-relative URLs
    let url_to_parse = if url.starts_with("//") {
        format!("https:{}", url)
    } else {
        url.to_string()
    };

    let mut parsed = match Url::parse(&url_to_parse) {
        Ok(u) => u,
        Err(_) => return url.to_string(), // Return original if malformed
    };

    if let Some(host) = parsed.host_str() {
        let lowercased = host.to_lowercase();
        if parsed.set_host(Some(&lowercased)).is_err() {
            return url.to_string();
        }
    }

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !TRACKING_PARAMS.contains(&key.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }

    // Strip trailing slashes from path (but keep root `/`)
    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        parsed.set_path(trimmed);
    }

    parsed.to_string()
}
