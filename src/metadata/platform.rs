//! Hostname based platform classification.
//!
//! The rule table comes from [`PlatformsConfig`] and is evaluated in order, so
//! earlier rules take precedence. Hosts that match nothing get a name derived
//! from their brand label (`shop.example.co.th` → `Example`).

use crate::config::{PlatformRule, PlatformsConfig};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::{Host, Url};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Platform {
    YouTube,
    Instagram,
    TikTok,
    Facebook,
    Twitter,
    Shopee,
    Lazada,
    Twitch,
    Other,
    /// A platform outside the fixed set: a configured extension or a derived brand name.
    Named(String),
}

impl Platform {
    pub fn as_str(&self) -> &str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::Instagram => "Instagram",
            Platform::TikTok => "TikTok",
            Platform::Facebook => "Facebook",
            Platform::Twitter => "Twitter",
            Platform::Shopee => "Shopee",
            Platform::Lazada => "Lazada",
            Platform::Twitch => "Twitch",
            Platform::Other => "Other",
            Platform::Named(name) => name,
        }
    }

    /// Known names map to their canonical tag case-insensitively.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        match name.to_ascii_lowercase().as_str() {
            "youtube" => Platform::YouTube,
            "instagram" => Platform::Instagram,
            "tiktok" => Platform::TikTok,
            "facebook" => Platform::Facebook,
            "twitter" => Platform::Twitter,
            "shopee" => Platform::Shopee,
            "lazada" => Platform::Lazada,
            "twitch" => Platform::Twitch,
            "other" | "" => Platform::Other,
            _ => Platform::Named(name.to_string()),
        }
    }
}

impl From<String> for Platform {
    fn from(name: String) -> Self {
        Platform::from_name(&name)
    }
}

impl From<Platform> for String {
    fn from(platform: Platform) -> Self {
        platform.as_str().to_string()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Matcher {
    Domain(String),
    Pattern(Regex),
}

struct CompiledRule {
    matcher: Matcher,
    platform: Platform,
}

impl CompiledRule {
    fn compile(rule: &PlatformRule) -> Result<Self> {
        let matcher = if rule.regex {
            let regex = Regex::new(&format!("(?i){}", rule.pattern))
                .with_context(|| format!("invalid platform pattern {:?}", rule.pattern))?;
            Matcher::Pattern(regex)
        } else {
            let domain = rule.pattern.trim().trim_start_matches("www.").to_lowercase();
            Matcher::Domain(domain)
        };

        Ok(Self {
            matcher,
            platform: Platform::from_name(&rule.platform),
        })
    }

    fn matches(&self, host: &str) -> bool {
        match &self.matcher {
            Matcher::Domain(domain) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.'))
            }
            Matcher::Pattern(regex) => regex.is_match(host),
        }
    }
}

pub struct PlatformClassifier {
    rules: Vec<CompiledRule>,
    brand_suffixes: Vec<String>,
}

impl PlatformClassifier {
    pub fn new(config: &PlatformsConfig) -> Result<Self> {
        let rules = config
            .rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;

        let brand_suffixes = config
            .brand_suffixes
            .iter()
            .map(|s| s.trim().to_lowercase())
            .collect();

        Ok(Self {
            rules,
            brand_suffixes,
        })
    }

    /// Classify any string that looks like a url. Never fails; worst case is [`Platform::Other`].
    pub fn classify(&self, url: &str) -> Platform {
        match host_of(url) {
            Some(host) => self.classify_host(&host),
            None => Platform::Other,
        }
    }

    pub fn classify_url(&self, url: &Url) -> Platform {
        match normalized_host(url) {
            Some(host) => self.classify_host(&host),
            None => Platform::Other,
        }
    }

    fn classify_host(&self, host: &str) -> Platform {
        if let Some(rule) = self.rules.iter().find(|rule| rule.matches(host)) {
            return rule.platform.clone();
        }

        self.brand_from_host(host)
            .map(|brand| Platform::from_name(&brand))
            .unwrap_or(Platform::Other)
    }

    fn brand_from_host(&self, host: &str) -> Option<String> {
        let label = host
            .split('.')
            .filter(|label| !label.is_empty())
            .rev()
            .find(|label| !self.brand_suffixes.iter().any(|s| s == label))?;

        let mut chars = label.chars();
        let first = chars.next()?;
        if !first.is_alphanumeric() {
            return None;
        }

        Some(first.to_uppercase().chain(chars).collect())
    }
}

/// Lowercased hostname without a leading `www.`. Scheme-less input is read as https.
fn host_of(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{}", url.trim_start_matches('/'))).ok()?
        }
        Err(_) => return None,
    };

    normalized_host(&parsed)
}

fn normalized_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_lowercase();
            let domain = domain.strip_prefix("www.").unwrap_or(&domain).to_string();
            (!domain.is_empty()).then_some(domain)
        }
        // bare addresses carry no brand
        Host::Ipv4(_) | Host::Ipv6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> PlatformClassifier {
        PlatformClassifier::new(&PlatformsConfig::default()).unwrap()
    }

    #[test]
    fn test_known_platforms() {
        let c = classifier();
        let cases = [
            ("https://www.youtube.com/watch?v=abc123", Platform::YouTube),
            ("https://youtu.be/abc123", Platform::YouTube),
            ("https://m.youtube.com/shorts/abc", Platform::YouTube),
            ("https://www.instagram.com/p/xyz/", Platform::Instagram),
            ("https://www.tiktok.com/@user/video/1", Platform::TikTok),
            ("https://www.facebook.com/page/posts/1", Platform::Facebook),
            ("https://twitter.com/user/status/1", Platform::Twitter),
            ("https://x.com/user/status/1", Platform::Twitter),
            ("https://shopee.co.th/Some-Product-i.1.2", Platform::Shopee),
            ("https://shopee.vn/item", Platform::Shopee),
            ("https://www.lazada.co.th/products/x.html", Platform::Lazada),
            ("https://www.twitch.tv/somebody", Platform::Twitch),
        ];

        for (url, expected) in cases {
            assert_eq!(c.classify(url), expected, "{url}");
        }
    }

    #[test]
    fn test_case_and_www_insensitive() {
        let c = classifier();
        assert_eq!(c.classify("HTTPS://WWW.YOUTUBE.COM/watch?v=1"), Platform::YouTube);
        assert_eq!(c.classify("https://YouTube.com/watch?v=1"), Platform::YouTube);
        assert_eq!(c.classify("https://www.X.com/a"), Platform::Twitter);
    }

    #[test]
    fn test_domain_rule_does_not_match_lookalikes() {
        let c = classifier();
        // "box.com" ends with "x.com" but is not a subdomain of it
        assert_eq!(c.classify("https://box.com/files"), Platform::Named("Box".into()));
        assert_eq!(
            c.classify("https://notyoutube.com/watch"),
            Platform::Named("Notyoutube".into())
        );
    }

    #[test]
    fn test_brand_fallback_skips_public_suffixes() {
        let c = classifier();
        assert_eq!(
            c.classify("https://shop.example.co.th/item"),
            Platform::Named("Example".into())
        );
        assert_eq!(c.classify("https://blog.rust-lang.org/"), Platform::Named("Rust-lang".into()));
        assert_eq!(c.classify("https://vimeo.com/123"), Platform::Named("Vimeo".into()));
    }

    #[test]
    fn test_unknown_hosts_never_empty() {
        let c = classifier();
        for url in [
            "https://news.ycombinator.com/item?id=1",
            "http://localhost:8080/",
            "example.org/page",
            "https://a.b.c.d.e.io",
        ] {
            let platform = c.classify(url);
            assert!(!platform.as_str().is_empty(), "{url}");
        }
    }

    #[test]
    fn test_unparseable_falls_back_to_other() {
        let c = classifier();
        assert_eq!(c.classify(""), Platform::Other);
        assert_eq!(c.classify("http://"), Platform::Other);
        assert_eq!(c.classify("https://127.0.0.1/x"), Platform::Other);
        assert_eq!(c.classify("https://co.th/"), Platform::Other);
    }

    #[test]
    fn test_rule_order_is_precedence() {
        let config = PlatformsConfig {
            rules: vec![
                PlatformRule::regex("shop", "Marketplace"),
                PlatformRule::domain("shopee.co.th", "Shopee"),
            ],
            ..Default::default()
        };
        let c = PlatformClassifier::new(&config).unwrap();
        assert_eq!(
            c.classify("https://shopee.co.th/x"),
            Platform::Named("Marketplace".into())
        );
    }

    #[test]
    fn test_platform_serializes_as_string() {
        let json = serde_json::to_string(&Platform::TikTok).unwrap();
        assert_eq!(json, "\"TikTok\"");
        let back: Platform = serde_json::from_str("\"Pinterest\"").unwrap();
        assert_eq!(back, Platform::Named("Pinterest".into()));
        let known: Platform = serde_json::from_str("\"youtube\"").unwrap();
        assert_eq!(known, Platform::YouTube);
    }
}
