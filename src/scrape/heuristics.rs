//! Platform specific thumbnail guesses.
//!
//! These depend on CDN naming conventions of the platforms and will break when
//! the markup changes. Each one sits behind [`ThumbnailHeuristic`] so it can be
//! updated or dropped without touching the rest of the scraper.

use crate::metadata::platform::Platform;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};

static IMG_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img[src]").expect("img selector"));

pub trait ThumbnailHeuristic: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, platform: &Platform) -> bool;

    /// Raw `src` of the guessed thumbnail, not yet resolved or filtered.
    fn thumbnail(&self, document: &Html) -> Option<String>;
}

/// First `<img>` served from a platform CDN, skipping known avatar/icon sizes.
pub struct CdnImage {
    name: &'static str,
    platform: Platform,
    cdn_marker: &'static str,
    excluded: &'static [&'static str],
}

impl CdnImage {
    pub fn facebook() -> Self {
        Self {
            name: "facebook-scontent",
            platform: Platform::Facebook,
            cdn_marker: "scontent",
            excluded: &["p50x50", "p40x40"],
        }
    }

    pub fn instagram() -> Self {
        Self {
            name: "instagram-cdn",
            platform: Platform::Instagram,
            cdn_marker: "cdninstagram",
            excluded: &["150x150", "44x44"],
        }
    }
}

impl ThumbnailHeuristic for CdnImage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn applies_to(&self, platform: &Platform) -> bool {
        *platform == self.platform
    }

    fn thumbnail(&self, document: &Html) -> Option<String> {
        document
            .select(&IMG_SELECTOR)
            .filter_map(|img| img.attr("src"))
            .find(|src| {
                src.contains(self.cdn_marker)
                    && !self.excluded.iter().any(|size| src.contains(size))
            })
            .map(str::to_string)
    }
}

pub fn default_heuristics() -> Vec<Box<dyn ThumbnailHeuristic>> {
    vec![Box::new(CdnImage::facebook()), Box::new(CdnImage::instagram())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScrapeConfig;
    use crate::scrape::Scraper;

    const FACEBOOK_PAGE: &str = r#"<html><body>
        <img src="https://scontent.xx.fbcdn.net/v/p50x50/avatar.jpg">
        <img src="https://static.xx.fbcdn.net/rsrc.php/logo.png" width="400" height="400">
        <img src="https://scontent.xx.fbcdn.net/v/t39/photo.jpg">
    </body></html>"#;

    #[test]
    fn test_facebook_skips_avatar_sizes() {
        let doc = Html::parse_document(FACEBOOK_PAGE);
        assert_eq!(
            CdnImage::facebook().thumbnail(&doc).as_deref(),
            Some("https://scontent.xx.fbcdn.net/v/t39/photo.jpg")
        );
    }

    #[test]
    fn test_instagram_skips_profile_sizes() {
        let doc = Html::parse_document(
            r#"<img src="https://scontent.cdninstagram.com/s150x150/me.jpg">
               <img src="https://scontent.cdninstagram.com/e35/post.jpg">"#,
        );
        assert_eq!(
            CdnImage::instagram().thumbnail(&doc).as_deref(),
            Some("https://scontent.cdninstagram.com/e35/post.jpg")
        );
    }

    #[test]
    fn test_heuristic_only_for_its_platform() {
        let scraper = Scraper::new(&ScrapeConfig::default());
        let url = "https://www.facebook.com/somepage/posts/1";

        let page = scraper.scrape_as(FACEBOOK_PAGE, url, &Platform::Facebook);
        assert_eq!(page.thumbnail, "https://scontent.xx.fbcdn.net/v/t39/photo.jpg");

        // without the platform hint the largest sized image wins
        let page = scraper.scrape(FACEBOOK_PAGE, url);
        assert_eq!(page.thumbnail, "https://static.xx.fbcdn.net/rsrc.php/logo.png");
    }

    #[test]
    fn test_disabled_heuristics() {
        let scraper = Scraper::new(&ScrapeConfig::default()).with_heuristics(Vec::new());
        let page = scraper.scrape_as(FACEBOOK_PAGE, "https://facebook.com/x", &Platform::Facebook);
        assert_eq!(page.thumbnail, "https://static.xx.fbcdn.net/rsrc.php/logo.png");
    }
}
