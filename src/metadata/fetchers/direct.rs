use crate::metadata::fetchers::{Strategy, Target};
use crate::metadata::types::FetchOutcome;
use crate::scrape::{http::HttpClient, looks_blocked, Scraper};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

/// Plain GET of the target page, scraped as is.
pub struct DirectStage {
    http: Arc<HttpClient>,
    scraper: Arc<Scraper>,
    timeout: Duration,
}

impl DirectStage {
    pub fn new(http: Arc<HttpClient>, scraper: Arc<Scraper>, timeout: Duration) -> Self {
        Self {
            http,
            scraper,
            timeout,
        }
    }
}

#[async_trait]
impl Strategy for DirectStage {
    async fn fetch(&self, target: &Target) -> anyhow::Result<FetchOutcome> {
        let url = target.url.as_str();
        let html = self.http.get_text(url).await?;
        log::debug!("plain request successful");

        if looks_blocked(&html) {
            return Ok(FetchOutcome::Skip("blocked by anti-bot page".into()));
        }

        let raw = self.scraper.scrape_as(&html, url, &target.platform).into_raw();
        if raw.has_any_data() {
            Ok(FetchOutcome::Data(raw))
        } else {
            Ok(FetchOutcome::Skip("page has no metadata".into()))
        }
    }

    fn name(&self) -> &'static str {
        "direct"
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FetchConfig, ScrapeConfig};
    use crate::metadata::platform::Platform;
    use crate::tests::serve;
    use axum::{http::StatusCode, response::Html, routing::get, Router};
    use url::Url;

    fn stage() -> DirectStage {
        DirectStage::new(
            Arc::new(HttpClient::new(&FetchConfig::default()).unwrap()),
            Arc::new(Scraper::new(&ScrapeConfig::default())),
            Duration::from_secs(5),
        )
    }

    fn target(url: String) -> Target {
        Target {
            url: Url::parse(&url).unwrap(),
            platform: Platform::Other,
        }
    }

    #[tokio::test]
    async fn test_scrapes_page() {
        let app = Router::new().route(
            "/article",
            get(|| async {
                Html(
                    r#"<html><head>
                    <meta property="og:title" content="An Article">
                    <meta property="og:description" content="About things">
                    <meta property="og:image" content="/cover.jpg">
                    </head></html>"#,
                )
            }),
        );
        let addr = serve(app).await;

        let outcome = stage().fetch(&target(format!("http://{addr}/article"))).await.unwrap();
        let FetchOutcome::Data(raw) = outcome else {
            panic!("expected data");
        };
        assert_eq!(raw.title.as_deref(), Some("An Article"));
        assert_eq!(raw.description.as_deref(), Some("About things"));
        assert_eq!(raw.thumbnail, Some(format!("http://{addr}/cover.jpg")));
    }

    #[tokio::test]
    async fn test_blocked_page_skips() {
        let app = Router::new().route(
            "/",
            get(|| async { Html("<html><head><title>Just a moment...</title></head></html>") }),
        );
        let addr = serve(app).await;

        let outcome = stage().fetch(&target(format!("http://{addr}/"))).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Skip(_)));
    }

    #[tokio::test]
    async fn test_http_error_fails() {
        let app = Router::new().route("/", get(|| async { StatusCode::NOT_FOUND }));
        let addr = serve(app).await;

        assert!(stage().fetch(&target(format!("http://{addr}/"))).await.is_err());
    }
}
