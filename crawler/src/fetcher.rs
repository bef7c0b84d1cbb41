use crate::error::CrawlError;
use async_trait::async_trait;
use log::trace;
use reqwest::header::{CONTENT_TYPE, REFERER};
use reqwest::Client;
use std::time::Duration;

/// What the crawler needs from an HTTP response
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn ok(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            ..Self::default()
        }
    }

    /// Whether the body is a stylesheet to run through the CSS rewriter
    pub fn is_css(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map_or(false, |mime| mime.trim().eq_ignore_ascii_case("text/css"))
    }
}

/// GET transport behind the worker pool
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `url`, sending `refer` as the Referer header when non-empty.
    /// Transport failures map to [`CrawlError::Transport`]; HTTP status codes
    /// are returned as-is.
    async fn get(&self, url: &str, refer: &str) -> Result<FetchResponse, CrawlError>;
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, CrawlError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str, refer: &str) -> Result<FetchResponse, CrawlError> {
        let mut request = self.client.get(url);
        if !refer.is_empty() {
            request = request.header(REFERER, refer);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CrawlError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| CrawlError::Transport(e.to_string()))?
            .to_vec();

        trace!("GET {} -> {} ({} bytes)", url, status, body.len());
        Ok(FetchResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn css_detection_ignores_parameters_and_case() {
        assert!(FetchResponse::ok("text/css; charset=utf-8", "").is_css());
        assert!(FetchResponse::ok("TEXT/CSS", "").is_css());
        assert!(!FetchResponse::ok("text/html", "").is_css());
        assert!(!FetchResponse::not_found().is_css());
    }

    #[tokio::test]
    async fn mock_fetcher_stands_in_for_http() {
        let mut fetcher = MockFetcher::new();
        fetcher
            .expect_get()
            .withf(|url, refer| url == "http://x.test/a.css" && refer == "http://x.test/")
            .returning(|_, _| Ok(FetchResponse::ok("text/css", "body{}")));

        let response = fetcher.get("http://x.test/a.css", "http://x.test/").await.unwrap();
        assert_eq!(response.status, 200);
        assert!(response.is_css());
    }
}
