//! reqwest-backed [`RemoteSession`] against the dhlottery search page.
//!
//! The real page is form-driven: picking a product line or round updates a
//! shared search form and the server re-renders the store listing. This
//! adapter keeps a cookie-backed client per session, tracks the pending
//! selection locally, and replays it as query parameters on every refresh,
//! polling until the listing container shows up or the bounded wait elapses.

use crate::record::Category;
use crate::session::{RemoteSession, SessionError, SessionFactory};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use reqwest::redirect::Policy;
use reqwest::Client;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use url::Url;

const SEARCH_URL: &str = "https://www.dhlottery.co.kr/wnprchsplcsrch/home";
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Marker the rendered listing carries once stores are present.
const LISTING_MARKER: &str = "store-box";
/// Selector reported when the listing never populates.
const LISTING_SELECTOR: &str = ".store-box";

/// Builds cookie-backed HTTP sessions against the live search page.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    base: Url,
    request_timeout: Duration,
    listing_timeout: Duration,
    listing_poll: Duration,
}

impl HttpSessionFactory {
    /// Factory against the production search page with the given waits.
    pub fn new(listing_timeout: Duration, listing_poll: Duration) -> Self {
        let base = Url::parse(SEARCH_URL).expect("static search url");
        Self {
            base,
            request_timeout: Duration::from_secs(30),
            listing_timeout,
            listing_poll,
        }
    }

    /// Overrides the page URL; used to point sessions at a local fixture
    /// server.
    pub fn with_base(mut self, base: Url) -> Self {
        self.base = base;
        self
    }

    fn build_client(&self) -> Result<Client, SessionError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .cookie_store(true)
            .redirect(Policy::limited(5))
            .timeout(self.request_timeout)
            .build()
            .map_err(|err| SessionError::Connect(format!("client construction failed: {err}")))
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn create(&self) -> Result<Box<dyn RemoteSession>, SessionError> {
        let client = self.build_client()?;

        // The initial page load establishes the server-side session cookie;
        // without it the search endpoint serves an empty shell.
        let response = client
            .get(self.base.clone())
            .send()
            .await
            .map_err(|err| SessionError::Connect(format!("initial page load failed: {err}")))?;
        if !response.status().is_success() {
            return Err(SessionError::Connect(format!(
                "initial page load returned {}",
                response.status()
            )));
        }
        let document = response
            .text()
            .await
            .map_err(|err| SessionError::Connect(format!("initial page body unreadable: {err}")))?;

        Ok(Box::new(HttpSession {
            client,
            base: self.base.clone(),
            category: None,
            unit: None,
            document,
            listing_timeout: self.listing_timeout,
            listing_poll: self.listing_poll,
            closed: false,
        }))
    }
}

/// One cookie-backed view of the search page.
pub struct HttpSession {
    client: Client,
    base: Url,
    category: Option<Category>,
    unit: Option<u32>,
    document: String,
    listing_timeout: Duration,
    listing_poll: Duration,
    closed: bool,
}

impl HttpSession {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Protocol("session already closed".into()));
        }
        Ok(())
    }

    fn search_url(&self) -> Result<Url, SessionError> {
        let category = self
            .category
            .ok_or_else(|| SessionError::Protocol("no category selected".into()))?;
        let mut url = self.base.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("ltGds", category.code());
            if let Some(unit) = self.unit {
                pairs.append_pair("srchLtEpsd", &unit.to_string());
            }
        }
        Ok(url)
    }

    async fn load(&mut self, url: Url) -> Result<(), SessionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(SessionError::Http)?;
        if !response.status().is_success() {
            return Err(SessionError::Protocol(format!(
                "search page returned {}",
                response.status()
            )));
        }
        self.document = response.text().await.map_err(SessionError::Http)?;
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for HttpSession {
    async fn select_category(&mut self, category: Category) -> Result<(), SessionError> {
        self.ensure_open()?;
        // Switching product lines resets the round selection on the page.
        if self.category != Some(category) {
            self.unit = None;
        }
        self.category = Some(category);
        let url = self.search_url()?;
        self.load(url).await
    }

    async fn select_unit(&mut self, unit: u32) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.category.is_none() {
            return Err(SessionError::Protocol(
                "unit selected before category".into(),
            ));
        }
        self.unit = Some(unit);
        Ok(())
    }

    async fn refresh_listing(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        if self.unit.is_none() {
            return Err(SessionError::Protocol("no unit selected".into()));
        }
        let url = self.search_url()?;
        let started = Instant::now();
        loop {
            self.load(url.clone()).await?;
            if self.document.contains(LISTING_MARKER) {
                return Ok(());
            }
            if started.elapsed() >= self.listing_timeout {
                return Err(SessionError::ElementWait {
                    selector: LISTING_SELECTOR,
                    waited: started.elapsed(),
                });
            }
            sleep(self.listing_poll).await;
        }
    }

    async fn fetch_document(&mut self) -> Result<String, SessionError> {
        self.ensure_open()?;
        Ok(self.document.clone())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        // Idempotent: the server session simply expires; dropping the client
        // releases the connection pool.
        self.closed = true;
        Ok(())
    }
}
