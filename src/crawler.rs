//! The crawl of a single URL: robots.txt check, fetch with redirect
//! policies, HTML extraction and result emission.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION, SERVER};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::artifact::Artifact;
use crate::config::Config;
use crate::frontier::SpawnedUrl;
use crate::output_pipeline::OutputPipeline;
use crate::page::Page;
use crate::robots::RobotsTxt;
use crate::sanitized_url::SanitizedUrl;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Short on purpose; only needs to bridge the robots.txt fetch and the page
/// fetch of the same host.
const IDLE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_REDIRECT_HOPS: u32 = 3;

/// Fetches one URL and reports through the output pipeline.
#[async_trait]
pub trait Crawler: Send {
    async fn crawl(&mut self, url: &SanitizedUrl, out: &OutputPipeline) -> anyhow::Result<()>;
    async fn finish(&mut self) -> anyhow::Result<()>;
}

/// Which hosts a redirect chain may wander to.
#[derive(Debug, Clone, Copy)]
enum RedirectScope {
    /// robots.txt fetches stay under the original host: each hop's host must
    /// keep the original host as a suffix.
    WithinOriginalDomain,
    /// Page fetches may only bounce within one host: each hop's host must
    /// equal the prior hop's.
    SameHost,
}

/// Response surfaced by a fetch: headers always, body only when reading it
/// succeeded.
struct FetchedResponse {
    status: u16,
    server: String,
    content_type: Option<String>,
    body: Option<Vec<u8>>,
}

impl FetchedResponse {
    fn succeeded(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the body is worth handing to the HTML extractor.
    fn parsable_text(&self) -> bool {
        if !self.succeeded() {
            return false;
        }

        match &self.content_type {
            None => true,
            Some(ct) => {
                let ct = ct.to_lowercase();
                ct.contains("text") || ct.contains("html") || ct.contains("xml")
            }
        }
    }
}

pub struct HttpCrawler {
    primary_ua: String,
    secondary_ua: String,
    default_robots: RobotsTxt,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl HttpCrawler {
    pub fn new(config: &Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        let crawling = &config.crawling;

        let client = reqwest::Client::builder()
            .user_agent(crawling.header_ua.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(2)
            .gzip(true)
            // Accept ancient TLS stacks to maximize coverage.
            .min_tls_version(reqwest::tls::Version::TLS_1_0)
            .danger_accept_invalid_certs(true)
            // Redirects are followed manually so each policy can inspect the
            // chain.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            primary_ua: crawling.primary_ua.clone(),
            secondary_ua: crawling.secondary_ua.clone(),
            default_robots: RobotsTxt::permissive(&crawling.primary_ua, &crawling.secondary_ua),
            client,
            cancel,
        })
    }

    /// GET with manual redirect following. At most [`MAX_REDIRECT_HOPS`]
    /// hops are taken and a chain leaving the scope stops early; in both
    /// cases the last response is surfaced instead of an error.
    async fn request_to_get(
        &self,
        url: &SanitizedUrl,
        scope: RedirectScope,
    ) -> Result<FetchedResponse, reqwest::Error> {
        let mut current = url.clone();
        let mut hops = 0;

        loop {
            let response = self.client.get(current.as_str()).send().await?;

            if !response.status().is_redirection() || hops >= MAX_REDIRECT_HOPS {
                return Ok(Self::read_response(response).await);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);

            let next = match location.and_then(|l| current.join(&l).ok()) {
                Some(next) => next,
                None => return Ok(Self::read_response(response).await),
            };

            let within_scope = match scope {
                RedirectScope::WithinOriginalDomain => next.host().ends_with(&url.host()),
                RedirectScope::SameHost => next.host() == current.host(),
            };
            if !within_scope {
                return Ok(Self::read_response(response).await);
            }

            debug!("redirecting: {}", next);
            current = next;
            hops += 1;
        }
    }

    /// Drain a response into owned parts. A failed body read still yields
    /// the header-derived parts.
    async fn read_response(response: reqwest::Response) -> FetchedResponse {
        let status = response.status().as_u16();
        let server = response
            .headers()
            .get(SERVER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .unwrap_or_default();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let body = match response.bytes().await {
            Ok(bytes) => Some(bytes.to_vec()),
            Err(e) => {
                debug!("failed to read response body: {}", e);
                None
            }
        };

        FetchedResponse {
            status,
            server,
            content_type,
            body,
        }
    }

    /// Fetch and parse the robots.txt effective for `url`. Never fails: any
    /// network error, non-2xx response or non-textual body yields the
    /// permissive default.
    async fn request_robots_txt_of(&self, url: &SanitizedUrl) -> RobotsTxt {
        let response = match self
            .request_to_get(&url.robots_txt_url(), RedirectScope::WithinOriginalDomain)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if !self.cancel.is_cancelled() {
                    warn!("failed to get robots.txt: {}", e);
                }
                return self.default_robots.clone();
            }
        };

        if !response.parsable_text() {
            return self.default_robots.clone();
        }

        match &response.body {
            Some(body) => RobotsTxt::parse(
                &String::from_utf8_lossy(body),
                &self.primary_ua,
                &self.secondary_ua,
            ),
            None => self.default_robots.clone(),
        }
    }
}

#[async_trait]
impl Crawler for HttpCrawler {
    async fn crawl(&mut self, url: &SanitizedUrl, out: &OutputPipeline) -> anyhow::Result<()> {
        let robots = self.request_robots_txt_of(url).await;
        if !robots.allows(url.path()) {
            debug!("crawling disallowed by robots.txt: {}", url);
            return Ok(());
        }

        let started = Instant::now();
        let response = match self.request_to_get(url, RedirectScope::SameHost).await {
            Ok(response) => response,
            Err(e) => {
                // Cancellation tears down mid-flight requests; that is not
                // worth a warning.
                if !self.cancel.is_cancelled() {
                    warn!("failed to crawl: {}", e);
                }
                return Ok(());
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        let mut artifact = Some(Artifact {
            host: url.host(),
            url: url.as_str().to_string(),
            status: response.status,
            title: String::new(),
            server: response.server.clone(),
            elapsed,
        });
        let mut spawned = None;

        if response.parsable_text() {
            if let Some(body) = response.body.as_deref() {
                // Charset note: the extractor runs on raw bytes; ASCII-compatible
                // encodings tokenize correctly and anything else degrades to a
                // missing title rather than a failed crawl.
                match Page::parse(url, body) {
                    Ok(page) => {
                        if page.no_index() {
                            artifact = None;
                        } else if let Some(artifact) = artifact.as_mut() {
                            artifact.title = page.title().to_string();
                        }

                        spawned = Some(SpawnedUrl {
                            from: url.clone(),
                            elapsed,
                            spawned: page.all_urls().to_vec(),
                        });
                    }
                    Err(e) => debug!("failed to parse page: {}", e),
                }
            }
        }

        if let Some(artifact) = artifact {
            out.output_artifact(artifact).await;
        }
        if let Some(spawned) = spawned {
            out.output_spawned(spawned).await;
        }

        debug!("finished: {}", url);
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
