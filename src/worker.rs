//! The per-process worker: one coordinator, one frontier, one crawler and
//! one artifact gatherer, wired into a supervised pipeline.
//!
//! Four tasks (pop, push, artifact, crawl) communicate over bounded
//! channels and report their terminal status exactly once. The supervisor
//! cancels everything on the first error, drains all four results, then
//! finishes the components in a fixed order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactGatherer};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::crawler::Crawler;
use crate::frontier::{SpawnedUrl, UrlFrontier};
use crate::output_pipeline::OutputPipeline;
use crate::sanitized_url::SanitizedUrl;
use crate::tracer::Tracer;

/// Pop + push + artifact + crawl.
const EXPECTED_RESULTS: usize = 4;

const POP_CHANNEL_CAPACITY: usize = 5;
const PUSH_CHANNEL_CAPACITY: usize = 10;
const ARTIFACT_CHANNEL_CAPACITY: usize = 5;

/// Sleep between polls of an empty shard.
const EMPTY_POP_BACKOFF: Duration = Duration::from_millis(100);

/// Builds the worker's components. The built-in provider wires the real
/// stores; tests substitute mocks.
#[async_trait]
pub trait ComponentProvider: Send + Sync {
    async fn coordinator(&self, config: &Config) -> anyhow::Result<Box<dyn Coordinator>>;

    async fn frontier(
        &self,
        config: &Config,
        gwn: u16,
        tracer: Arc<dyn Tracer>,
    ) -> anyhow::Result<Box<dyn UrlFrontier>>;

    async fn artifact_gatherer(&self, config: &Config)
        -> anyhow::Result<Box<dyn ArtifactGatherer>>;

    async fn crawler(
        &self,
        config: &Config,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn Crawler>>;
}

pub struct Worker;

impl Worker {
    /// Run one worker until cancellation or a fatal sub-system error. The
    /// returned error is the first fatal one; teardown errors are logged
    /// but never override it.
    pub async fn start(
        config: &Config,
        provider: &dyn ComponentProvider,
        tracer: Arc<dyn Tracer>,
        parent_cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut coordinator = provider
            .coordinator(config)
            .await
            .context("failed to initialize coordinator")?;

        let gwn = coordinator
            .alloc_next_gwn()
            .await
            .context("failed to allocate global worker number")?;

        let span = info_span!("worker", gwn);
        Self::run(config, provider, coordinator, gwn, tracer, parent_cancel)
            .instrument(span)
            .await
    }

    async fn run(
        config: &Config,
        provider: &dyn ComponentProvider,
        coordinator: Box<dyn Coordinator>,
        gwn: u16,
        tracer: Arc<dyn Tracer>,
        parent_cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        info!("worker is started");

        let cancel = parent_cancel.child_token();

        let frontier = provider
            .frontier(config, gwn, Arc::clone(&tracer))
            .await
            .context("failed to initialize url frontier")?;
        let gatherer = provider
            .artifact_gatherer(config)
            .await
            .context("failed to initialize artifact gatherer")?;
        let crawler = provider
            .crawler(config, cancel.clone())
            .await
            .context("failed to initialize crawler")?;

        let coordinator = Arc::new(Mutex::new(coordinator));
        let frontier = Arc::new(Mutex::new(frontier));
        let gatherer = Arc::new(Mutex::new(gatherer));
        let crawler = Arc::new(Mutex::new(crawler));

        let (pop_tx, pop_rx) = mpsc::channel::<SanitizedUrl>(POP_CHANNEL_CAPACITY);
        let (push_tx, push_rx) = mpsc::channel::<SpawnedUrl>(PUSH_CHANNEL_CAPACITY);
        let (artifact_tx, artifact_rx) = mpsc::channel::<Artifact>(ARTIFACT_CHANNEL_CAPACITY);
        let (result_tx, mut result_rx) =
            mpsc::channel::<anyhow::Result<()>>(EXPECTED_RESULTS);

        let out = OutputPipeline::new(artifact_tx, push_tx, cancel.clone());

        {
            let frontier = Arc::clone(&frontier);
            let coordinator = Arc::clone(&coordinator);
            let tracer = Arc::clone(&tracer);
            let cancel = cancel.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(
                async move {
                    let result =
                        pop_loop(frontier, coordinator, tracer, pop_tx, cancel).await;
                    let _ = result_tx.send(result).await;
                }
                .instrument(info_span!("task", subsys = "url-frontier")),
            );
        }

        {
            let frontier = Arc::clone(&frontier);
            let cancel = cancel.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(
                async move {
                    let result = push_loop(frontier, push_rx, cancel).await;
                    let _ = result_tx.send(result).await;
                }
                .instrument(info_span!("task", subsys = "url-frontier")),
            );
        }

        {
            let gatherer = Arc::clone(&gatherer);
            let cancel = cancel.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(
                async move {
                    let result = artifact_loop(gatherer, artifact_rx, cancel).await;
                    let _ = result_tx.send(result).await;
                }
                .instrument(info_span!("task", subsys = "artifact-gatherer")),
            );
        }

        {
            let crawler = Arc::clone(&crawler);
            let tracer = Arc::clone(&tracer);
            let cancel = cancel.clone();
            tokio::spawn(
                async move {
                    let result = crawl_loop(crawler, tracer, pop_rx, out, cancel).await;
                    let _ = result_tx.send(result).await;
                }
                .instrument(info_span!("task", subsys = "crawler")),
            );
        }

        // Supervisor: first error cancels the rest; every task still gets to
        // report before teardown starts.
        let mut first_error: Option<anyhow::Error> = None;
        for _ in 0..EXPECTED_RESULTS {
            match result_rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    error!("sub-system returned error: {:#}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    cancel.cancel();
                }
                None => break,
            }
        }

        if let Err(e) = crawler.lock().await.finish().await {
            error!("failed to finish crawler: {:#}", e);
        }
        if let Err(e) = frontier.lock().await.finish().await {
            error!("failed to finish url frontier: {:#}", e);
        }
        if let Err(e) = gatherer.lock().await.finish().await {
            error!("failed to finish artifact gatherer: {:#}", e);
        }
        if let Err(e) = coordinator.lock().await.finish().await {
            error!("failed to finish coordinator: {:#}", e);
        }

        info!("worker is finished");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Pop URLs from the frontier, acquire the IP politeness lock and hand them
/// to the crawl task. Lock-refused URLs are dropped on purpose; reachable
/// hosts will be re-spawned by other pages.
async fn pop_loop(
    frontier: Arc<Mutex<Box<dyn UrlFrontier>>>,
    coordinator: Arc<Mutex<Box<dyn Coordinator>>>,
    tracer: Arc<dyn Tracer>,
    pop_tx: mpsc::Sender<SanitizedUrl>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let popped = frontier.lock().await.pop().await?;

        let url = match popped {
            Some(url) => url,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(EMPTY_POP_BACKOFF) => continue,
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        };

        let locked = coordinator
            .lock()
            .await
            .lock_by_ip_addr_of(&url.host())
            .await?;
        if !locked {
            tracer.trace_lock_discarded();
            continue;
        }

        tokio::select! {
            sent = pop_tx.send(url) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn push_loop(
    frontier: Arc<Mutex<Box<dyn UrlFrontier>>>,
    mut push_rx: mpsc::Receiver<SpawnedUrl>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            spawned = push_rx.recv() => match spawned {
                Some(spawned) => frontier.lock().await.push(spawned).await?,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn artifact_loop(
    gatherer: Arc<Mutex<Box<dyn ArtifactGatherer>>>,
    mut artifact_rx: mpsc::Receiver<Artifact>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            artifact = artifact_rx.recv() => match artifact {
                Some(artifact) => gatherer.lock().await.collect(artifact).await?,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

async fn crawl_loop(
    crawler: Arc<Mutex<Box<dyn Crawler>>>,
    tracer: Arc<dyn Tracer>,
    mut pop_rx: mpsc::Receiver<SanitizedUrl>,
    out: OutputPipeline,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            url = pop_rx.recv() => match url {
                Some(url) => {
                    let span = info_span!("crawl", id = %Uuid::new_v4());
                    crawler
                        .lock()
                        .await
                        .crawl(&url, &out)
                        .instrument(span)
                        .await?;
                    tracer.trace_crawled();
                }
                None => return Ok(()),
            },
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::NullTracer;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;

    // An in-memory fleet of one: the frontier is a plain queue, the
    // coordinator refuses locks for .org hosts and the crawler derives the
    // next URLs from the host name.

    struct MockCoordinator;

    #[async_trait]
    impl Coordinator for MockCoordinator {
        async fn alloc_next_gwn(&mut self) -> anyhow::Result<u16> {
            Ok(1)
        }

        async fn lock_by_ip_addr_of(&mut self, host: &str) -> anyhow::Result<bool> {
            Ok(!host.ends_with(".org"))
        }

        async fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn reset(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct MockFrontier {
        queue: Arc<SyncMutex<VecDeque<SanitizedUrl>>>,
    }

    #[async_trait]
    impl UrlFrontier for MockFrontier {
        async fn seeding(&mut self, _urls: Vec<String>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn push(&mut self, spawned: SpawnedUrl) -> anyhow::Result<()> {
            self.queue.lock().extend(spawned.spawned);
            Ok(())
        }

        async fn pop(&mut self) -> anyhow::Result<Option<SanitizedUrl>> {
            Ok(self.queue.lock().pop_front())
        }

        async fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn reset(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct MockGatherer {
        collected: Arc<SyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ArtifactGatherer for MockGatherer {
        async fn collect(&mut self, artifact: Artifact) -> anyhow::Result<()> {
            self.collected.lock().push(artifact.url);
            Ok(())
        }

        async fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct MockCrawler;

    #[async_trait]
    impl Crawler for MockCrawler {
        async fn crawl(&mut self, url: &SanitizedUrl, out: &OutputPipeline) -> anyhow::Result<()> {
            let number: u32 = url
                .host()
                .split('.')
                .next()
                .unwrap()
                .parse()
                .expect("mock hosts are numbered");

            out.output_artifact(Artifact {
                host: url.host(),
                url: url.as_str().to_string(),
                status: 200,
                title: String::new(),
                server: String::new(),
                elapsed: 0.01,
            })
            .await;

            if number >= 5 {
                return Ok(());
            }

            let next = vec![
                SanitizedUrl::parse(&format!("http://{}.com", number + 1)).unwrap(),
                SanitizedUrl::parse(&format!("http://{}.org", number + 1)).unwrap(),
            ];
            out.output_spawned(SpawnedUrl {
                from: url.clone(),
                elapsed: 0.01,
                spawned: next,
            })
            .await;

            Ok(())
        }

        async fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct MockProvider {
        queue: Arc<SyncMutex<VecDeque<SanitizedUrl>>>,
        collected: Arc<SyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl ComponentProvider for MockProvider {
        async fn coordinator(&self, _config: &Config) -> anyhow::Result<Box<dyn Coordinator>> {
            Ok(Box::new(MockCoordinator))
        }

        async fn frontier(
            &self,
            _config: &Config,
            _gwn: u16,
            _tracer: Arc<dyn Tracer>,
        ) -> anyhow::Result<Box<dyn UrlFrontier>> {
            Ok(Box::new(MockFrontier {
                queue: Arc::clone(&self.queue),
            }))
        }

        async fn artifact_gatherer(
            &self,
            _config: &Config,
        ) -> anyhow::Result<Box<dyn ArtifactGatherer>> {
            Ok(Box::new(MockGatherer {
                collected: Arc::clone(&self.collected),
            }))
        }

        async fn crawler(
            &self,
            _config: &Config,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Box<dyn Crawler>> {
            Ok(Box::new(MockCrawler))
        }
    }

    fn test_config() -> Config {
        serde_json::from_str(
            r#"{
                "workers": 1,
                "machines": 1,
                "aws": {"region": "r", "access_key_id": "dummy", "secret_access_key": "dummy"},
                "artifact": {"bucket": "b", "key_prefix": "p"},
                "coordinator": {"redis_url": "redis://127.0.0.1"},
                "crawling": {"header_ua": "ua", "primary_ua": "p", "secondary_ua": "s"},
                "url_frontier": {"shared_db_source": "mysql://unset"}
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn worker_crawls_reachable_hosts_in_order() {
        let queue = Arc::new(SyncMutex::new(VecDeque::from([SanitizedUrl::parse(
            "http://1.com",
        )
        .unwrap()])));
        let collected = Arc::new(SyncMutex::new(Vec::new()));

        let provider = MockProvider {
            queue,
            collected: Arc::clone(&collected),
        };

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            stopper.cancel();
        });

        let config = test_config();
        Worker::start(&config, &provider, Arc::new(NullTracer), &cancel)
            .await
            .unwrap();

        // The .org spawn of every page fails the IP lock and is discarded.
        let artifacts = collected.lock().clone();
        assert_eq!(
            artifacts,
            vec![
                "http://1.com/",
                "http://2.com/",
                "http://3.com/",
                "http://4.com/",
                "http://5.com/",
            ]
        );
    }

    struct FailingFrontier;

    #[async_trait]
    impl UrlFrontier for FailingFrontier {
        async fn seeding(&mut self, _urls: Vec<String>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn push(&mut self, _spawned: SpawnedUrl) -> anyhow::Result<()> {
            Ok(())
        }

        async fn pop(&mut self) -> anyhow::Result<Option<SanitizedUrl>> {
            anyhow::bail!("shared store is gone")
        }

        async fn finish(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn reset(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ComponentProvider for FailingProvider {
        async fn coordinator(&self, _config: &Config) -> anyhow::Result<Box<dyn Coordinator>> {
            Ok(Box::new(MockCoordinator))
        }

        async fn frontier(
            &self,
            _config: &Config,
            _gwn: u16,
            _tracer: Arc<dyn Tracer>,
        ) -> anyhow::Result<Box<dyn UrlFrontier>> {
            Ok(Box::new(FailingFrontier))
        }

        async fn artifact_gatherer(
            &self,
            _config: &Config,
        ) -> anyhow::Result<Box<dyn ArtifactGatherer>> {
            Ok(Box::new(MockGatherer {
                collected: Arc::new(SyncMutex::new(Vec::new())),
            }))
        }

        async fn crawler(
            &self,
            _config: &Config,
            _cancel: CancellationToken,
        ) -> anyhow::Result<Box<dyn Crawler>> {
            Ok(Box::new(MockCrawler))
        }
    }

    #[tokio::test]
    async fn store_error_cancels_the_worker_and_surfaces() {
        let config = test_config();
        let cancel = CancellationToken::new();

        let result = Worker::start(&config, &FailingProvider, Arc::new(NullTracer), &cancel).await;

        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("shared store is gone"));
    }
}
