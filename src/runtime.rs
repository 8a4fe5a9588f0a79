//! Process-level entry points: run the worker fleet, seed the frontier,
//! reset all crawl state.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::artifact::{ArtifactGatherer, BlobArtifactGatherer, S3Storage};
use crate::config::{Config, FrontierVariant};
use crate::coordinator::{Coordinator, RedisCoordinator};
use crate::crawler::{Crawler, HttpCrawler};
use crate::frontier::{SqlUrlFrontier, UrlFrontier};
use crate::redis_frontier::RedisStreamUrlFrontier;
use crate::tracer::{CloudWatchSink, MetricsTracer, NullTracer, Tracer};
use crate::worker::{ComponentProvider, Worker};

/// Wires the production components.
pub struct BuiltinProvider;

#[async_trait]
impl ComponentProvider for BuiltinProvider {
    async fn coordinator(&self, config: &Config) -> anyhow::Result<Box<dyn Coordinator>> {
        Ok(Box::new(RedisCoordinator::connect(config).await?))
    }

    async fn frontier(
        &self,
        config: &Config,
        gwn: u16,
        tracer: Arc<dyn Tracer>,
    ) -> anyhow::Result<Box<dyn UrlFrontier>> {
        match config.url_frontier.variant {
            FrontierVariant::Sql => {
                Ok(Box::new(SqlUrlFrontier::connect(config, gwn, tracer).await?))
            }
            FrontierVariant::RedisStream => {
                Ok(Box::new(RedisStreamUrlFrontier::connect(config, gwn).await?))
            }
        }
    }

    async fn artifact_gatherer(
        &self,
        config: &Config,
    ) -> anyhow::Result<Box<dyn ArtifactGatherer>> {
        Ok(Box::new(BlobArtifactGatherer::new(
            Box::new(S3Storage::new(config)),
            config.artifact.key_prefix.clone(),
        )))
    }

    async fn crawler(
        &self,
        config: &Config,
        cancel: CancellationToken,
    ) -> anyhow::Result<Box<dyn Crawler>> {
        Ok(Box::new(HttpCrawler::new(config, cancel)?))
    }
}

fn build_tracer(config: &Config) -> anyhow::Result<Arc<dyn Tracer>> {
    if config.tracer_enabled() {
        let sink = Arc::new(CloudWatchSink::new(config));
        Ok(Arc::new(MetricsTracer::new(config, sink)?))
    } else {
        Ok(Arc::new(NullTracer))
    }
}

/// Cancel the token on SIGINT/SIGTERM/SIGQUIT.
#[cfg(unix)]
fn spawn_signal_listener(cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler");
        let mut terminate = signal(SignalKind::terminate()).expect("signal handler");
        let mut quit = signal(SignalKind::quit()).expect("signal handler");

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }

        info!("shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(not(unix))]
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            cancel.cancel();
        }
    });
}

/// Run this machine's share of the fleet until a signal or a fatal error.
pub async fn crawl(config: &Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let tracer = build_tracer(config)?;

    let mut workers = JoinSet::new();
    for _ in 0..config.workers {
        let config = config.clone();
        let tracer = Arc::clone(&tracer);
        let cancel = cancel.clone();
        workers.spawn(async move {
            Worker::start(&config, &BuiltinProvider, tracer, &cancel).await
        });
    }

    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = workers.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(anyhow::anyhow!("worker panicked: {}", e)));
        if let Err(e) = result {
            // One broken worker takes the whole process down; the rest shut
            // down cleanly first.
            cancel.cancel();
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }

    tracer.finish().await;

    match first_error {
        Some(e) => Err(e).context("failed to crawl"),
        None => Ok(()),
    }
}

/// Push initial URLs into the frontier as the synthetic worker 1.
pub async fn seeding(config: &Config, urls: Vec<String>) -> anyhow::Result<()> {
    let mut frontier = BuiltinProvider
        .frontier(config, 1, Arc::new(NullTracer))
        .await?;
    frontier.seeding(urls).await?;
    frontier.finish().await
}

/// Wipe the frontier and the coordination KV. Gathered artifacts survive.
pub async fn reset(config: &Config) -> anyhow::Result<()> {
    let mut coordinator = RedisCoordinator::connect(config).await?;
    coordinator.reset().await?;

    let mut frontier = BuiltinProvider
        .frontier(config, 1, Arc::new(NullTracer))
        .await?;
    frontier.reset().await
}
