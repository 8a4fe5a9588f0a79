//! Alternative frontier backed by Redis lists instead of a shared SQL table.
//!
//! Discovered URLs are RPUSHed onto one list per shard (`url_stream_<gwn>`);
//! a background subscriber BLPOPs the worker's own stream and admits URLs
//! into a per-worker SQLite store that also does the per-host rate shaping:
//! a host becomes crawlable again 120 s after each pop and is parked
//! indefinitely once its URL budget is spent.

use anyhow::Context;
use chrono::Utc;
use redis::aio::ConnectionManager;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::Config;
use crate::frontier::{filter_spawned, shard_of, SpawnedUrl, UrlFrontier};
use crate::sanitized_url::SanitizedUrl;

/// URLs admitted per host before the host is parked for good.
const MAX_URL_PER_HOST: i64 = 5;
/// Sentinel `crawlable_at` for parked hosts (far-future epoch seconds).
const DEACTIVATION_TIME: i64 = 2_000_000_000;
/// A parked host that receives a fresh URL becomes crawlable this much later.
const REACTIVATION_DELAY_SECS: i64 = 60;
/// Pause between two pops of the same host.
const PER_HOST_DELAY_SECS: i64 = 120;

fn stream_name(gwn: u16) -> String {
    format!("url_stream_{}", gwn)
}

/// Frontier distributing URLs over per-shard Redis lists, with host state in
/// a per-worker SQLite store.
pub struct RedisStreamUrlFrontier {
    publisher: ConnectionManager,
    local: SqlitePool,
    local_db_path: Option<String>,

    gwn: u16,
    total_workers: u16,
    tld_filter: Vec<String>,

    subscriber: Option<JoinHandle<anyhow::Result<()>>>,
    subscriber_cancel: CancellationToken,
}

impl RedisStreamUrlFrontier {
    pub async fn connect(config: &Config, gwn: u16) -> anyhow::Result<Self> {
        let redis_url = config
            .url_frontier
            .redis_url
            .as_ref()
            .context("url_frontier.redis_url is required for the redis_stream frontier")?;

        let client = redis::Client::open(redis_url.as_str()).context("invalid redis url")?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect frontier redis")?;
        let subscriber_conn = ConnectionManager::new(client)
            .await
            .context("failed to connect frontier redis")?;

        let local_db_path = config
            .url_frontier
            .local_db_path
            .as_ref()
            .map(|template| template.replace("%d", &gwn.to_string()));

        let local_options = match &local_db_path {
            Some(path) => SqliteConnectOptions::new().filename(path).create_if_missing(true),
            None => {
                warn!("local db placed on memory");
                SqliteConnectOptions::new().in_memory(true)
            }
        }
        .journal_mode(SqliteJournalMode::Memory)
        .synchronous(SqliteSynchronous::Off);

        let local = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(local_options)
            .await
            .context("failed to connect local db")?;

        setup_local_store(&local).await?;

        let subscriber_cancel = CancellationToken::new();
        let subscriber = tokio::spawn(subscribe_loop(
            subscriber_conn,
            local.clone(),
            stream_name(gwn),
            subscriber_cancel.clone(),
        ));

        Ok(Self {
            publisher,
            local,
            local_db_path,
            gwn,
            total_workers: config.total_workers(),
            tld_filter: config.url_frontier.tld_filter.clone(),
            subscriber: Some(subscriber),
            subscriber_cancel,
        })
    }

    async fn stop_subscriber(&mut self) -> anyhow::Result<()> {
        self.subscriber_cancel.cancel();
        match self.subscriber.take() {
            Some(handle) => handle.await.context("subscriber task panicked")?,
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl UrlFrontier for RedisStreamUrlFrontier {
    async fn seeding(&mut self, urls: Vec<String>) -> anyhow::Result<()> {
        let spawned: Vec<SanitizedUrl> = urls
            .iter()
            .filter_map(|url| SanitizedUrl::parse(url).ok())
            .collect();

        let from = SanitizedUrl::parse("http://localhost").expect("static url");
        self.push(SpawnedUrl {
            from,
            elapsed: 0.0,
            spawned,
        })
        .await
    }

    async fn push(&mut self, spawned: SpawnedUrl) -> anyhow::Result<()> {
        let filtered = filter_spawned(&spawned, &self.tld_filter);
        if filtered.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for url in &filtered {
            let stream = stream_name(shard_of(url, self.total_workers));
            pipe.rpush(stream, url.as_str()).ignore();
        }

        pipe.query_async::<()>(&mut self.publisher)
            .await
            .context("failed to push urls")?;

        Ok(())
    }

    async fn pop(&mut self) -> anyhow::Result<Option<SanitizedUrl>> {
        pop_ready_url(&self.local, Utc::now().timestamp()).await
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        let stopped = self.stop_subscriber().await;
        self.local.close().await;
        stopped
    }

    async fn reset(&mut self) -> anyhow::Result<()> {
        redis::cmd("FLUSHALL")
            .query_async::<()>(&mut self.publisher)
            .await
            .context("failed to flush frontier redis")?;

        self.finish().await?;

        if let Some(path) = &self.local_db_path {
            let dir = std::path::Path::new(path)
                .parent()
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| ".".into());

            for entry in std::fs::read_dir(dir).context("failed to list local dbs")? {
                let entry = entry.context("failed to list local dbs")?;
                if entry.path().extension().and_then(|ext| ext.to_str()) == Some("sqlite") {
                    std::fs::remove_file(entry.path()).context("failed to delete local db")?;
                }
            }
        }

        Ok(())
    }
}

async fn setup_local_store(local: &SqlitePool) -> anyhow::Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS hosts( \
             id INTEGER PRIMARY KEY, host TEXT, crawlable_at INTEGER)",
        "CREATE UNIQUE INDEX IF NOT EXISTS hosts_host ON hosts(host)",
        "CREATE INDEX IF NOT EXISTS hosts_crawlable_at ON hosts(crawlable_at)",
        "CREATE TABLE IF NOT EXISTS urls( \
             id INTEGER PRIMARY KEY, host_id INTEGER, url TEXT, crawled INTEGER)",
        "CREATE INDEX IF NOT EXISTS urls_host_id ON urls(host_id)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(local)
            .await
            .context("failed to setup local db")?;
    }

    Ok(())
}

/// Drain the shard's stream into the local store until cancelled. BLPOP uses
/// a 1 s timeout so cancellation is observed promptly.
async fn subscribe_loop(
    mut conn: ConnectionManager,
    local: SqlitePool,
    stream: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&stream)
            .arg(1)
            .query_async(&mut conn)
            .await
            .context("failed to read url stream")?;

        let Some((_, raw)) = popped else {
            continue;
        };

        let url = SanitizedUrl::parse(&raw)
            .with_context(|| format!("unparseable url in stream: {}", raw))?;

        admit_url(&local, &url, Utc::now().timestamp()).await?;
    }
}

/// Record one incoming URL against its host, honoring the per-host URL
/// budget, path-level dedup and reactivation of parked hosts.
async fn admit_url(local: &SqlitePool, url: &SanitizedUrl, now: i64) -> anyhow::Result<()> {
    let mut tx = local.begin().await.context("failed to begin admit tx")?;

    let host_row: Option<(i64, i64)> =
        sqlx::query_as("SELECT id, crawlable_at FROM hosts WHERE host = ?")
            .bind(url.host())
            .fetch_optional(&mut *tx)
            .await
            .context("failed to query host")?;

    let host_id = match host_row {
        None => {
            let inserted = sqlx::query("INSERT INTO hosts(host, crawlable_at) VALUES(?, ?)")
                .bind(url.host())
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("failed to insert host")?;
            inserted.last_insert_rowid()
        }
        Some((host_id, crawlable_at)) => {
            let saved: Vec<String> =
                sqlx::query_scalar("SELECT url FROM urls WHERE host_id = ? LIMIT ?")
                    .bind(host_id)
                    .bind(MAX_URL_PER_HOST)
                    .fetch_all(&mut *tx)
                    .await
                    .context("failed to query saved urls")?;

            if saved.len() as i64 >= MAX_URL_PER_HOST {
                return tx.commit().await.context("failed to commit admit tx");
            }

            for raw in &saved {
                let known = SanitizedUrl::parse(raw)
                    .with_context(|| format!("unparseable url in local store: {}", raw))?;
                if known.path() == url.path() {
                    return tx.commit().await.context("failed to commit admit tx");
                }
            }

            if crawlable_at == DEACTIVATION_TIME {
                sqlx::query("UPDATE hosts SET crawlable_at = ? WHERE id = ?")
                    .bind(now + REACTIVATION_DELAY_SECS)
                    .bind(host_id)
                    .execute(&mut *tx)
                    .await
                    .context("failed to reactivate host")?;
            }

            host_id
        }
    };

    sqlx::query("INSERT INTO urls(host_id, url, crawled) VALUES(?, ?, 0)")
        .bind(host_id)
        .bind(url.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to insert url")?;

    tx.commit().await.context("failed to commit admit tx")
}

/// Return one URL of a currently-crawlable host and push that host's next
/// crawlable time forward; park the host once its budget is spent.
async fn pop_ready_url(local: &SqlitePool, now: i64) -> anyhow::Result<Option<SanitizedUrl>> {
    let host_id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM hosts WHERE crawlable_at <= ? LIMIT 1")
            .bind(now)
            .fetch_optional(local)
            .await
            .context("failed to query crawlable host")?;

    let Some(host_id) = host_id else {
        return Ok(None);
    };

    let mut tx = local.begin().await.context("failed to begin pop tx")?;

    let url_row: Option<(i64, String)> =
        sqlx::query_as("SELECT id, url FROM urls WHERE host_id = ? AND crawled = 0 LIMIT 1")
            .bind(host_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to query next url")?;

    let Some((url_id, raw)) = url_row else {
        // Nothing left for this host; park it so the scan skips it.
        sqlx::query("UPDATE hosts SET crawlable_at = ? WHERE id = ?")
            .bind(DEACTIVATION_TIME)
            .bind(host_id)
            .execute(&mut *tx)
            .await
            .context("failed to park host")?;
        tx.commit().await.context("failed to commit pop tx")?;
        return Ok(None);
    };

    let url = SanitizedUrl::parse(&raw)
        .with_context(|| format!("unparseable url in local store: {}", raw))?;

    let crawled_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM urls WHERE host_id = ? AND crawled = 1")
            .bind(host_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to count crawled urls")?;

    let next_crawlable_at = if crawled_count + 1 >= MAX_URL_PER_HOST {
        DEACTIVATION_TIME
    } else {
        now + PER_HOST_DELAY_SECS
    };

    sqlx::query("UPDATE urls SET crawled = 1 WHERE id = ?")
        .bind(url_id)
        .execute(&mut *tx)
        .await
        .context("failed to mark url crawled")?;
    sqlx::query("UPDATE hosts SET crawlable_at = ? WHERE id = ?")
        .bind(next_crawlable_at)
        .bind(host_id)
        .execute(&mut *tx)
        .await
        .context("failed to reschedule host")?;

    tx.commit().await.context("failed to commit pop tx")?;
    Ok(Some(url))
}
