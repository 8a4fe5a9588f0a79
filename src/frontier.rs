//! Distributed URL frontier.
//!
//! URLs discovered anywhere in the fleet are sharded by the FNV-1a hash of
//! the registered domain and stored in a shared `urls` table; each worker
//! pops only its own shard. A per-worker SQLite set of normalized hosts
//! (fronted by an LRU cache) guarantees a host is crawled at most once per
//! run.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lru::LruCache;
use rand::Rng;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{MySqlPool, SqlitePool};
use thiserror::Error;
use tracing::warn;

use crate::config::Config;
use crate::sanitized_url::SanitizedUrl;
use crate::tracer::Tracer;

/// Below this many pushed URLs per shard, every URL is flushed on its own so
/// a freshly seeded crawl makes progress immediately.
const NO_BUFFER_THRESHOLD: u64 = 100;
/// Past the warm-up, URLs accumulate into tab-joined rows of this size.
const PUSH_BATCH_SIZE: usize = 50;
/// Entries kept in the in-memory front of the crawled-host set.
const HOST_CACHE_SIZE: usize = 1000;

/// The output bundle of one crawl: where it ran, how long the fetch took and
/// every link the page produced.
#[derive(Debug, Clone)]
pub struct SpawnedUrl {
    pub from: SanitizedUrl,
    pub elapsed: f64,
    pub spawned: Vec<SanitizedUrl>,
}

#[derive(Debug, Error)]
pub enum FrontierError {
    /// A popped URL belongs to another worker's shard. A producer somewhere
    /// is broken; continuing would corrupt shard discipline.
    #[error("received invalid url (shard {shard}, own gwn {gwn}): {url}")]
    ShardViolation { url: String, shard: u16, gwn: u16 },
}

/// The set of URLs still to crawl.
#[async_trait]
pub trait UrlFrontier: Send {
    /// Admit initial URLs, as if spawned from a synthetic `http://localhost`
    /// origin. Unparseable entries are skipped.
    async fn seeding(&mut self, urls: Vec<String>) -> anyhow::Result<()>;

    /// Filter, shard, buffer and commit one crawl's discovered URLs.
    async fn push(&mut self, spawned: SpawnedUrl) -> anyhow::Result<()>;

    /// Next URL owned by this worker's shard, never repeating a normalized
    /// host within the run. `None` when the shard is empty.
    async fn pop(&mut self) -> anyhow::Result<Option<SanitizedUrl>>;

    /// Close connections.
    async fn finish(&mut self) -> anyhow::Result<()>;

    /// Drop all frontier state: truncate the shared table and delete the
    /// per-worker local stores.
    async fn reset(&mut self) -> anyhow::Result<()>;
}

/// 32-bit FNV-1a.
pub fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// The worker responsible for a URL, derived from the registered domain so
/// `example.com` and `www.example.com` land on the same shard.
pub fn shard_of(url: &SanitizedUrl, total_workers: u16) -> u16 {
    (fnv32a(url.sld_and_tld().as_bytes()) % u32::from(total_workers)) as u16 + 1
}

/// Collapse all but the rightmost three DNS labels to `*`, so sprawling
/// subdomain farms count as one host for dedup purposes.
pub fn normalize_host(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').collect();
    let stars = labels.len().saturating_sub(3);
    labels
        .iter()
        .enumerate()
        .map(|(i, label)| if i < stars { "*" } else { *label })
        .collect::<Vec<&str>>()
        .join(".")
}

/// Reduce one crawl's output to at most one URL per host: self-referential
/// links and disallowed TLDs are dropped, and per host the shortest path
/// wins (first seen breaks ties).
pub(crate) fn filter_spawned(spawned: &SpawnedUrl, tld_filter: &[String]) -> Vec<SanitizedUrl> {
    let mut per_host: Vec<SanitizedUrl> = Vec::new();

    for url in &spawned.spawned {
        if url.host() == spawned.from.host() {
            continue;
        }

        if !tld_filter.is_empty() && !tld_filter.iter().any(|tld| tld == url.tld()) {
            continue;
        }

        match per_host.iter_mut().find(|kept| kept.host() == url.host()) {
            Some(kept) => {
                if url.path().len() < kept.path().len() {
                    *kept = url.clone();
                }
            }
            None => per_host.push(url.clone()),
        }
    }

    per_host
}

/// Multi-values insert of `(gwn, tab_joined_url, randomized_order)` rows.
async fn insert_url_rows(
    shared: &MySqlPool,
    rows: Vec<(u16, String, i64)>,
) -> anyhow::Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let mut builder = sqlx::QueryBuilder::<sqlx::MySql>::new(
        "INSERT INTO urls(gwn, tab_joined_url, randomized_order) ",
    );
    builder.push_values(rows, |mut row, (gwn, joined, order)| {
        row.push_bind(i32::from(gwn))
            .push_bind(joined)
            .push_bind(order);
    });

    builder
        .build()
        .execute(shared)
        .await
        .context("failed to push urls")?;

    Ok(())
}

/// Frontier backed by a shared MySQL `urls` table and a per-worker SQLite
/// crawled-host set.
pub struct SqlUrlFrontier {
    shared: MySqlPool,
    local: SqlitePool,
    local_db_path: Option<String>,

    gwn: u16,
    total_workers: u16,
    tld_filter: Vec<String>,
    tracer: Arc<dyn Tracer>,

    push_buffer: HashMap<u16, Vec<String>>,
    pushed_count: HashMap<u16, u64>,
    pop_buffer: Vec<String>,
    host_cache: LruCache<String, ()>,
}

impl SqlUrlFrontier {
    pub async fn connect(
        config: &Config,
        gwn: u16,
        tracer: Arc<dyn Tracer>,
    ) -> anyhow::Result<Self> {
        let shared = MySqlPoolOptions::new()
            .max_connections(2)
            .connect(&config.url_frontier.shared_db_source)
            .await
            .context("failed to connect shared db")?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS urls( \
                 id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY, \
                 gwn INT NOT NULL, \
                 tab_joined_url TEXT NOT NULL, \
                 randomized_order BIGINT NOT NULL, \
                 INDEX urls_gwn_order (gwn, randomized_order))",
        )
        .execute(&shared)
        .await
        .context("failed to setup shared db")?;

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
        // Durability is sacrificed deliberately; a worker crash merely
        // recrawls some hosts.
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

        sqlx::query("CREATE TABLE IF NOT EXISTS crawled_hosts(host TEXT PRIMARY KEY)")
            .execute(&local)
            .await
            .context("failed to setup local db")?;

        Ok(Self {
            shared,
            local,
            local_db_path,
            gwn,
            total_workers: config.total_workers(),
            tld_filter: config.url_frontier.tld_filter.clone(),
            tracer,
            push_buffer: HashMap::new(),
            pushed_count: HashMap::new(),
            pop_buffer: Vec::new(),
            host_cache: LruCache::new(NonZeroUsize::new(HOST_CACHE_SIZE).unwrap()),
        })
    }

    /// Commit every non-empty shard buffer as one tab-joined row each, so
    /// buffered URLs survive shutdown.
    async fn flush_push_buffer(&mut self) -> anyhow::Result<()> {
        let mut rows: Vec<(u16, String, i64)> = Vec::new();

        for (dest, buffer) in self.push_buffer.iter_mut() {
            if buffer.is_empty() {
                continue;
            }
            let joined = buffer.join("\t");
            buffer.clear();
            rows.push((*dest, joined, rand::thread_rng().gen_range(0..i64::MAX)));
        }

        insert_url_rows(&self.shared, rows).await
    }

    /// Whether this worker already popped a URL of the same normalized host.
    async fn already_popped(&mut self, normalized: &str) -> anyhow::Result<bool> {
        if self.host_cache.contains(normalized) {
            return Ok(true);
        }

        let row = sqlx::query_scalar::<_, i64>("SELECT 1 FROM crawled_hosts WHERE host = ?")
            .bind(normalized)
            .fetch_optional(&self.local)
            .await
            .context("failed to query crawled host")?;

        if row.is_some() {
            self.host_cache.put(normalized.to_string(), ());
            return Ok(true);
        }

        Ok(false)
    }
}

#[async_trait]
impl UrlFrontier for SqlUrlFrontier {
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
        let mut rows: Vec<(u16, String, i64)> = Vec::new();

        for url in filter_spawned(&spawned, &self.tld_filter) {
            let dest = shard_of(&url, self.total_workers);

            let buffer = self.push_buffer.entry(dest).or_default();
            buffer.push(url.as_str().to_string());

            let pushed = self.pushed_count.entry(dest).or_insert(0);
            *pushed += 1;

            let threshold = if *pushed < NO_BUFFER_THRESHOLD {
                1
            } else {
                PUSH_BATCH_SIZE
            };

            if buffer.len() >= threshold {
                let joined = buffer.join("\t");
                buffer.clear();
                rows.push((dest, joined, rand::thread_rng().gen_range(0..i64::MAX)));
            }
        }

        insert_url_rows(&self.shared, rows).await
    }

    async fn pop(&mut self) -> anyhow::Result<Option<SanitizedUrl>> {
        let mut skipped: u64 = 0;

        loop {
            if self.pop_buffer.is_empty() {
                let row: Option<(i64, String)> = sqlx::query_as(
                    "SELECT id, tab_joined_url FROM urls \
                     WHERE gwn = ? ORDER BY randomized_order LIMIT 1",
                )
                .bind(i32::from(self.gwn))
                .fetch_optional(&self.shared)
                .await
                .context("failed to pop url")?;

                let (id, tab_joined_url) = match row {
                    Some(row) => row,
                    None => return Ok(None),
                };

                sqlx::query("DELETE FROM urls WHERE id = ?")
                    .bind(id)
                    .execute(&self.shared)
                    .await
                    .context("failed to delete popped row")?;

                self.pop_buffer = tab_joined_url.split('\t').map(String::from).collect();
                self.pop_buffer.reverse(); // consume from the back
            }

            let raw = self.pop_buffer.pop().expect("pop buffer refilled above");
            let url = SanitizedUrl::parse(&raw)
                .with_context(|| format!("unparseable url in frontier: {}", raw))?;

            let shard = shard_of(&url, self.total_workers);
            if shard != self.gwn {
                return Err(FrontierError::ShardViolation {
                    url: url.as_str().to_string(),
                    shard,
                    gwn: self.gwn,
                }
                .into());
            }

            let normalized = normalize_host(&url.host());
            if self.already_popped(&normalized).await? {
                skipped += 1;
                continue;
            }

            sqlx::query("INSERT INTO crawled_hosts VALUES(?)")
                .bind(&normalized)
                .execute(&self.local)
                .await
                .context("failed to record crawled host")?;

            self.tracer.trace_pop_skipped(skipped);
            return Ok(Some(url));
        }
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        self.flush_push_buffer().await?;
        self.shared.close().await;
        self.local.close().await;
        Ok(())
    }

    async fn reset(&mut self) -> anyhow::Result<()> {
        // Buffered URLs are part of the state being wiped; dropping them
        // here keeps finish() from re-inserting into the emptied table.
        self.push_buffer.clear();

        // TRUNCATE is MySQL-only; DELETE keeps this portable across test
        // setups.
        sqlx::query("DELETE FROM urls")
            .execute(&self.shared)
            .await
            .context("failed to reset shared db")?;

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
