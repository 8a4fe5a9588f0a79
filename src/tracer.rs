//! Minute-windowed crawl metrics.
//!
//! Counters accumulate inside the current wall-clock minute; when a sample
//! arrives in a newer minute the previous window is emitted asynchronously
//! to the metrics sink and the counters reset. `finish` waits for every
//! in-flight emission.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::Config;

/// Sink for minute-aggregated data points (CloudWatch-shaped contract).
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put(
        &self,
        namespace: &str,
        name: &str,
        dim_name: &str,
        dim_value: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Crawl-progress tracing hooks. Implementations must be cheap; heavy work
/// happens off the caller's path.
#[async_trait]
pub trait Tracer: Send + Sync {
    /// One crawl finished (successfully or not).
    fn trace_crawled(&self);

    /// A `Pop` succeeded after skipping `skipped` already-crawled hosts.
    fn trace_pop_skipped(&self, skipped: u64);

    /// A popped URL was dropped because its IP lock could not be acquired.
    fn trace_lock_discarded(&self);

    /// Wait for in-flight emissions.
    async fn finish(&self);
}

/// Tracer used when metrics are disabled.
pub struct NullTracer;

#[async_trait]
impl Tracer for NullTracer {
    fn trace_crawled(&self) {}
    fn trace_pop_skipped(&self, _skipped: u64) {}
    fn trace_lock_discarded(&self) {}
    async fn finish(&self) {}
}

struct Window {
    /// Unix minute the counters belong to.
    minute: i64,
    crawled: u64,
    lock_discarded: u64,
    pop_skipped_avg: f64,
    pop_skipped_samples: u64,
}

impl Window {
    fn new(minute: i64) -> Self {
        Self {
            minute,
            crawled: 0,
            lock_discarded: 0,
            pop_skipped_avg: 0.0,
            pop_skipped_samples: 0,
        }
    }
}

type TimeSource = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct MetricsTracer {
    sink: Arc<dyn MetricsSink>,
    namespace: String,
    dim_name: String,
    dim_value: String,
    window: Mutex<Window>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
    now: TimeSource,
}

impl MetricsTracer {
    pub fn new(config: &Config, sink: Arc<dyn MetricsSink>) -> anyhow::Result<Self> {
        let tracer = config
            .tracer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("tracer configuration is missing"))?;

        Ok(Self::with_time_source(
            sink,
            tracer.namespace.clone(),
            tracer.dim_name.clone(),
            tracer.dim_value.clone(),
            Box::new(Utc::now),
        ))
    }

    fn with_time_source(
        sink: Arc<dyn MetricsSink>,
        namespace: String,
        dim_name: String,
        dim_value: String,
        now: TimeSource,
    ) -> Self {
        let minute = now().timestamp().div_euclid(60);
        Self {
            sink,
            namespace,
            dim_name,
            dim_value,
            window: Mutex::new(Window::new(minute)),
            inflight: Mutex::new(Vec::new()),
            now,
        }
    }

    /// Rotate the window if the clock moved to a new minute, emitting the
    /// previous window's aggregates in a background task.
    fn rotate_if_needed(&self, window: &mut Window) {
        let minute = (self.now)().timestamp().div_euclid(60);
        if minute == window.minute {
            return;
        }

        let finished = std::mem::replace(window, Window::new(minute));
        let sink = Arc::clone(&self.sink);
        let namespace = self.namespace.clone();
        let dim_name = self.dim_name.clone();
        let dim_value = self.dim_value.clone();

        let handle = tokio::spawn(async move {
            let at = Utc
                .timestamp_opt(finished.minute * 60, 0)
                .single()
                .unwrap_or_else(Utc::now);

            let mut points = vec![
                ("CPM", finished.crawled as f64),
                ("LockDiscarded", finished.lock_discarded as f64),
            ];
            if finished.pop_skipped_samples > 0 {
                points.push(("PopSkipped", finished.pop_skipped_avg));
            }

            for (name, value) in points {
                if let Err(e) = sink
                    .put(&namespace, name, &dim_name, &dim_value, value, at)
                    .await
                {
                    warn!("metrics tracer error: {:#}", e);
                }
            }
        });

        let mut inflight = self.inflight.lock();
        inflight.retain(|h| !h.is_finished());
        inflight.push(handle);
    }
}

#[async_trait]
impl Tracer for MetricsTracer {
    fn trace_crawled(&self) {
        let mut window = self.window.lock();
        self.rotate_if_needed(&mut window);
        window.crawled += 1;
    }

    fn trace_pop_skipped(&self, skipped: u64) {
        let mut window = self.window.lock();
        self.rotate_if_needed(&mut window);
        window.pop_skipped_samples += 1;
        let n = window.pop_skipped_samples as f64;
        window.pop_skipped_avg += (skipped as f64 - window.pop_skipped_avg) / n;
    }

    fn trace_lock_discarded(&self) {
        let mut window = self.window.lock();
        self.rotate_if_needed(&mut window);
        window.lock_discarded += 1;
    }

    async fn finish(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inflight.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// CloudWatch-backed sink.
pub struct CloudWatchSink {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchSink {
    pub fn new(config: &Config) -> Self {
        let credentials = aws_sdk_cloudwatch::config::Credentials::new(
            config.aws.access_key_id.clone(),
            config.aws.secret_access_key.clone(),
            None,
            None,
            "configuration-file",
        );

        let cw_config = aws_sdk_cloudwatch::config::Builder::new()
            .behavior_version(aws_sdk_cloudwatch::config::BehaviorVersion::latest())
            .region(aws_sdk_cloudwatch::config::Region::new(config.aws.region.clone()))
            .credentials_provider(credentials)
            .build();

        Self {
            client: aws_sdk_cloudwatch::Client::from_conf(cw_config),
        }
    }
}

#[async_trait]
impl MetricsSink for CloudWatchSink {
    async fn put(
        &self,
        namespace: &str,
        name: &str,
        dim_name: &str,
        dim_value: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let dimension = aws_sdk_cloudwatch::types::Dimension::builder()
            .name(dim_name)
            .value(dim_value)
            .build();

        let datum = aws_sdk_cloudwatch::types::MetricDatum::builder()
            .metric_name(name)
            .dimensions(dimension)
            .timestamp(aws_sdk_cloudwatch::primitives::DateTime::from_secs(
                at.timestamp(),
            ))
            .value(value)
            .build();

        self.client
            .put_metric_data()
            .namespace(namespace)
            .metric_data(datum)
            .send()
            .await?;

        Ok(())
    }
}
