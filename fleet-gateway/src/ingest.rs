//! Ingestion pipeline (spec.md §4.4): bounded per-kind channels, one flusher
//! task per channel batching records into the columnar store. Generalizes
//! the teacher's synchronous, one-row-at-a-time `handle_agent_telemetry` ->
//! `persist_telemetry` call into a bounded-channel + batch-flush design.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_proto::{AccessLogRecord, ProxyMetricRecord, SystemMetricRecord};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::warn;

use crate::db;
use crate::metrics::GatewayMetrics;

#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub channel_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub send_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4096,
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
            send_timeout: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
pub struct IngestMetrics {
    pub access_log_dropped: AtomicU64,
    pub system_metric_dropped: AtomicU64,
    pub proxy_metric_dropped: AtomicU64,
    pub access_log_inserted: AtomicU64,
    pub system_metric_inserted: AtomicU64,
    pub proxy_metric_inserted: AtomicU64,
}

/// Handle producers use to submit records; cloned into every session task.
#[derive(Clone)]
pub struct IngestHandle {
    access_log_tx: mpsc::Sender<AccessLogRecord>,
    system_metric_tx: mpsc::Sender<SystemMetricRecord>,
    proxy_metric_tx: mpsc::Sender<ProxyMetricRecord>,
    cfg: IngestConfig,
    pub metrics: Arc<IngestMetrics>,
}

impl IngestHandle {
    /// Starts the three flusher tasks and returns a handle to submit records.
    /// The flusher tasks run until the process exits; there is no explicit
    /// shutdown signal wired through yet (soft-cancel graceful drain is
    /// listed in spec.md §5 but not implemented by this handle).
    pub fn spawn(pool: PgPool, cfg: IngestConfig, gateway_metrics: Arc<GatewayMetrics>) -> Self {
        let metrics = Arc::new(IngestMetrics::default());

        let (access_log_tx, access_log_rx) = mpsc::channel(cfg.channel_capacity);
        let (system_metric_tx, system_metric_rx) = mpsc::channel(cfg.channel_capacity);
        let (proxy_metric_tx, proxy_metric_rx) = mpsc::channel(cfg.channel_capacity);

        tokio::spawn(flush_loop(
            access_log_rx,
            cfg.batch_size,
            cfg.flush_interval,
            pool.clone(),
            metrics.clone(),
            gateway_metrics.clone(),
            |pool, batch| Box::pin(async move { db::insert_access_log_batch(&pool, &batch).await }),
            |m, n| m.access_log_inserted.fetch_add(n, Ordering::Relaxed),
        ));
        tokio::spawn(flush_loop(
            system_metric_rx,
            cfg.batch_size,
            cfg.flush_interval,
            pool.clone(),
            metrics.clone(),
            gateway_metrics.clone(),
            |pool, batch| Box::pin(async move { db::insert_system_metric_batch(&pool, &batch).await }),
            |m, n| m.system_metric_inserted.fetch_add(n, Ordering::Relaxed),
        ));
        tokio::spawn(flush_loop(
            proxy_metric_rx,
            cfg.batch_size,
            cfg.flush_interval,
            pool.clone(),
            metrics.clone(),
            gateway_metrics,
            |pool, batch| Box::pin(async move { db::insert_proxy_metric_batch(&pool, &batch).await }),
            |m, n| m.proxy_metric_inserted.fetch_add(n, Ordering::Relaxed),
        ));

        Self {
            access_log_tx,
            system_metric_tx,
            proxy_metric_tx,
            cfg,
            metrics,
        }
    }

    pub async fn submit_access_logs(&self, records: Vec<AccessLogRecord>) {
        for r in records {
            self.submit(&self.access_log_tx, r, &self.metrics.access_log_dropped).await;
        }
    }

    pub async fn submit_system_metrics(&self, records: Vec<SystemMetricRecord>) {
        for r in records {
            self.submit(&self.system_metric_tx, r, &self.metrics.system_metric_dropped).await;
        }
    }

    pub async fn submit_proxy_metrics(&self, records: Vec<ProxyMetricRecord>) {
        for r in records {
            self.submit(&self.proxy_metric_tx, r, &self.metrics.proxy_metric_dropped).await;
        }
    }

    /// Drop-newest degradation (spec.md §4.4 "Degradation"): block up to
    /// `send_timeout`, then drop the record and count it rather than block
    /// the session's inbound demux indefinitely.
    async fn submit<T>(&self, tx: &mpsc::Sender<T>, record: T, dropped: &AtomicU64) {
        match tokio::time::timeout(self.cfg.send_timeout, tx.send(record)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                warn!("ingestion channel full or closed; dropping newest record");
            }
        }
    }
}

type BulkInsert<T> = fn(PgPool, Vec<T>) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

async fn flush_loop<T: Send + 'static>(
    mut rx: mpsc::Receiver<T>,
    batch_size: usize,
    flush_interval: Duration,
    pool: PgPool,
    metrics: Arc<IngestMetrics>,
    gateway_metrics: Arc<GatewayMetrics>,
    insert: BulkInsert<T>,
    record_inserted: fn(&IngestMetrics, u64),
) {
    let mut batch: Vec<T> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                match maybe {
                    Some(item) => {
                        batch.push(item);
                        if batch.len() >= batch_size {
                            flush(&pool, &mut batch, insert, &metrics, &gateway_metrics, record_inserted).await;
                        }
                    }
                    None => {
                        // Sender dropped: final flush, then stop.
                        flush(&pool, &mut batch, insert, &metrics, &gateway_metrics, record_inserted).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&pool, &mut batch, insert, &metrics, &gateway_metrics, record_inserted).await;
            }
        }
    }
}

async fn flush<T: Send + 'static>(
    pool: &PgPool,
    batch: &mut Vec<T>,
    insert: BulkInsert<T>,
    metrics: &Arc<IngestMetrics>,
    gateway_metrics: &Arc<GatewayMetrics>,
    record_inserted: fn(&IngestMetrics, u64),
) {
    if batch.is_empty() {
        return;
    }
    let drained: Vec<T> = std::mem::take(batch);
    let n = drained.len() as u64;
    let started = std::time::Instant::now();
    if let Err(err) = insert(pool.clone(), drained).await {
        warn!("bulk insert failed, batch lost: {err}");
        return;
    }
    gateway_metrics.record_db_op(started.elapsed());
    record_inserted(metrics, n);
}
