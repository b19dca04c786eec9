//! Scrape pipeline
//!
//! The producer loop: every collect interval, run each collector in turn,
//! merge the results into one snapshot, apply the transforms, render the
//! text and hand it to the HTTP side over a bounded channel. A full channel
//! blocks the producer, which is the backpressure we want when scrapes
//! outpace the consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::collector::{Collector, Snapshot};
use crate::devices::Inventory;
use crate::error::{ExporterError, Result};
use crate::render::render;
use crate::transform::Transform;

/// Rendered snapshots in flight between producer and HTTP consumer.
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 10;

pub struct Pipeline {
    collectors: Vec<Box<dyn Collector>>,
    transforms: Vec<Box<dyn Transform>>,
    inventory: Arc<Inventory>,
    interval: Duration,
    snapshot_tx: mpsc::Sender<String>,
}

impl Pipeline {
    pub fn new(
        collectors: Vec<Box<dyn Collector>>,
        transforms: Vec<Box<dyn Transform>>,
        inventory: Arc<Inventory>,
        collect_interval_ms: u64,
    ) -> (Self, mpsc::Receiver<String>) {
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let pipeline = Self {
            collectors,
            transforms,
            inventory,
            interval: Duration::from_millis(collect_interval_ms.max(1)),
            snapshot_tx,
        };
        (pipeline, snapshot_rx)
    }

    /// Run until shutdown or a fatal error. The first scrape happens
    /// immediately so `/metrics` has data before the first full interval.
    pub async fn run(
        self,
        mut shutdown: broadcast::Receiver<()>,
        fatal_tx: mpsc::Sender<ExporterError>,
    ) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            collectors = self.collectors.len(),
            "starting scrape pipeline"
        );

        let mut ticker = interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scrape().await {
                        Ok(text) => {
                            // A closed receiver means the HTTP side is gone.
                            if self.snapshot_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "fatal error during scrape");
                            let _ = fatal_tx.send(e).await;
                            break;
                        }
                        Err(e) => {
                            // Transient; the last snapshot stays current and
                            // the next tick retries.
                            warn!(error = %e, "scrape failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("shutting down scrape pipeline");
                    break;
                }
            }
        }
        self.cleanup();
    }

    async fn scrape(&self) -> Result<String> {
        let mut snapshot = Snapshot::default();
        for collector in &self.collectors {
            let part = collector.get_metrics()?;
            debug!(
                collector = collector.name(),
                metrics = part.metric_count(),
                "collector scraped"
            );
            snapshot.merge(part);
        }
        for transform in &self.transforms {
            transform.process(&mut snapshot, &self.inventory).await?;
        }
        render(&snapshot)
    }

    /// Release collector-owned watches and groups, newest first.
    fn cleanup(&self) {
        for collector in self.collectors.iter().rev() {
            collector.cleanup();
        }
    }
}
