use std::{sync::Arc, time::Duration};

use crate::{
    engine::Engine,
    error::Result,
    scheduler::{BackgroundTask, Context},
};

/// Fsyncs the active WAL segment under `FlushPolicy::Batched`.
pub struct WalSyncTask {
    engine: Arc<Engine>,
    interval: Duration,
}

impl WalSyncTask {
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for WalSyncTask {
    fn name(&self) -> &'static str {
        "wal-sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    // Buffered records must not outlive the scheduler unsynced.
    fn run_on_shutdown(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.engine.sync()
    }
}

pub struct SnapshotTask {
    engine: Arc<Engine>,
}

impl SnapshotTask {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SnapshotTask {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    fn interval(&self) -> Duration {
        self.engine.config.snapshot_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.engine.needs_snapshot() {
            self.engine.try_snapshot()?;
        }

        Ok(())
    }
}

pub struct MetricsTask {
    engine: Arc<Engine>,
}

impl MetricsTask {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.engine.config.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.engine.collect_metrics()
    }
}
