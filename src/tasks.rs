use std::sync::Weak;
use std::time::Duration;

use crate::db::{Core, MAX_EXPIRY_RESULTS};
use crate::dbsync;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

/// Periodically drains the staging store to disk.
pub(crate) struct SyncTask {
    core: Weak<Core>,
    interval: Duration,
}

impl SyncTask {
    pub fn new(core: Weak<Core>) -> Self {
        let interval = core
            .upgrade()
            .map(|c| c.opts.workers.sync_interval)
            .unwrap_or(Duration::from_secs(1));
        Self { core, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SyncTask {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        dbsync::sync(&core, false)
    }
}

/// Periodically shrinks the staging store when it outgrows its target.
pub(crate) struct DrainTask {
    core: Weak<Core>,
    interval: Duration,
}

impl DrainTask {
    pub fn new(core: Weak<Core>) -> Self {
        let interval = core
            .upgrade()
            .map(|c| c.opts.workers.drain_interval)
            .unwrap_or(Duration::from_secs(1));
        Self { core, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for DrainTask {
    fn name(&self) -> &'static str {
        "memdb-drain"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        core.mem.maybe_shrink()
    }
}

/// Periodically removes entries whose TTL has passed.
pub(crate) struct ExpiryTask {
    core: Weak<Core>,
    interval: Duration,
}

impl ExpiryTask {
    pub fn new(core: Weak<Core>) -> Self {
        let interval = core
            .upgrade()
            .map(|c| c.opts.workers.expiry_interval)
            .unwrap_or(Duration::from_secs(60));
        Self { core, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ExpiryTask {
    fn name(&self) -> &'static str {
        "key-expiry"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        let Some(core) = self.core.upgrade() else {
            return Ok(());
        };
        dbsync::expire_entries(&core, MAX_EXPIRY_RESULTS)
    }
}
