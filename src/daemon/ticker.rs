use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::NaiveDate;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::{sync::coordinator::PassOutcome, utils::time::local_date};

use super::services::TrackerServices;

/// Periodic work: the checkpoint tick, daily retention and background sync passes.
pub struct Ticker {
    services: Arc<TrackerServices>,
    shutdown: CancellationToken,
    reconnected: Arc<Notify>,
    tick_interval: Duration,
    sync_interval: Duration,
    retained_on: Option<NaiveDate>,
}

impl Ticker {
    pub fn new(
        services: Arc<TrackerServices>,
        shutdown: CancellationToken,
        reconnected: Arc<Notify>,
    ) -> Self {
        let tick_interval = services.config.tick_interval();
        let sync_interval = services.config.sync_interval();
        Self {
            services,
            shutdown,
            reconnected,
            tick_interval,
            sync_interval,
            retained_on: None,
        }
    }

    /// Runs retention at most once per local day.
    async fn retention(&mut self) {
        let clock = self.services.clock.as_ref();
        let today = local_date(clock, clock.time());
        if self.retained_on == Some(today) {
            return;
        }
        match self
            .services
            .ledger
            .cleanup_retention(today, self.services.config.retention_days)
            .await
        {
            Ok(removed) => {
                debug!("Retention for {today} removed {} days", removed.len());
                self.retained_on = Some(today);
            }
            Err(e) => error!("Retention failed {e:?}"),
        }
    }

    async fn sync_pass(&self) {
        let Some(sync) = &self.services.sync else {
            return;
        };
        let span = info_span!("Periodic sync");
        match sync.sync_now().instrument(span).await {
            Ok(PassOutcome::Completed(report)) => info!("Sync finished {report:?}"),
            Ok(PassOutcome::Skipped) => debug!("Sync already running"),
            Err(e) => error!("Sync failed {e:?}"),
        }
    }

    async fn drain(&self) {
        let Some(sync) = &self.services.sync else {
            return;
        };
        if let Err(e) = sync.drain().await {
            error!("Draining the sync queue failed {e:?}");
        }
    }

    /// Executes the periodic loop until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let clock = self.services.clock.clone();
        let mut next_tick = clock.instant() + self.tick_interval;
        let mut next_sync = clock.instant() + self.sync_interval;
        let sync_enabled = self.services.sync.is_some();
        self.retention().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Ok(())
                }
                _ = clock.sleep_until(next_tick) => {
                    next_tick += self.tick_interval;
                    self.services.monitor.tick().await;
                    self.retention().await;
                }
                _ = clock.sleep_until(next_sync), if sync_enabled => {
                    next_sync += self.sync_interval;
                    self.services.monitor.tick().await;
                    self.sync_pass().await;
                }
                _ = self.reconnected.notified() => {
                    info!("Back online, draining the sync queue");
                    self.drain().await;
                }
            }
        }
    }
}
