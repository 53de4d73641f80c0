//! Periodic relay driver.
//!
//! The scheduler calls [`OutboxEngine::relay`] sequentially: relay, then sleep
//! for the poll interval, then relay again. Relay errors are logged and
//! counted but never stop the loop; the next tick is the retry.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::OutboxEngine;
use crate::publisher::Publisher;
use crate::store::OutboxStore;

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Relay cycles started.
    pub ticks: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Messages committed as processed across all successful cycles.
    pub published: u64,
}

/// Handle to control a spawned scheduler.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the loop, after its current cycle.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    ///
    /// An in-flight relay runs to completion first.
    pub async fn shutdown(mut self) -> SchedulerStats {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(error = %e, "relay scheduler task ended abnormally");
            }
        }
        self.stats()
    }

    /// Current scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        snapshot(&self.stats)
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Drives an [`OutboxEngine`] on a fixed cadence.
pub struct RelayScheduler;

impl RelayScheduler {
    /// Run the relay loop on a background tokio task, pausing
    /// `engine.config().poll_interval` between cycles.
    pub fn spawn<S, P>(engine: Arc<OutboxEngine<S, P>>) -> SchedulerHandle
    where
        S: OutboxStore + 'static,
        P: Publisher + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let join = tokio::spawn(async move {
            scheduler_loop(&*engine, shutdown_rx, &stats_clone).await;
        });

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    /// Run the relay loop on the current task until `shutdown` flips to `true`
    /// (or its sender is dropped).
    pub async fn run<S, P>(
        engine: &OutboxEngine<S, P>,
        shutdown: watch::Receiver<bool>,
    ) -> SchedulerStats
    where
        S: OutboxStore,
        P: Publisher,
    {
        let stats = Mutex::new(SchedulerStats::default());
        scheduler_loop(engine, shutdown, &stats).await;
        snapshot(&stats)
    }
}

async fn scheduler_loop<S, P>(
    engine: &OutboxEngine<S, P>,
    mut shutdown: watch::Receiver<bool>,
    stats: &Mutex<SchedulerStats>,
) where
    S: OutboxStore,
    P: Publisher,
{
    let poll_interval = engine.config().poll_interval;
    info!(
        poll_interval_ms = poll_interval.as_millis() as u64,
        channel = %engine.config().channel,
        "relay scheduler started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let outcome = engine.relay().await;

        {
            let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
            s.ticks += 1;
            match &outcome {
                Ok(report) => {
                    s.succeeded += 1;
                    s.published += report.published as u64;
                }
                Err(_) => s.failed += 1,
            }
        }

        match outcome {
            Ok(report) if report.is_idle() => debug!("no pending messages"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "relay cycle failed, retrying next tick"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(stats = ?snapshot(stats), "relay scheduler stopped");
}

fn snapshot(stats: &Mutex<SchedulerStats>) -> SchedulerStats {
    stats.lock().map(|s| s.clone()).unwrap_or_else(|p| p.into_inner().clone())
}
