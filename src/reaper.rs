//! Background eviction of expired and idle pooled connections.

use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::IdleReaperSchedule;
use crate::error::Error;
use crate::pool::{Connect, ConnectionPool, PoolCore, Poolable};

const REAPER_THREAD_NAME: &str = "reqpool-idle-reaper";
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodic sweeper bound to one pool.
///
/// Each tick closes free connections whose keep-alive deadline passed,
/// closes free connections idle for longer than the schedule's `idle_wait`,
/// and forgets destinations with no connections left. Leased connections are
/// never touched. The reaper only holds a weak reference, so it exits by
/// itself once the pool is dropped.
#[derive(Debug)]
pub struct IdleReaper {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl IdleReaper {
    pub fn spawn<C: Connect>(
        pool: &ConnectionPool<C>,
        schedule: IdleReaperSchedule,
    ) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|source| Error::ReaperSpawn { source })?;
        let token = CancellationToken::new();
        let pool = std::sync::Arc::downgrade(pool.core());
        let loop_token = token.clone();
        let thread = std::thread::Builder::new()
            .name(REAPER_THREAD_NAME.to_owned())
            .spawn(move || runtime.block_on(run(pool, schedule, loop_token)))
            .map_err(|source| Error::ReaperSpawn { source })?;

        Ok(Self {
            token,
            thread: Some(thread),
        })
    }

    /// Signals the reaper to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Stops the reaper and waits for its thread to exit.
    pub fn stop(mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("idle reaper thread panicked");
        }
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run<T: Poolable>(
    pool: Weak<PoolCore<T>>,
    schedule: IdleReaperSchedule,
    token: CancellationToken,
) {
    debug!(
        interval_ms = schedule.interval.as_millis() as u64,
        idle_wait_ms = schedule.idle_wait.as_millis() as u64,
        "idle reaper started"
    );
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(schedule.interval.max(MIN_INTERVAL)) => {}
        }

        let Some(core) = pool.upgrade() else {
            break;
        };
        if core.is_closed() {
            break;
        }

        let now = Instant::now();
        let expired = core.close_expired_at(now);
        let idle = core.close_idle_at(schedule.idle_wait, now);
        let pruned = core.prune_idle_destinations();
        drop(core);

        if expired + idle > 0 {
            debug!(expired, idle, pruned, "idle reaper evicted connections");
        } else {
            trace!(pruned, "idle reaper tick");
        }
    }
    debug!("idle reaper stopped");
}
