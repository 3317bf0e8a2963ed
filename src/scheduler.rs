use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use fieldx_plus::fx_plus;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::instrument;

use crate::cache::SegmentedCache;
use crate::traits::PrecomputeJob;
use crate::types::CacheOptions;

/// Segment holding every precomputed aggregate, keyed by job name.
pub const PRECOMPUTED: &str = "precomputed";

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub refreshed: usize,
    pub failed:    usize,
}

/// Background refresher of expensive aggregates.
///
/// Every `period` it runs its jobs one after another and replaces each job's entry in the [`PRECOMPUTED`] segment
/// with a fresh value. A failing job is logged and skipped; its previous value stays where it is until it expires.
/// The first tick happens right after [`start()`](Self::start).
#[fx_plus(
    parent,
    no_new,
    default(off),
    sync,
    builder(
        doc("Builder object of [`PrecomputeScheduler`].", "", "See [`PrecomputeScheduler::builder()`] method."),
        method_doc("Implement builder pattern for [`PrecomputeScheduler`]."),
    )
)]
pub struct PrecomputeScheduler<V>
where
    V: Clone + Send + Sync + 'static,
{
    #[fieldx(get(clone), builder(required, into))]
    cache: Arc<SegmentedCache<V>>,

    #[fieldx(get, builder(required))]
    jobs: Vec<Arc<dyn PrecomputeJob<V>>>,

    #[fieldx(get(copy), default(Duration::from_secs(60)))]
    period: Duration,

    #[fieldx(private, clearer, lock, get, set, builder(off))]
    task: tokio::task::JoinHandle<()>,

    #[fieldx(private, get(off), builder(off), default(AtomicBool::new(false)))]
    started: AtomicBool,

    #[fieldx(private, get(off), builder(off), default(AtomicU64::new(0)))]
    ticks: AtomicU64,
}

impl<V> PrecomputeScheduler<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Start the background loop. Only the first call has any effect.
    pub fn start(&self) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let Some(scheduler) = self.myself()
        else {
            error!("precompute scheduler is gone, not starting");
            return false;
        };

        let period = self.period();
        info!(jobs = self.jobs().len(), ?period, "starting precompute scheduler");

        self.set_task(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                scheduler.run_jobs().await;
            }
        }));

        true
    }

    /// Run every job once, in order.
    #[instrument(level = "trace", skip(self))]
    pub async fn run_jobs(&self) -> TickReport {
        let cache = self.cache();
        let mut report = TickReport::default();

        for job in self.jobs() {
            match job.compute().await {
                Ok(value) => {
                    let options = CacheOptions::ttl(job.ttl()).with_priority(job.priority());
                    cache.set(PRECOMPUTED, job.name(), value, options);
                    cache.note_prefetch();
                    report.refreshed += 1;
                    debug!(job = job.name(), "aggregate refreshed");
                }
                Err(err) => {
                    report.failed += 1;
                    error!(job = job.name(), error = %err, "precompute job failed");
                }
            }
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        report
    }

    pub fn is_running(&self) -> bool {
        self.task().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Completed ticks, including manual [`run_jobs()`](Self::run_jobs) calls.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stop the background loop. Meant for process shutdown; a stopped scheduler cannot be started again.
    pub fn stop(&self) {
        if let Some(task) = self.clear_task() {
            task.abort();
            info!("precompute scheduler stopped");
        }
    }
}

impl<V> Debug for PrecomputeScheduler<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecomputeScheduler")
            .field("period", &self.period())
            .field("jobs", &self.jobs().iter().map(|j| j.name().to_string()).collect::<Vec<_>>())
            .field("ticks", &self.ticks())
            .finish()
    }
}
