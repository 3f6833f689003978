//! Fixed-size worker pool.
//!
//! A single matching loop pairs the next pending job with the next idle
//! worker. Each pairing runs in its own task and hands the worker back to the
//! idle conveyor when the job settles, so a worker is always either idle or
//! running exactly one job.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{JobError, PoolError};
use crate::queue::{IdleSender, JobQueue, JobSender};
use crate::worker::{HandlerFactory, JobHandler, WorkerHandle, WorkerId};

#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub workers: usize,
    /// Jobs running longer than this are rejected and their worker replaced.
    pub job_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            job_timeout: None,
        }
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            job_timeout: config.job_timeout,
        }
    }
}

/// What `drain` found once every job had settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Ids of the workers reclaimed from the idle set, sorted.
    pub workers: Vec<WorkerId>,
    pub jobs_dispatched: usize,
}

type Reply<H> = oneshot::Sender<Result<<H as JobHandler>::Output, JobError>>;
type Pending<H> = (<H as JobHandler>::Job, Reply<H>);

pub struct WorkerPool<H: JobHandler> {
    size: usize,
    jobs: JobSender<Pending<H>>,
    dispatcher: JoinHandle<Result<DrainReport, PoolError>>,
}

impl<H: JobHandler> WorkerPool<H> {
    /// Start `config.workers` worker contexts and the matching loop. Must be
    /// called from within a tokio runtime.
    pub fn new(config: &PoolConfig, factory: HandlerFactory<H>) -> Result<Self, PoolError> {
        if config.workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (jobs, queue) = JobQueue::new();
        let idle = queue.idle_sender();
        for id in 0..config.workers {
            let worker = WorkerHandle::spawn(id, &factory)?;
            if idle.release(worker).is_err() {
                return Err(PoolError::DispatchLoop("idle conveyor closed".into()));
            }
        }

        let dispatcher = tokio::spawn(dispatch_loop(
            queue,
            config.workers,
            factory,
            config.job_timeout,
        ));
        info!(workers = config.workers, "👷 Worker pool started");

        Ok(Self {
            size: config.workers,
            jobs,
            dispatcher,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job and wait for whichever worker picks it up to finish it.
    pub async fn dispatch(&self, job: H::Job) -> Result<H::Output, JobError> {
        let (tx, rx) = oneshot::channel();
        self.jobs.push((job, tx)).map_err(|_| JobError::PoolClosed)?;
        rx.await.map_err(|_| JobError::PoolClosed)?
    }

    /// Stop accepting jobs, wait for every queued and running job, then shut
    /// down all workers.
    pub async fn drain(self) -> Result<DrainReport, PoolError> {
        let Self {
            jobs, dispatcher, ..
        } = self;
        drop(jobs);
        let report = dispatcher
            .await
            .map_err(|e| PoolError::DispatchLoop(e.to_string()))??;
        info!(
            workers = report.workers.len(),
            jobs = report.jobs_dispatched,
            "Worker pool drained"
        );
        Ok(report)
    }
}

async fn dispatch_loop<H: JobHandler>(
    mut queue: JobQueue<Pending<H>, WorkerHandle<H>>,
    size: usize,
    factory: HandlerFactory<H>,
    job_timeout: Option<Duration>,
) -> Result<DrainReport, PoolError> {
    let idle = queue.idle_sender();
    let mut jobs_dispatched = 0;

    while let Some((job, reply)) = queue.next_job().await {
        let worker = queue
            .next_idle()
            .await
            .ok_or_else(|| PoolError::DispatchLoop("idle conveyor closed".into()))?;
        jobs_dispatched += 1;
        debug!(worker = worker.id(), job = jobs_dispatched, "dispatching job");
        tokio::spawn(run_job(
            worker,
            job,
            reply,
            idle.clone(),
            factory.clone(),
            job_timeout,
        ));
    }

    // Every worker comes back once its last job settles.
    let mut workers = Vec::with_capacity(size);
    for _ in 0..size {
        let worker = queue
            .next_idle()
            .await
            .ok_or_else(|| PoolError::DispatchLoop("idle conveyor closed".into()))?;
        workers.push(worker);
    }

    let mut ids: Vec<_> = workers.iter().map(WorkerHandle::id).collect();
    ids.sort_unstable();
    futures::future::join_all(workers.into_iter().map(WorkerHandle::terminate)).await;

    Ok(DrainReport {
        workers: ids,
        jobs_dispatched,
    })
}

async fn run_job<H: JobHandler>(
    worker: WorkerHandle<H>,
    job: H::Job,
    reply: Reply<H>,
    idle: IdleSender<WorkerHandle<H>>,
    factory: HandlerFactory<H>,
    job_timeout: Option<Duration>,
) {
    let id = worker.id();
    let result = match job_timeout {
        Some(limit) => tokio::time::timeout(limit, worker.send(job))
            .await
            .unwrap_or(Err(JobError::Timeout(id))),
        None => worker.send(job).await,
    };

    let worker = match &result {
        Err(err) if err.poisons_worker() => replace(worker, &factory, err).await,
        Err(err) => {
            debug!(worker = id, error = %err, "job failed, worker stays in service");
            worker
        }
        Ok(_) => worker,
    };

    // The caller may have stopped waiting.
    let _ = reply.send(result);
    if idle.release(worker).is_err() {
        error!(worker = id, "idle conveyor closed, worker lost");
    }
}

/// Swap an unhealthy context for a fresh one under the same id.
async fn replace<H: JobHandler>(
    worker: WorkerHandle<H>,
    factory: &HandlerFactory<H>,
    err: &JobError,
) -> WorkerHandle<H> {
    let id = worker.id();
    warn!(worker = id, error = %err, "Replacing unhealthy worker");
    match WorkerHandle::spawn(id, factory) {
        Ok(fresh) => {
            match err {
                JobError::Timeout(_) => worker.abandon(),
                _ => worker.terminate().await,
            }
            fresh
        }
        Err(spawn_err) => {
            error!(
                worker = id,
                error = %spawn_err,
                "Could not replace worker, keeping the old one"
            );
            worker
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
        contexts: AtomicUsize,
    }

    enum Work {
        Sleep(u64),
        Fail,
        /// Leaves the context unusable, so the worker stops without replying.
        Crash,
    }

    struct Sleeper {
        id: WorkerId,
        gauge: Arc<Gauge>,
        broken: bool,
    }

    impl JobHandler for Sleeper {
        type Job = Work;
        type Output = WorkerId;

        fn handle(&mut self, job: Work) -> Result<WorkerId, JobError> {
            let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.gauge.peak.fetch_max(now, Ordering::SeqCst);
            let result = match job {
                Work::Sleep(ms) => {
                    thread::sleep(Duration::from_millis(ms));
                    Ok(self.id)
                }
                Work::Fail => Err(JobError::Codec("bad input".into())),
                Work::Crash => {
                    self.broken = true;
                    Ok(self.id)
                }
            };
            self.gauge.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        fn is_healthy(&self) -> bool {
            !self.broken
        }
    }

    fn pool(config: PoolConfig) -> (WorkerPool<Sleeper>, Arc<Gauge>) {
        let gauge = Arc::new(Gauge::default());
        let factory: HandlerFactory<Sleeper> = {
            let gauge = Arc::clone(&gauge);
            Arc::new(move |id| {
                gauge.contexts.fetch_add(1, Ordering::SeqCst);
                Sleeper {
                    id,
                    gauge: Arc::clone(&gauge),
                    broken: false,
                }
            })
        };
        (WorkerPool::new(&config, factory).unwrap(), gauge)
    }

    #[tokio::test]
    async fn test_rejects_empty_pool() {
        let factory: HandlerFactory<Sleeper> = Arc::new(|id| Sleeper {
            id,
            gauge: Arc::default(),
            broken: false,
        });
        assert!(matches!(
            WorkerPool::new(&PoolConfig::new(0), factory),
            Err(PoolError::NoWorkers)
        ));
    }

    #[tokio::test]
    async fn test_worker_start_failure_aborts_pool() {
        let factory: HandlerFactory<Sleeper> = Arc::new(|id| {
            if id == 1 {
                panic!("codec library missing");
            }
            Sleeper {
                id,
                gauge: Arc::default(),
                broken: false,
            }
        });
        match WorkerPool::new(&PoolConfig::new(2), factory) {
            Err(PoolError::Start { worker, reason }) => {
                assert_eq!(worker, 1);
                assert_eq!(reason, "codec library missing");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("pool started without all of its workers"),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_replaces_worker() {
        let (pool, gauge) = pool(PoolConfig::new(1));

        let err = pool.dispatch(Work::Crash).await.unwrap_err();
        assert!(matches!(err, JobError::Transport { worker: 0, .. }), "{err}");
        assert_eq!(gauge.contexts.load(Ordering::SeqCst), 2);

        assert_eq!(pool.dispatch(Work::Sleep(1)).await, Ok(0));
        let report = pool.drain().await.unwrap();
        assert_eq!(report.workers, vec![0]);
        assert_eq!(report.jobs_dispatched, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_is_bounded_by_pool_size() {
        for size in [1, 3] {
            let (pool, gauge) = pool(PoolConfig::new(size));
            let jobs = (0..12).map(|_| pool.dispatch(Work::Sleep(5)));
            let results = futures::future::join_all(jobs).await;

            assert_eq!(results.len(), 12);
            assert!(results.iter().all(|r| matches!(r, Ok(id) if *id < size)));
            assert!(gauge.peak.load(Ordering::SeqCst) <= size);

            let report = pool.drain().await.unwrap();
            assert_eq!(report.jobs_dispatched, 12);
            assert_eq!(report.workers, (0..size).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_all_workers_are_used_under_load() {
        let (pool, gauge) = pool(PoolConfig::new(4));
        let jobs = (0..8).map(|_| pool.dispatch(Work::Sleep(30)));
        let results = futures::future::join_all(jobs).await;
        assert!(results.iter().all(Result::is_ok));
        assert!(gauge.peak.load(Ordering::SeqCst) > 1);
        pool.drain().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_jobs_reject_and_keep_the_worker() {
        let (pool, gauge) = pool(PoolConfig::new(2));
        let (a, b, c) = tokio::join!(
            pool.dispatch(Work::Fail),
            pool.dispatch(Work::Sleep(1)),
            pool.dispatch(Work::Fail),
        );
        assert_eq!(a, Err(JobError::Codec("bad input".into())));
        assert!(b.is_ok());
        assert!(c.is_err());

        let report = pool.drain().await.unwrap();
        assert_eq!(report.workers, vec![0, 1]);
        assert_eq!(gauge.contexts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timed_out_worker_is_replaced() {
        let (pool, gauge) = pool(PoolConfig {
            workers: 1,
            job_timeout: Some(Duration::from_millis(50)),
        });

        let err = pool.dispatch(Work::Sleep(500)).await.unwrap_err();
        assert_eq!(err, JobError::Timeout(0));
        assert_eq!(pool.dispatch(Work::Sleep(1)).await, Ok(0));

        let report = pool.drain().await.unwrap();
        assert_eq!(report.workers, vec![0]);
        assert_eq!(gauge.contexts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drain_waits_for_queued_jobs() {
        let (pool, _) = pool(PoolConfig::new(2));
        let pool = Arc::new(pool);
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { pool.dispatch(Work::Sleep(10)).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        let pool = Arc::try_unwrap(pool).ok().unwrap();
        let report = pool.drain().await.unwrap();
        assert_eq!(report.jobs_dispatched, 6);
    }
}
