//! Isolated worker contexts.
//!
//! Each worker is a dedicated OS thread that builds and owns its own
//! [`JobHandler`]. The only way in or out is the envelope/reply channel pair,
//! so no state is shared between workers.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{JobError, PoolError};
use crate::protocol::{Correlator, Envelope, Reply};

mod handler;

pub use handler::CodecHandler;

pub type WorkerId = usize;

/// Runs jobs inside one worker context.
pub trait JobHandler: 'static {
    type Job: Send + 'static;
    type Output: Send + 'static;

    fn handle(&mut self, job: Self::Job) -> Result<Self::Output, JobError>;

    /// Checked after every job. An unhealthy context stops without replying,
    /// which the pool sees as a transport failure.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Builds a fresh handler inside each new worker context.
pub type HandlerFactory<H> = Arc<dyn Fn(WorkerId) -> H + Send + Sync>;

type JobResult<H> = Result<<H as JobHandler>::Output, JobError>;

/// The pool's reference to one worker context.
pub struct WorkerHandle<H: JobHandler> {
    id: WorkerId,
    correlator: Correlator<H::Job, JobResult<H>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<H: JobHandler> WorkerHandle<H> {
    /// Start a worker context. Needs a tokio runtime for the reply router.
    pub fn spawn(id: WorkerId, factory: &HandlerFactory<H>) -> Result<Self, PoolError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel::<Envelope<H::Job>>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Reply<JobResult<H>>>();

        let (started_tx, started_rx) = std_mpsc::sync_channel::<Result<(), String>>(1);

        let factory = Arc::clone(factory);
        let thread = thread::Builder::new()
            .name(format!("pixpress-worker-{id}"))
            .spawn(move || {
                let handler = match panic::catch_unwind(AssertUnwindSafe(|| factory(id))) {
                    Ok(handler) => handler,
                    Err(payload) => {
                        let _ = started_tx.send(Err(panic_message(payload.as_ref())));
                        return;
                    }
                };
                let _ = started_tx.send(Ok(()));
                run(id, handler, request_rx, reply_tx)
            })
            .map_err(|source| PoolError::Spawn { worker: id, source })?;

        // The context only counts as started once its handler exists.
        let started = started_rx
            .recv()
            .unwrap_or_else(|_| Err("worker exited before starting".to_string()));
        if let Err(reason) = started {
            let _ = thread.join();
            return Err(PoolError::Start { worker: id, reason });
        }

        Ok(Self {
            id,
            correlator: Correlator::new(id, request_tx, reply_rx),
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Run one job on this worker and wait for its result.
    pub async fn send(&self, job: H::Job) -> Result<H::Output, JobError> {
        self.correlator.send(job).await?
    }

    /// Close the request channel and wait for the thread to exit.
    pub async fn terminate(mut self) {
        let id = self.id;
        let thread = self.thread.take();
        drop(self);
        if let Some(thread) = thread {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => debug!(worker = id, "worker terminated"),
                _ => warn!(worker = id, "worker thread did not shut down cleanly"),
            }
        }
    }

    /// Let go of a context that may be stuck in a job. The thread is
    /// detached and exits once its current job returns.
    pub fn abandon(mut self) {
        self.thread.take();
    }
}

fn run<H: JobHandler>(
    id: WorkerId,
    mut handler: H,
    mut requests: mpsc::UnboundedReceiver<Envelope<H::Job>>,
    replies: mpsc::UnboundedSender<Reply<JobResult<H>>>,
) {
    debug!(worker = id, "worker context started");

    while let Some(Envelope { msg, id: token }) = requests.blocking_recv() {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(msg)))
            .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload.as_ref()))));
        if !handler.is_healthy() {
            warn!(worker = id, "handler reported an unusable context, stopping");
            break;
        }
        if replies.send(Reply { result, id: token }).is_err() {
            break;
        }
    }

    debug!(worker = id, "worker context stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
