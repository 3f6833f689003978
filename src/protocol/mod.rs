//! Request/response correlation over a worker's message channels.
//!
//! Every request carries a fresh token and the reply echoes it back. Replies
//! may arrive in any order; a router task hands each one to the caller that
//! registered its token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;
use uuid::Uuid;

use crate::error::JobError;
use crate::worker::WorkerId;

pub type Token = Uuid;

/// Outbound message: `{msg, id}`.
#[derive(Debug)]
pub struct Envelope<M> {
    pub msg: M,
    pub id: Token,
}

/// Inbound message: `{result, id}`.
#[derive(Debug)]
pub struct Reply<R> {
    pub result: R,
    pub id: Token,
}

struct Pending<R> {
    waiters: HashMap<Token, oneshot::Sender<R>>,
    closed: bool,
}

type SharedPending<R> = Arc<Mutex<Pending<R>>>;

fn lock<R>(pending: &SharedPending<R>) -> MutexGuard<'_, Pending<R>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a waiter when its request settles or its caller goes away.
struct Registration<'a, R> {
    pending: &'a SharedPending<R>,
    id: Token,
}

impl<R> Drop for Registration<'_, R> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.id);
    }
}

/// Caller side of one worker's channel pair.
pub struct Correlator<M, R> {
    worker: WorkerId,
    outbound: mpsc::UnboundedSender<Envelope<M>>,
    pending: SharedPending<R>,
    router: JoinHandle<()>,
}

impl<M, R> Correlator<M, R>
where
    M: Send + 'static,
    R: Send + 'static,
{
    /// Must be called from within a tokio runtime; spawns the reply router.
    pub fn new(
        worker: WorkerId,
        outbound: mpsc::UnboundedSender<Envelope<M>>,
        inbound: mpsc::UnboundedReceiver<Reply<R>>,
    ) -> Self {
        let pending = Arc::new(Mutex::new(Pending {
            waiters: HashMap::new(),
            closed: false,
        }));
        let router = tokio::spawn(route(worker, inbound, Arc::clone(&pending)));
        Self {
            worker,
            outbound,
            pending,
            router,
        }
    }

    /// Send `msg` and wait for the reply carrying the same token.
    pub async fn send(&self, msg: M) -> Result<R, JobError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(self.transport("reply channel closed"));
            }
            pending.waiters.insert(id, tx);
        }
        let _registration = Registration {
            pending: &self.pending,
            id,
        };

        trace!(worker = self.worker, %id, "sending request");
        self.outbound
            .send(Envelope { msg, id })
            .map_err(|_| self.transport("request channel closed"))?;

        rx.await
            .map_err(|_| self.transport("worker hung up before replying"))
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    fn transport(&self, reason: &str) -> JobError {
        JobError::Transport {
            worker: self.worker,
            reason: reason.to_string(),
        }
    }
}

impl<M, R> Drop for Correlator<M, R> {
    fn drop(&mut self) {
        self.router.abort();
    }
}

async fn route<R>(
    worker: WorkerId,
    mut inbound: mpsc::UnboundedReceiver<Reply<R>>,
    pending: SharedPending<R>,
) {
    while let Some(Reply { result, id }) = inbound.recv().await {
        let waiter = lock(&pending).waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have given up; nothing to do then.
                let _ = tx.send(result);
            }
            None => trace!(worker, %id, "ignoring reply with unknown token"),
        }
    }

    // Dropping the senders fails every outstanding request.
    let mut pending = lock(&pending);
    pending.closed = true;
    pending.waiters.clear();
}
