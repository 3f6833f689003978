//! The two FIFO conveyors the pool is built on: pending jobs waiting for a
//! worker, and idle workers waiting for a job.

use tokio::sync::mpsc;

/// Producer side of the pending-job conveyor. Any number of clones may push
/// concurrently; the conveyor closes once every sender is dropped.
pub struct JobSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for JobSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> JobSender<T> {
    /// Enqueue a job. Hands the job back if the consumer is gone.
    pub fn push(&self, job: T) -> Result<(), T> {
        self.tx.send(job).map_err(|e| e.0)
    }
}

/// Returns workers to the idle conveyor.
pub struct IdleSender<W> {
    tx: mpsc::UnboundedSender<W>,
}

impl<W> Clone for IdleSender<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<W> IdleSender<W> {
    /// Put a worker back in the idle set. The queue holds its own sender, so
    /// this only fails once the queue itself has been dropped.
    pub fn release(&self, worker: W) -> Result<(), W> {
        self.tx.send(worker).map_err(|e| e.0)
    }
}

/// Consumer side of both conveyors, owned by the matching loop.
pub struct JobQueue<T, W> {
    jobs: mpsc::UnboundedReceiver<T>,
    idle: mpsc::UnboundedReceiver<W>,
    idle_tx: mpsc::UnboundedSender<W>,
}

impl<T, W> JobQueue<T, W> {
    pub fn new() -> (JobSender<T>, Self) {
        let (job_tx, jobs) = mpsc::unbounded_channel();
        let (idle_tx, idle) = mpsc::unbounded_channel();
        (
            JobSender { tx: job_tx },
            Self {
                jobs,
                idle,
                idle_tx,
            },
        )
    }

    pub fn idle_sender(&self) -> IdleSender<W> {
        IdleSender {
            tx: self.idle_tx.clone(),
        }
    }

    /// Wait for the next pending job. `None` once every `JobSender` is gone
    /// and the backlog is empty.
    pub async fn next_job(&mut self) -> Option<T> {
        self.jobs.recv().await
    }

    /// Wait for the next idle worker.
    pub async fn next_idle(&mut self) -> Option<W> {
        self.idle.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conveyors_are_fifo() {
        let (jobs, mut queue) = JobQueue::<u32, &str>::new();
        for n in 1..=3 {
            jobs.push(n).unwrap();
        }
        let idle = queue.idle_sender();
        idle.release("a").unwrap();
        idle.release("b").unwrap();

        assert_eq!(queue.next_job().await, Some(1));
        assert_eq!(queue.next_job().await, Some(2));
        assert_eq!(queue.next_idle().await, Some("a"));
        assert_eq!(queue.next_idle().await, Some("b"));
        assert_eq!(queue.next_job().await, Some(3));
    }

    #[tokio::test]
    async fn test_dropping_senders_closes_after_backlog() {
        let (jobs, mut queue) = JobQueue::<u32, ()>::new();
        let other = jobs.clone();
        jobs.push(7).unwrap();
        drop(jobs);
        other.push(8).unwrap();
        drop(other);

        assert_eq!(queue.next_job().await, Some(7));
        assert_eq!(queue.next_job().await, Some(8));
        assert_eq!(queue.next_job().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let (jobs, mut queue) = JobQueue::<usize, ()>::new();
        let mut handles = Vec::new();
        for producer in 0..4 {
            let jobs = jobs.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    jobs.push(producer * 100 + i).unwrap();
                }
            }));
        }
        drop(jobs);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut received = Vec::new();
        while let Some(job) = queue.next_job().await {
            received.push(job);
        }
        assert_eq!(received.len(), 100);
    }
}
