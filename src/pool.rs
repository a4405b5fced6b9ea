// Fixed-size worker pool used for group fan-out
use crate::errors::{HarnessError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed number of threads pulling jobs off a shared queue.
///
/// Jobs beyond the pool size wait in the queue. Dropping the pool closes the
/// queue but does not join the workers: a job may be stuck in a service that
/// never returns, and the caller must not be held hostage by it.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(HarnessError::Config(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("svcharness-worker-{}", id))
                .spawn(move || worker_loop(receiver))?;
        }

        Ok(Self { sender: Some(sender) })
    }

    /// Queue a job for the next free worker
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| HarnessError::Config("worker pool is shut down".to_string()))?;

        sender
            .send(Box::new(job))
            .map_err(|_| HarnessError::Config("all pool workers have exited".to_string()))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once the queue is closed and drained
        self.sender.take();
    }
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let receiver = receiver
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            receiver.recv()
        };

        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!("pool job panicked");
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_runs_all_jobs() {
        let pool = WorkerPool::new(3).unwrap();
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            pool.execute(move || tx.send(i).unwrap()).unwrap();
        }
        drop(tx);

        let mut seen: Vec<i32> = rx.iter().collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_jobs_run_concurrently_up_to_size() {
        let pool = WorkerPool::new(4).unwrap();
        // All four jobs must be in flight at once to get past the barrier
        let barrier = Arc::new(Barrier::new(4));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let barrier = barrier.clone();
            let done = done.clone();
            pool.execute(move || {
                barrier.wait();
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let start = std::time::Instant::now();
        while done.load(Ordering::SeqCst) < 4 {
            assert!(start.elapsed() < Duration::from_secs(5), "jobs did not run concurrently");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() {
        let pool = WorkerPool::new(1).unwrap();
        let (tx, rx) = mpsc::channel();

        pool.execute(|| panic!("job failed")).unwrap();
        pool.execute(move || tx.send(42).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(WorkerPool::new(0).is_err());
    }
}
