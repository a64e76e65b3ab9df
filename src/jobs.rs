//! Background job pool
//!
//! A fixed set of worker threads pulling boxed closures from a crossbeam
//! channel. Jobs may carry a key; a keyed job is not queued again while an
//! identical one is still waiting to run.

use crate::cache::MipLevel;
use crate::develop::PipeKind;
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Deduplication key of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKey {
    Mipmap { image_id: u32, level: MipLevel },
    Pipe { session: u64, kind: PipeKind },
}

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    count: usize,
    keys: HashSet<JobKey>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<Pending>,
    idle: Condvar,
}

impl Shared {
    fn finish(&self) {
        let mut pending = self.pending.lock();
        pending.count -= 1;
        if pending.count == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct JobQueue {
    sender: Mutex<Option<Sender<(Option<JobKey>, Job)>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("raw-develop-worker-{}", i))
                .spawn(move || worker_loop(receiver, shared))?;
            workers.push(handle);
        }
        tracing::debug!("⚙️  Started {} background workers", workers.len());
        Ok(JobQueue {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            shared,
        })
    }

    /// Queue a job. Returns false when an identical keyed job is already
    /// waiting or the queue was shut down.
    pub fn submit(&self, key: Option<JobKey>, job: impl FnOnce() + Send + 'static) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        {
            let mut pending = self.shared.pending.lock();
            if let Some(key) = key {
                if !pending.keys.insert(key) {
                    tracing::debug!("Job {:?} already queued", key);
                    return false;
                }
            }
            pending.count += 1;
        }
        if sender.send((key, Box::new(job))).is_err() {
            let mut pending = self.shared.pending.lock();
            if let Some(key) = key {
                pending.keys.remove(&key);
            }
            pending.count -= 1;
            return false;
        }
        true
    }

    pub fn is_queued(&self, key: JobKey) -> bool {
        self.shared.pending.lock().keys.contains(&key)
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.shared.pending.lock().count
    }

    /// Block until every queued and running job has finished.
    pub fn wait_idle(&self) {
        let mut pending = self.shared.pending.lock();
        while pending.count > 0 {
            self.shared.idle.wait(&mut pending);
        }
    }

    /// Stop accepting jobs, let the workers drain the queue and join them.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("⚠️  Worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        // Workers exit once the channel is closed and drained.
        self.sender.get_mut().take();
    }
}

fn worker_loop(receiver: Receiver<(Option<JobKey>, Job)>, shared: Arc<Shared>) {
    while let Ok((key, job)) = receiver.recv() {
        if let Some(key) = key {
            // Once running, a new request for the same key queues again.
            shared.pending.lock().keys.remove(&key);
        }
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::warn!("⚠️  Background job {:?} panicked", key);
        }
        shared.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_all_jobs() {
        let queue = JobQueue::new(3).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            assert!(queue.submit(None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        queue.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_dedupes_queued_keys() {
        let queue = JobQueue::new(1).unwrap();
        let (release_tx, release_rx) = bounded::<()>(0);
        // Occupy the only worker so the keyed jobs stay queued.
        queue.submit(None, move || {
            let _ = release_rx.recv();
        });

        let key = JobKey::Mipmap {
            image_id: 42,
            level: MipLevel::Thumb256,
        };
        let counter = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&counter);
        assert!(queue.submit(Some(key), move || {
            first.fetch_add(1, Ordering::SeqCst);
        }));
        let second = Arc::clone(&counter);
        assert!(!queue.submit(Some(key), move || {
            second.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(queue.is_queued(key));

        release_tx.send(()).unwrap();
        queue.wait_idle();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!queue.is_queued(key));
    }

    #[test]
    fn test_survives_panicking_job() {
        let queue = JobQueue::new(1).unwrap();
        queue.submit(None, || panic!("boom"));
        let done = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&done);
        queue.submit(None, move || {
            flag.store(1, Ordering::SeqCst);
        });
        queue.wait_idle();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_rejects_new_jobs() {
        let queue = JobQueue::new(2).unwrap();
        queue.shutdown();
        assert!(!queue.submit(None, || {}));
        assert_eq!(queue.pending(), 0);
    }
}
