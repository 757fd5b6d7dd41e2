use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, Notify, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Write,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
}

#[derive(Debug, Clone)]
pub struct DiskJob {
    pub id: u64,
    pub kind: JobKind,
    pub piece_idx: usize,
    pub file_count: usize,
    pub size: usize,
    pub status: JobStatus,
    pub started_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct QueueSnapshot {
    pub pending: Vec<DiskJob>,
    pub running: Vec<DiskJob>,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    pending: VecDeque<DiskJob>,
    running: Vec<DiskJob>,
    draining: bool,
}

/// Per-torrent bounded-concurrency executor for disk operations.
///
/// `enqueue` admits a job, waits for a worker slot (respecting `drain`), runs
/// the caller-supplied `execute` future, and resolves with its result. FIFO
/// is achieved by `tokio::sync::Semaphore`'s fair wakeup order combined with
/// the pending/running bookkeeping used only for `get_snapshot`; the
/// semaphore is the actual scheduling mechanism.
#[derive(Debug)]
pub struct DiskQueue {
    inner: Mutex<Inner>,
    permits: Arc<Semaphore>,
    max_workers: usize,
    resumed: Notify,
}

impl DiskQueue {
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                pending: VecDeque::new(),
                running: Vec::new(),
                draining: false,
            }),
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            resumed: Notify::new(),
        }
    }

    pub async fn enqueue<F, Fut, T>(
        &self,
        kind: JobKind,
        piece_idx: usize,
        file_count: usize,
        size: usize,
        execute: F,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;
            inner.pending.push_back(DiskJob {
                id,
                kind,
                piece_idx,
                file_count,
                size,
                status: JobStatus::Pending,
                started_at: None,
            });
            id
        };

        loop {
            if self.inner.lock().await.draining {
                self.resumed.notified().await;
                continue;
            }
            break;
        }

        let _permit = self.permits.acquire().await.expect("semaphore never closed");

        {
            let mut inner = self.inner.lock().await;
            if let Some(pos) = inner.pending.iter().position(|j| j.id == id) {
                let mut job = inner.pending.remove(pos).unwrap();
                job.status = JobStatus::Running;
                job.started_at = Some(Instant::now());
                inner.running.push(job);
            }
        }

        let result = execute().await;

        {
            let mut inner = self.inner.lock().await;
            inner.running.retain(|j| j.id != id);
        }

        result
    }

    /// Marks the queue draining: no new jobs acquire a worker slot until
    /// `resume()` is called. Waits for all currently running jobs to finish.
    pub async fn drain(&self) {
        self.inner.lock().await.draining = true;
        loop {
            if self.inner.lock().await.running.is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    pub fn resume(&self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.draining = false;
        }
        self.resumed.notify_waiters();
    }

    pub async fn get_snapshot(&self) -> QueueSnapshot {
        let inner = self.inner.lock().await;
        QueueSnapshot {
            pending: inner.pending.iter().cloned().collect(),
            running: inner.running.iter().cloned().collect(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_jobs_up_to_worker_limit_concurrently() {
        let queue = Arc::new(DiskQueue::new(2));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let queue = Arc::clone(&queue);
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(JobKind::Write, i, 1, 16_384, || async {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn drain_waits_for_running_jobs_then_resume_unblocks_pending() {
        let queue = Arc::new(DiskQueue::new(1));
        let ran = Arc::new(AtomicUsize::new(0));

        let q2 = Arc::clone(&queue);
        let r2 = Arc::clone(&ran);
        let first = tokio::spawn(async move {
            q2.enqueue(JobKind::Write, 0, 1, 16_384, || async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                r2.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.drain().await;
        first.await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let snapshot = queue.get_snapshot().await;
        assert!(snapshot.running.is_empty());

        queue.resume();
        let q3 = Arc::clone(&queue);
        let r3 = Arc::clone(&ran);
        q3.enqueue(JobKind::Read, 1, 1, 16_384, || async move {
            r3.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }
}
