//! Job bookkeeping shared by every driver
//!
//! Each job is a cell holding a `watch` channel with the current state, the
//! backend correlation data `M` captured at registration, and an optional
//! resource `H` (a pooled session) that stays checked out until the result
//! is consumed.
//!
//! State changes always replace the whole `JobState` value inside
//! `send_if_modified`, so readers never observe a half-applied update.

use sluice_core::{DriverError, JobId, JobResult, JobStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, PartialEq)]
enum JobState {
    Running { cancel_requested: bool },
    Finished(JobResult),
}

struct JobCell<M, H> {
    meta: M,
    state: watch::Sender<JobState>,
    held: Mutex<Option<H>>,
    task: Mutex<Option<AbortHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lets the work behind a job see that a cancel was requested
pub struct CancelSignal {
    rx: watch::Receiver<JobState>,
}

impl CancelSignal {
    pub fn is_requested(&self) -> bool {
        matches!(&*self.rx.borrow(), JobState::Running { cancel_requested: true })
    }

    /// Resolves once a cancel is requested. Never resolves for a job that
    /// finishes or is dropped first.
    pub async fn requested(&mut self) {
        let seen = self
            .rx
            .wait_for(|state| matches!(state, JobState::Running { cancel_requested: true }))
            .await
            .is_ok();
        if !seen {
            std::future::pending::<()>().await;
        }
    }
}

/// In-memory job map of one driver instance
pub struct JobTable<M, H = ()> {
    jobs: Mutex<HashMap<JobId, Arc<JobCell<M, H>>>>,
}

impl<M, H> Default for JobTable<M, H> {
    fn default() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl<M, H> JobTable<M, H>
where
    M: Clone + Send + Sync + 'static,
    H: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new running job and return its id
    pub fn register(&self, meta: M) -> JobId {
        let (state, _) = watch::channel(JobState::Running { cancel_requested: false });
        let cell = Arc::new(JobCell {
            meta,
            state,
            held: Mutex::new(None),
            task: Mutex::new(None),
        });

        let mut jobs = lock(&self.jobs);
        let mut job_id = JobId::generate();
        while jobs.contains_key(&job_id) {
            job_id = JobId::generate();
        }
        jobs.insert(job_id.clone(), cell);
        job_id
    }

    /// Run `work` in the background and resolve the job with its output
    pub fn spawn<F>(self: &Arc<Self>, job_id: &JobId, work: F)
    where
        F: Future<Output = (JobResult, Option<H>)> + Send + 'static,
    {
        let table = Arc::clone(self);
        let id = job_id.clone();
        let handle = tokio::spawn(async move {
            let (outcome, held) = work.await;
            table.resolve(&id, outcome, held);
        });

        if let Some(cell) = self.cell(job_id) {
            *lock(&cell.task) = Some(handle.abort_handle());
        }
    }

    /// Current status, `None` once consumed or never registered
    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.cell(job_id).map(|cell| match &*cell.state.borrow() {
            JobState::Running { .. } => JobStatus::Running,
            JobState::Finished(result) => result.status(),
        })
    }

    /// Correlation data captured at registration
    pub fn metadata(&self, job_id: &JobId) -> Option<M> {
        self.cell(job_id).map(|cell| cell.meta.clone())
    }

    /// Watch for a cancellation request on a running job
    pub fn cancel_signal(&self, job_id: &JobId) -> Option<CancelSignal> {
        self.cell(job_id).map(|cell| CancelSignal {
            rx: cell.state.subscribe(),
        })
    }

    /// Record a cancellation request.
    ///
    /// Returns the correlation data when the job is still running and the
    /// backend should be signalled, `None` when the job is already terminal.
    pub fn request_cancel(&self, job_id: &JobId) -> Result<Option<M>, DriverError> {
        let cell = self
            .cell(job_id)
            .ok_or_else(|| DriverError::JobNotFound(job_id.clone()))?;

        let mut running = false;
        cell.state.send_if_modified(|state| match state {
            JobState::Running { cancel_requested } => {
                let already = *cancel_requested;
                running = true;
                *state = JobState::Running { cancel_requested: true };
                !already
            }
            JobState::Finished(_) => false,
        });

        Ok(running.then(|| cell.meta.clone()))
    }

    /// Move a running job to its terminal state.
    ///
    /// A recorded cancellation request wins over whatever `outcome` says.
    /// Returns `false` when the job was already terminal or is unknown; `held`
    /// is dropped in that case.
    pub fn resolve(&self, job_id: &JobId, outcome: JobResult, held: Option<H>) -> bool {
        let Some(cell) = self.cell(job_id) else {
            return false;
        };

        let mut slot = lock(&cell.held);
        let mut final_status = None;
        let transitioned = cell.state.send_if_modified(|state| match state {
            JobState::Running { cancel_requested } => {
                let result = if *cancel_requested {
                    JobResult::Canceled
                } else {
                    outcome
                };
                final_status = Some(result.status());
                *state = JobState::Finished(result);
                true
            }
            JobState::Finished(_) => false,
        });

        if transitioned {
            *slot = held;
            tracing::info!(job_id = %job_id, status = ?final_status, "job finished");
        } else {
            tracing::debug!(job_id = %job_id, "late completion ignored");
        }
        transitioned
    }

    /// Wait for the job to finish, then consume it.
    ///
    /// Every concurrent waiter receives the same result. The held resource is
    /// released exactly once and the entry is removed, so a later call fails
    /// with `JobNotFound`.
    pub async fn wait(&self, job_id: &JobId) -> Result<JobResult, DriverError> {
        let cell = self
            .cell(job_id)
            .ok_or_else(|| DriverError::JobNotFound(job_id.clone()))?;

        let mut rx = cell.state.subscribe();
        let finished = {
            let state = rx
                .wait_for(|state| matches!(state, JobState::Finished(_)))
                .await
                .map_err(|_| DriverError::JobNotFound(job_id.clone()))?;
            match &*state {
                JobState::Finished(result) => Some(result.clone()),
                JobState::Running { .. } => None,
            }
        };
        let result = finished.ok_or_else(|| DriverError::JobNotFound(job_id.clone()))?;

        {
            let mut jobs = lock(&self.jobs);
            if jobs.get(job_id).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                jobs.remove(job_id);
            }
        }

        let released = lock(&cell.held).take();
        if released.is_some() {
            tracing::debug!(job_id = %job_id, "released held resource");
        }
        drop(released);

        Ok(result)
    }

    /// Abort every job, resolving the running ones as errors, and release all
    /// held resources. Returns the number of jobs that were still running.
    pub fn abort_all(&self, reason: &str) -> usize {
        let drained: Vec<(JobId, Arc<JobCell<M, H>>)> = lock(&self.jobs).drain().collect();

        let mut aborted = 0;
        for (job_id, cell) in drained {
            if let Some(task) = lock(&cell.task).take() {
                task.abort();
            }

            let transitioned = cell.state.send_if_modified(|state| match state {
                JobState::Running { .. } => {
                    *state = JobState::Finished(JobResult::error(reason));
                    true
                }
                JobState::Finished(_) => false,
            });
            if transitioned {
                aborted += 1;
                tracing::info!(job_id = %job_id, reason, "job aborted");
            }

            drop(lock(&cell.held).take());
        }
        aborted
    }

    /// Number of tracked jobs, finished-but-unconsumed included
    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs still running
    pub fn running(&self) -> usize {
        lock(&self.jobs)
            .values()
            .filter(|cell| matches!(&*cell.state.borrow(), JobState::Running { .. }))
            .count()
    }

    fn cell(&self, job_id: &JobId) -> Option<Arc<JobCell<M, H>>> {
        lock(&self.jobs).get(job_id).cloned()
    }
}
