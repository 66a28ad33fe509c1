//! Bounded FIFO of pending SMS jobs drained by a single background worker.
//!
//! Accepting a job and delivering it are decoupled: request handlers call
//! [`DispatchQueue::enqueue`], which never blocks, and one worker task hands jobs to the
//! [`ProviderRouter`] strictly one at a time in arrival order. Delivery outcomes are only
//! logged; nothing is reported back to whoever enqueued the job.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sms_core::{SmsJob, mask_phone};
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::provider::{DispatchError, ProviderRouter};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// The queue was at capacity. The rejected job is handed back untouched.
#[derive(Debug, thiserror::Error)]
#[error("dispatch queue is full")]
pub struct QueueFull(pub SmsJob);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("dispatch worker is already running")]
    AlreadyRunning,
    #[error("dispatch worker is not running")]
    NotRunning,
    #[error("dispatch worker panicked")]
    WorkerPanicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Stopped,
    Running,
    Stopping,
}

enum WorkerState {
    Stopped,
    Running {
        stop_tx: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    },
    Stopping,
}

pub struct DispatchQueue {
    tx: mpsc::Sender<SmsJob>,
    // Only the worker holds this lock while running; stop() takes it to discard leftovers.
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SmsJob>>>,
    router: Arc<ProviderRouter>,
    send_timeout: Duration,
    state: Mutex<WorkerState>,
}

impl DispatchQueue {
    /// Create a stopped queue holding at most `capacity` jobs. A capacity of zero is
    /// treated as one.
    pub fn new(capacity: usize, router: Arc<ProviderRouter>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            router,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            state: Mutex::new(WorkerState::Stopped),
        }
    }

    /// Bound every delivery attempt; a send still running after `timeout` is abandoned.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Queue a job without waiting for space.
    pub fn enqueue(&self, job: SmsJob) -> Result<(), QueueFull> {
        match self.tx.try_send(job) {
            Ok(()) => {
                debug!(depth = self.len(), "SMS queued");
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                warn!(capacity = self.capacity(), "dispatch queue full, rejecting SMS");
                Err(QueueFull(job))
            }
            // The receiver lives as long as the queue, so the channel never closes.
            Err(TrySendError::Closed(job)) => Err(QueueFull(job)),
        }
    }

    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        if !matches!(*state, WorkerState::Stopped) {
            return Err(QueueError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run_worker(
            Arc::clone(&self.rx),
            Arc::clone(&self.router),
            self.send_timeout,
            stop_rx,
        ));

        *state = WorkerState::Running { stop_tx, handle };
        info!(
            capacity = self.capacity(),
            provider = %self.router.selected(),
            "dispatch queue started"
        );
        Ok(())
    }

    /// Stop the worker after its in-flight send and discard jobs still queued.
    ///
    /// Returns how many queued jobs were discarded. The queue can be started again.
    pub async fn stop(&self) -> Result<usize, QueueError> {
        let handle = {
            let mut state = self.lock_state();
            match mem::replace(&mut *state, WorkerState::Stopping) {
                WorkerState::Running { stop_tx, handle } => {
                    // Sent while the state lock is held so that `Stopping` implies signalled.
                    let _ = stop_tx.send(());
                    handle
                }
                other => {
                    *state = other;
                    return Err(QueueError::NotRunning);
                }
            }
        };

        let joined = handle.await;
        let discarded = self.discard_pending().await;
        *self.lock_state() = WorkerState::Stopped;

        if let Err(e) = joined {
            error!(error = %e, "dispatch worker terminated abnormally");
            return Err(QueueError::WorkerPanicked);
        }

        info!(discarded, "dispatch queue stopped");
        Ok(discarded)
    }

    pub fn status(&self) -> QueueStatus {
        match *self.lock_state() {
            WorkerState::Stopped => QueueStatus::Stopped,
            WorkerState::Running { .. } => QueueStatus::Running,
            WorkerState::Stopping => QueueStatus::Stopping,
        }
    }

    /// Jobs waiting to be claimed by the worker.
    pub fn len(&self) -> usize {
        self.capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    async fn discard_pending(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "discarding queued SMS on shutdown");
        }
        discarded
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for DispatchQueue {
    fn drop(&mut self) {
        let state = mem::replace(
            self.state.get_mut().unwrap_or_else(|e| e.into_inner()),
            WorkerState::Stopped,
        );
        if let WorkerState::Running { stop_tx, .. } = state {
            let _ = stop_tx.send(());
        }
    }
}

async fn run_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SmsJob>>>,
    router: Arc<ProviderRouter>,
    send_timeout: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut rx = rx.lock().await;
    debug!("dispatch worker running");

    loop {
        let job = tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // The stop signal is only observed between jobs; a started send runs until it
        // completes or times out.
        deliver(&router, job, send_timeout).await;
    }

    debug!("dispatch worker exiting");
}

async fn deliver(router: &ProviderRouter, job: SmsJob, send_timeout: Duration) {
    let to = mask_phone(job.recipient());
    let queued_ms = (OffsetDateTime::now_utc() - job.accepted_at()).whole_milliseconds() as i64;

    let result = match tokio::time::timeout(send_timeout, router.send(&job)).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout(send_timeout)),
    };

    match result {
        Ok(resp) => info!(
            to = %to,
            provider = resp.provider,
            id = %resp.id,
            status = resp.status.as_deref().unwrap_or("unknown"),
            queued_ms,
            "SMS handed to provider"
        ),
        Err(DispatchError::NoProviderConfigured(kind)) => error!(
            to = %to,
            provider = %kind,
            "no sender configured for selected provider, dropping SMS"
        ),
        Err(e) => error!(to = %to, error = %e, "failed to send SMS"),
    }
}
