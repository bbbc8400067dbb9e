use std::sync::Arc;
use std::{mem, thread, time::Duration};

use crossbeam::channel;
use log::{error, info, warn};
use thiserror::Error;

use crate::cache::PageCache;
use crate::error::CacheError;
use crate::flush::FlushType;

/// Error for [`BackgroundWorker`] related operations.
#[derive(Debug, Error)]
pub enum BackgroundWorkerError {
    #[error("failed to shutdown: {0}")]
    FailedToShutdown(String),
    #[error("background worker was already shutdown")]
    AlreadyShutdown,
    #[error("failed to join background worker thread")]
    FailedToJoin,
}

/// Handle returned by starting [`BackgroundWorker`].
/// Can be used for shutting down worker and awaiting its completion.
pub struct BackgroundWorkerHandle {
    handle: thread::JoinHandle<()>,
    /// Sender end of the channel used for shutting down [`BackgroundWorker`].
    shutdown: Option<channel::Sender<()>>,
}

impl BackgroundWorkerHandle {
    pub(crate) fn new(handle: thread::JoinHandle<()>, shutdown: channel::Sender<()>) -> Self {
        BackgroundWorkerHandle {
            handle,
            shutdown: Some(shutdown),
        }
    }

    /// Signals the worker to stop. Can only succeed once per handle.
    pub fn shutdown(&mut self) -> Result<(), BackgroundWorkerError> {
        let tx = mem::take(&mut self.shutdown);
        tx.ok_or(BackgroundWorkerError::AlreadyShutdown)?
            .send(())
            .map_err(|e| BackgroundWorkerError::FailedToShutdown(e.to_string()))
    }

    /// Awaits the completion of the worker's thread.
    pub fn join(self) -> Result<(), BackgroundWorkerError> {
        self.handle
            .join()
            .map_err(|_| BackgroundWorkerError::FailedToJoin)
    }
}

pub(crate) trait BackgroundWorker {
    type BackgroundWorkerParams;

    fn start(params: Self::BackgroundWorkerParams) -> BackgroundWorkerHandle;
}

/// Periodically writes dirty pages of a [`PageCache`] back without waiting for
/// pages other threads hold.
pub(crate) struct BackgroundFlusher {
    cache: Arc<PageCache>,
    interval: Duration,
    shutdown: channel::Receiver<()>,
}

pub(crate) struct BackgroundFlusherParams {
    pub(crate) cache: Arc<PageCache>,
    pub(crate) interval: Duration,
}

impl BackgroundWorker for BackgroundFlusher {
    type BackgroundWorkerParams = BackgroundFlusherParams;

    fn start(params: Self::BackgroundWorkerParams) -> BackgroundWorkerHandle {
        info!("Starting page cache background flusher");
        let (tx, rx) = channel::unbounded();
        let flusher = BackgroundFlusher {
            cache: params.cache,
            interval: params.interval,
            shutdown: rx,
        };
        let handle = thread::spawn(move || {
            flusher.run();
        });
        BackgroundWorkerHandle::new(handle, tx)
    }
}

impl BackgroundFlusher {
    fn run(self) {
        loop {
            match self.shutdown.recv_timeout(self.interval) {
                Ok(()) => {
                    info!("Shutting down page cache background flusher");
                    break;
                }
                Err(channel::RecvTimeoutError::Timeout) => match self.flush() {
                    Ok(()) => {}
                    Err(CacheError::NotInitialized) => {
                        warn!("Page cache was shut down, stopping background flusher");
                        break;
                    }
                    Err(e) => error!("background flush failed: {e}"),
                },
                Err(channel::RecvTimeoutError::Disconnected) => {
                    // Sender dropped - trying to shutdown anyway.
                    info!("Shutting down page cache background flusher (cancellation channel dropped)");
                    break;
                }
            }
        }
    }

    fn flush(&self) -> Result<(), CacheError> {
        let report = self.cache.flush_all(FlushType::KeepLazy)?;
        if report.written > 0 || report.busy > 0 {
            info!(
                "Background flusher wrote {} pages, {} busy",
                report.written, report.busy
            );
        }
        Ok(())
    }
}
