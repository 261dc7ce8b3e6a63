//! Bounded execution pool for local calls.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{TransportError, TransportResult};

/// Caps how many local calls run at once. A permit is held for the whole call,
/// including every chunk of a stream.
#[derive(Debug, Clone)]
pub(crate) struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    max_concurrency: NonZeroUsize,
}

impl ExecutionPool {
    pub(crate) fn new(max_concurrency: NonZeroUsize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.get())),
            closed: Arc::new(AtomicBool::new(false)),
            max_concurrency,
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.max_concurrency
            .get()
            .saturating_sub(self.semaphore.available_permits())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects new calls; calls already running keep their permits.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }

    /// Waits for a free slot.
    pub(crate) async fn acquire(&self) -> TransportResult<OwnedSemaphorePermit> {
        if self.is_closed() {
            return Err(TransportError::connection_closed("local transport closed"));
        }
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::connection_closed("local transport closed"))
    }
}
