//! Bounded pool of numbered worker slots.
//!
//! The pool is a channel pre-filled with slot ids `1..=N`. Taking a token
//! receives an id; dropping the token sends it back, so a slot is returned
//! on every exit path of a bundle cycle.

use crate::error::IngestError;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct PoolInner {
    release: mpsc::Sender<usize>,
    acquire: Mutex<mpsc::Receiver<usize>>,
    size: usize,
}

#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    pub fn new(size: usize) -> Result<Self, IngestError> {
        if size == 0 {
            return Err(IngestError::Config(
                "slot pool needs at least one slot".to_string(),
            ));
        }
        let (release, acquire) = mpsc::channel(size);
        for id in 1..=size {
            release
                .try_send(id)
                .map_err(|_| IngestError::SlotPoolClosed)?;
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                release,
                acquire: Mutex::new(acquire),
                size,
            }),
        })
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<SlotToken, IngestError> {
        let id = {
            let mut rx = self.inner.acquire.lock().await;
            rx.recv().await.ok_or(IngestError::SlotPoolClosed)?
        };
        Ok(SlotToken {
            id,
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }
}

/// A held slot. Returned to the pool on drop.
pub struct SlotToken {
    id: usize,
    pool: Arc<PoolInner>,
}

impl SlotToken {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl std::fmt::Debug for SlotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotToken").field("id", &self.id).finish()
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        // Capacity equals the number of ids, so this never finds the channel full.
        if self.pool.release.try_send(self.id).is_err() {
            tracing::error!(slot = self.id, "could not return slot to pool");
        }
    }
}
