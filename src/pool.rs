//! Bounded pool of store connections.
//!
//! Idle connections sit in a bounded channel; acquiring receives one with a
//! timeout and dropping the guard sends it back.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::info;

use crate::store::{SqliteStore, StoreConfig, StoreError};

pub struct ConnectionPool {
    idle_tx: Sender<SqliteStore>,
    idle_rx: Receiver<SqliteStore>,
    size: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    pub fn open(
        config: &StoreConfig,
        size: usize,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let size = size.max(1);
        let (idle_tx, idle_rx) = bounded(size);
        for _ in 0..size {
            let store = SqliteStore::open(config)?;
            idle_tx.send(store).map_err(|_| StoreError::Unavailable {
                attempts: 1,
                message: "connection pool closed while filling".to_string(),
            })?;
        }

        info!(
            component = "pool",
            event = "pool.opened",
            path = %config.path.display(),
            size,
            acquire_timeout_ms = acquire_timeout.as_millis() as u64
        );

        Ok(Self {
            idle_tx,
            idle_rx,
            size,
            acquire_timeout,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    /// Blocks until a connection is free or the acquire timeout expires.
    pub fn acquire(&self) -> Result<PooledStore<'_>, StoreError> {
        match self.idle_rx.recv_timeout(self.acquire_timeout) {
            Ok(store) => Ok(PooledStore {
                store: Some(store),
                pool: self,
            }),
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Unavailable {
                attempts: 1,
                message: format!(
                    "no connection became free within {} ms",
                    self.acquire_timeout.as_millis()
                ),
            }),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Unavailable {
                attempts: 1,
                message: "connection pool closed".to_string(),
            }),
        }
    }
}

/// A checked-out connection, returned to the pool on drop.
pub struct PooledStore<'a> {
    store: Option<SqliteStore>,
    pool: &'a ConnectionPool,
}

impl Deref for PooledStore<'_> {
    type Target = SqliteStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref().unwrap_or_else(|| unreachable!("store taken before drop"))
    }
}

impl DerefMut for PooledStore<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store.as_mut().unwrap_or_else(|| unreachable!("store taken before drop"))
    }
}

impl Drop for PooledStore<'_> {
    fn drop(&mut self) {
        if let Some(store) = self.store.take() {
            let _ = self.pool.idle_tx.try_send(store);
        }
    }
}
