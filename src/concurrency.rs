use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::{
    buffer::BufferPoolManager, common::TransactionID, lock::LockManager, log::LogManager,
};

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum TransactionStatus {
    Running,
    Aborted,
    Committed,
}

pub struct TransactionManager {
    buffer_pool_manager: Arc<BufferPoolManager>,
    log_manager: Arc<Mutex<LogManager>>,
    lock_manager: Arc<LockManager>,
    next_txn_id: Mutex<u64>,
    statuses: Mutex<HashMap<TransactionID, TransactionStatus>>,
}

impl TransactionManager {
    // next_txn_id comes from recovery so ids stay monotonic across restarts.
    pub fn new(
        buffer_pool_manager: Arc<BufferPoolManager>,
        log_manager: Arc<Mutex<LogManager>>,
        lock_manager: Arc<LockManager>,
        next_txn_id: u64,
    ) -> Self {
        Self {
            buffer_pool_manager,
            log_manager,
            lock_manager,
            next_txn_id: Mutex::new(next_txn_id),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> Result<TransactionID> {
        let txn_id = {
            let mut next_txn_id = self.next_txn_id.lock().map_err(|_| anyhow!("lock error"))?;
            let txn_id = TransactionID(*next_txn_id);
            *next_txn_id += 1;
            txn_id
        };
        self.lock_manager.register(txn_id);
        self.log_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .log_begin(txn_id)?;
        self.statuses
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .insert(txn_id, TransactionStatus::Running);
        debug!(txn = txn_id.0, "txn.begin");
        Ok(txn_id)
    }

    pub fn commit(&self, txn_id: TransactionID) -> Result<()> {
        self.check_running(txn_id)?;
        self.buffer_pool_manager.transaction_complete(txn_id, true)?;
        self.statuses
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .insert(txn_id, TransactionStatus::Committed);
        debug!(txn = txn_id.0, "txn.commit");
        Ok(())
    }

    pub fn abort(&self, txn_id: TransactionID) -> Result<()> {
        self.check_running(txn_id)?;
        self.buffer_pool_manager.transaction_complete(txn_id, false)?;
        self.statuses
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .insert(txn_id, TransactionStatus::Aborted);
        debug!(txn = txn_id.0, "txn.abort");
        Ok(())
    }

    pub fn status(&self, txn_id: TransactionID) -> Option<TransactionStatus> {
        self.statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(&txn_id).cloned())
    }

    fn check_running(&self, txn_id: TransactionID) -> Result<()> {
        let statuses = self.statuses.lock().map_err(|_| anyhow!("lock error"))?;
        match statuses.get(&txn_id) {
            Some(TransactionStatus::Running) => Ok(()),
            Some(status) => Err(anyhow!("transaction {} is already {:?}", txn_id.0, status)),
            None => Err(anyhow!("transaction {} was never started", txn_id.0)),
        }
    }
}
