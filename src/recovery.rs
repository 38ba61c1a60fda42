use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use tracing::info;

use crate::{
    buffer::BufferPoolManager,
    common::{PageID, TransactionID},
    disk::DiskManager,
    log::{LogManager, LogRecord, LOG_HEADER_SIZE},
};

/// Undoes one transaction from its own update records. The caller must still
/// hold the transaction's locks. Returns the pages restored on disk so the
/// caller can drop them from the cache.
///
/// The before-image snapshot only moves at commit, so every update record of
/// the transaction carries the same pre-transaction bytes for a given page
/// and the forward restore order is immaterial.
pub(crate) fn rollback(
    log_manager: &mut LogManager,
    disk_manager: &mut DiskManager,
    txn_id: TransactionID,
) -> Result<Vec<PageID>> {
    log_manager.force()?;
    let first_offset = match log_manager.first_offset(txn_id) {
        Some(offset) => offset,
        None => return Ok(Vec::new()),
    };
    let mut restored = Vec::new();
    for (_, record) in log_manager.records_from(first_offset)? {
        if let LogRecord::Update {
            txn_id: writer,
            page_id,
            before,
            ..
        } = record
        {
            if writer == txn_id {
                disk_manager.write_page(page_id, &before)?;
                restored.push(page_id);
            }
        }
    }
    Ok(restored)
}

/// Rebuilds a consistent on-disk state from the log: a forward redo pass
/// anchored at the last checkpoint, then an undo pass over the losers.
/// Runs exactly once, before any transaction begins.
pub struct RecoveryManager {
    buffer_pool_manager: Arc<BufferPoolManager>,
    log_manager: Arc<Mutex<LogManager>>,
}

impl RecoveryManager {
    pub fn new(
        buffer_pool_manager: Arc<BufferPoolManager>,
        log_manager: Arc<Mutex<LogManager>>,
    ) -> Self {
        Self {
            buffer_pool_manager,
            log_manager,
        }
    }

    /// Returns the next transaction id to hand out, one past the largest id
    /// the log has seen.
    pub fn recover(&self) -> Result<u64> {
        let mut log_manager = self.log_manager.lock().map_err(|_| anyhow!("lock error"))?;

        let checkpoint_offset = log_manager.last_checkpoint_offset();
        let scan_start = if checkpoint_offset >= 0 {
            checkpoint_offset as u64
        } else {
            LOG_HEADER_SIZE
        };

        let mut active: HashMap<TransactionID, u64> = HashMap::new();
        let mut max_txn_id = 0u64;
        let mut redone = 0usize;

        let records = log_manager.records_from(scan_start)?;
        for (offset, record) in &records {
            match record {
                LogRecord::Begin { txn_id } => {
                    active.insert(*txn_id, *offset);
                    log_manager.set_first_offset(*txn_id, *offset);
                    max_txn_id = max_txn_id.max(txn_id.0);
                }
                LogRecord::Update {
                    txn_id,
                    page_id,
                    after,
                    ..
                } => {
                    // Unconditional redo: everything before the checkpoint is
                    // already on disk, everything after it may not be.
                    self.buffer_pool_manager.write_page_to_disk(*page_id, after)?;
                    self.buffer_pool_manager.discard_page(*page_id);
                    redone += 1;
                    max_txn_id = max_txn_id.max(txn_id.0);
                }
                LogRecord::Commit { txn_id } => {
                    active.remove(txn_id);
                    log_manager.remove_first_offset(*txn_id);
                    max_txn_id = max_txn_id.max(txn_id.0);
                }
                LogRecord::Abort { txn_id } => {
                    // Undo here, in log order: later records may redo other
                    // transactions' writes to the same pages.
                    if let Some(first_offset) = active.remove(txn_id) {
                        self.undo_transaction(&mut log_manager, *txn_id, first_offset)?;
                    }
                    log_manager.remove_first_offset(*txn_id);
                    max_txn_id = max_txn_id.max(txn_id.0);
                }
                LogRecord::Checkpoint {
                    active: checkpointed,
                } => {
                    for (txn_id, first_offset) in checkpointed {
                        active.insert(*txn_id, *first_offset);
                        log_manager.set_first_offset(*txn_id, *first_offset);
                        max_txn_id = max_txn_id.max(txn_id.0);
                    }
                }
            }
        }

        // Whoever is left never committed: a loser.
        let losers: Vec<(TransactionID, u64)> = active.into_iter().collect();
        for &(txn_id, first_offset) in &losers {
            self.undo_transaction(&mut log_manager, txn_id, first_offset)?;
            log_manager.remove_first_offset(txn_id);
        }

        info!(
            records = records.len(),
            redone,
            losers = losers.len(),
            "recovery.complete"
        );
        Ok(max_txn_id + 1)
    }

    fn undo_transaction(
        &self,
        log_manager: &mut LogManager,
        txn_id: TransactionID,
        first_offset: u64,
    ) -> Result<()> {
        for (_, record) in log_manager.records_from(first_offset)? {
            if let LogRecord::Update {
                txn_id: writer,
                page_id,
                before,
                ..
            } = record
            {
                if writer == txn_id {
                    self.buffer_pool_manager
                        .write_page_to_disk(page_id, &before)?;
                    self.buffer_pool_manager.discard_page(page_id);
                }
            }
        }
        Ok(())
    }
}
