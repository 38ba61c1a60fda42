use std::{
    fs,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use anyhow::{anyhow, Result};

use crate::{
    buffer::BufferPoolManager,
    common::{FileKind, PageID, TableID, TransactionID, RID},
    concurrency::TransactionManager,
    config::Config,
    disk::DiskManager,
    lock::{LockManager, LockMode},
    log::LogManager,
    page::Page,
    recovery::RecoveryManager,
    table::TableHeap,
};

pub struct Instance {
    pub buffer_pool_manager: Arc<BufferPoolManager>,
    pub transaction_manager: Arc<TransactionManager>,
    pub lock_manager: Arc<LockManager>,
    pub log_manager: Arc<Mutex<LogManager>>,
    next_table_id: Mutex<u32>,
}

impl Instance {
    pub fn new(dir: &str, init: bool) -> Result<Self> {
        Self::with_config(dir, init, Config::default())
    }

    pub fn with_config(dir: &str, init: bool, config: Config) -> Result<Self> {
        if init {
            if fs::metadata(dir).is_ok() && fs::metadata(dir)?.is_dir() {
                fs::remove_dir_all(dir)?;
            }
            fs::create_dir_all(dir)?;
        }
        let dir = Path::new(dir);

        let log_manager = Arc::new(Mutex::new(LogManager::new(&dir.join(&config.log_file_name))?));
        let mut disk_manager = DiskManager::new(dir);

        // Table files survive restarts; recovery writes straight into them.
        let mut max_table_id = 0u32;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "tbl") {
                if let Some(table_id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u32>().ok())
                {
                    disk_manager.register_table(TableID(table_id), FileKind::Heap)?;
                    max_table_id = max_table_id.max(table_id);
                }
            }
        }

        let lock_manager = Arc::new(LockManager::new(config.lock_timeout));
        let buffer_pool_manager = Arc::new(BufferPoolManager::new(
            disk_manager,
            log_manager.clone(),
            lock_manager.clone(),
            config.pool_size,
        ));

        let recovery_manager =
            RecoveryManager::new(buffer_pool_manager.clone(), log_manager.clone());
        let next_txn_id = recovery_manager.recover()?;

        let transaction_manager = Arc::new(TransactionManager::new(
            buffer_pool_manager.clone(),
            log_manager.clone(),
            lock_manager.clone(),
            next_txn_id,
        ));

        Ok(Self {
            buffer_pool_manager,
            transaction_manager,
            lock_manager,
            log_manager,
            next_table_id: Mutex::new(max_table_id + 1),
        })
    }

    pub fn create_table(&self) -> Result<TableID> {
        let mut next_table_id = self.next_table_id.lock().map_err(|_| anyhow!("lock error"))?;
        let table_id = TableID(*next_table_id);
        *next_table_id += 1;
        self.buffer_pool_manager
            .register_table(table_id, FileKind::Heap)?;
        Ok(table_id)
    }

    pub fn begin(&self) -> Result<TransactionID> {
        self.transaction_manager.begin()
    }

    pub fn commit(&self, txn_id: TransactionID) -> Result<()> {
        self.transaction_manager.commit(txn_id)
    }

    pub fn abort(&self, txn_id: TransactionID) -> Result<()> {
        self.transaction_manager.abort(txn_id)
    }

    pub fn get_page(
        &self,
        txn_id: TransactionID,
        table_id: TableID,
        page_no: u32,
        mode: LockMode,
    ) -> Result<Arc<RwLock<Page>>> {
        self.buffer_pool_manager
            .get_page(txn_id, PageID::new(table_id, page_no), mode)
    }

    pub fn insert_tuple(
        &self,
        txn_id: TransactionID,
        table_id: TableID,
        tuple: &[u8],
    ) -> Result<RID> {
        self.buffer_pool_manager.insert_tuple(txn_id, table_id, tuple)
    }

    pub fn delete_tuple(&self, txn_id: TransactionID, rid: RID) -> Result<()> {
        self.buffer_pool_manager.delete_tuple(txn_id, rid)
    }

    pub fn scan_table(&self, txn_id: TransactionID, table_id: TableID) -> Result<Vec<Box<[u8]>>> {
        let tuples = TableHeap::new(table_id, &self.buffer_pool_manager).scan(txn_id)?;
        Ok(tuples.into_iter().map(|(_, tuple)| tuple).collect())
    }

    /// Forces every dirty buffer through the WAL, then anchors the log at a
    /// checkpoint record naming the in-flight transactions.
    pub fn checkpoint(&self) -> Result<()> {
        self.buffer_pool_manager.flush_all_pages()?;
        self.log_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .log_checkpoint()?;
        Ok(())
    }

    pub fn flush_all_pages(&self) -> Result<()> {
        self.buffer_pool_manager.flush_all_pages()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.buffer_pool_manager.flush_all_pages()?;
        self.log_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .force()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use crate::{config::Config, error::DbError, test_helpers::setup_test_database};
    use tempfile::tempdir;

    fn sorted(mut tuples: Vec<Box<[u8]>>) -> Vec<Box<[u8]>> {
        tuples.sort();
        tuples
    }

    #[test]
    fn test_new_init() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let instance = Instance::new(dir.to_str().unwrap(), true)?;
        instance.create_table()?;
        assert!(dir.exists());
        assert!(dir.join("wal.log").exists());
        assert!(dir.join("1.tbl").exists());
        Ok(())
    }

    #[test]
    fn test_tables_reopen_with_same_ids() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        let table_id = {
            let instance = Instance::new(path, true)?;
            let table_id = instance.create_table()?;
            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[1])?;
            instance.commit(txn_id)?;
            instance.shutdown()?;
            table_id
        };

        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        assert_eq!(instance.scan_table(txn_id, table_id)?.len(), 1);
        // New tables keep allocating past the reloaded ones.
        assert!(instance.create_table()?.0 > table_id.0);
        Ok(())
    }

    #[test]
    fn test_insert_delete_scan() -> Result<()> {
        let (_dir, instance, table_id) = setup_test_database()?;
        let txn_id = instance.begin()?;
        let rid1 = instance.insert_tuple(txn_id, table_id, &[1])?;
        instance.insert_tuple(txn_id, table_id, &[2])?;
        instance.delete_tuple(txn_id, rid1)?;
        instance.commit(txn_id)?;

        let txn_id = instance.begin()?;
        assert_eq!(
            instance.scan_table(txn_id, table_id)?,
            vec![vec![2].into_boxed_slice()]
        );
        Ok(())
    }

    #[test]
    fn test_commit_without_writes_logs_no_updates() -> Result<()> {
        let (_dir, instance, _table_id) = setup_test_database()?;
        let txn_id = instance.begin()?;
        instance.commit(txn_id)?;

        let records = instance
            .log_manager
            .lock()
            .unwrap()
            .records_from(crate::log::LOG_HEADER_SIZE)?;
        assert!(records
            .iter()
            .all(|(_, record)| !matches!(record, crate::log::LogRecord::Update { .. })));
        Ok(())
    }

    #[test]
    fn test_transaction_id_monotonic_across_restart() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        let last = {
            let instance = Instance::new(path, true)?;
            let table_id = instance.create_table()?;
            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[1])?;
            instance.commit(txn_id)?;
            txn_id
        };

        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        assert!(txn_id.0 > last.0);
        Ok(())
    }

    // Crash just after the COMMIT record is forced: both inserts survive.
    #[test]
    fn test_commit_then_crash() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        let table_id = {
            let instance = Instance::new(path, true)?;
            let table_id = instance.create_table()?;
            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[1])?;
            instance.insert_tuple(txn_id, table_id, &[2])?;
            instance.commit(txn_id)?;
            table_id
            // dropped without shutdown
        };

        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        assert_eq!(
            sorted(instance.scan_table(txn_id, table_id)?),
            vec![vec![1].into_boxed_slice(), vec![2].into_boxed_slice()]
        );
        Ok(())
    }

    // Dirty pages forced to disk without a commit record: the loser's write
    // must be undone by recovery.
    #[test]
    fn test_flush_all_then_crash() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        let table_id = {
            let instance = Instance::new(path, true)?;
            let table_id = instance.create_table()?;
            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[3])?;
            instance.flush_all_pages()?;
            table_id
        };

        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        assert!(instance.scan_table(txn_id, table_id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_abort_midway() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        let table_id = {
            let instance = Instance::new(path, true)?;
            let table_id = instance.create_table()?;
            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[4])?;
            instance.abort(txn_id)?;

            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[5])?;
            instance.commit(txn_id)?;
            instance.shutdown()?;
            table_id
        };

        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        assert_eq!(
            instance.scan_table(txn_id, table_id)?,
            vec![vec![5].into_boxed_slice()]
        );
        Ok(())
    }

    // One transaction aborts after another commits; page-level locking keeps
    // the two writers on separate tables.
    #[test]
    fn test_abort_and_commit_interleaved() -> Result<()> {
        let (_dir, instance, table_a) = setup_test_database()?;
        let table_b = instance.create_table()?;

        let txn1 = instance.begin()?;
        instance.insert_tuple(txn1, table_a, &[6])?;
        let txn2 = instance.begin()?;
        instance.insert_tuple(txn2, table_b, &[7])?;
        instance.commit(txn2)?;
        instance.abort(txn1)?;

        let txn_id = instance.begin()?;
        assert!(instance.scan_table(txn_id, table_a)?.is_empty());
        assert_eq!(
            instance.scan_table(txn_id, table_b)?,
            vec![vec![7].into_boxed_slice()]
        );
        Ok(())
    }

    // Two transactions S-lock one page each, then cross-request X locks. The
    // second requester is chosen as victim; the survivor commits its write.
    #[test]
    fn test_deadlock_victim_aborts_survivor_commits() -> Result<()> {
        let (_dir, instance, table_id) = setup_test_database()?;
        instance.buffer_pool_manager.allocate_page(table_id)?;
        instance.buffer_pool_manager.allocate_page(table_id)?;
        let instance = Arc::new(instance);

        let txn1 = instance.begin()?;
        let txn2 = instance.begin()?;
        instance.get_page(txn1, table_id, 0, LockMode::Shared)?;
        instance.get_page(txn2, table_id, 1, LockMode::Shared)?;

        let handle = {
            let instance = instance.clone();
            thread::spawn(move || -> Result<()> {
                instance.get_page(txn1, table_id, 1, LockMode::Exclusive)?;
                instance.insert_tuple(txn1, table_id, &[8])?;
                instance.commit(txn1)?;
                Ok(())
            })
        };
        thread::sleep(Duration::from_millis(200));

        let err = instance
            .get_page(txn2, table_id, 0, LockMode::Exclusive)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DbError>(),
            Some(&DbError::TransactionAborted)
        );
        instance.abort(txn2)?;

        handle.join().unwrap()?;
        let txn_id = instance.begin()?;
        assert_eq!(
            instance.scan_table(txn_id, table_id)?,
            vec![vec![8].into_boxed_slice()]
        );
        Ok(())
    }

    // Checkpoint-anchored recovery: committed work before and after the
    // checkpoint survives, the in-flight transaction's flushed writes do not.
    #[test]
    fn test_recovery_with_checkpoint() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        let (table_a, table_b) = {
            let instance = Instance::new(path, true)?;
            let table_a = instance.create_table()?;
            let table_b = instance.create_table()?;

            let txn_id = instance.begin()?;
            for i in 0..100u8 {
                instance.insert_tuple(txn_id, table_a, &[i; 200])?;
            }
            instance.commit(txn_id)?;

            instance.checkpoint()?;

            let txn3 = instance.begin()?;
            for i in 0..10u8 {
                instance.insert_tuple(txn3, table_a, &[100 + i; 200])?;
            }

            let txn4 = instance.begin()?;
            for i in 0..5u8 {
                instance.insert_tuple(txn4, table_b, &[200 + i; 200])?;
            }
            instance.commit(txn4)?;

            // Push txn3's dirty pages to disk so recovery has real work.
            instance.flush_all_pages()?;
            (table_a, table_b)
            // crash before txn3 commits
        };

        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        let tuples_a = instance.scan_table(txn_id, table_a)?;
        assert_eq!(tuples_a.len(), 100);
        assert!(tuples_a.iter().all(|tuple| tuple[0] < 100));
        assert_eq!(instance.scan_table(txn_id, table_b)?.len(), 5);
        Ok(())
    }

    #[test]
    fn test_recovery_is_idempotent() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        {
            let instance = Instance::new(path, true)?;
            let table_id = instance.create_table()?;
            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[1])?;
            instance.commit(txn_id)?;
            let txn_id = instance.begin()?;
            instance.insert_tuple(txn_id, table_id, &[2])?;
            instance.flush_all_pages()?;
            // crash with a loser in the log
        }

        drop(Instance::new(path, false)?);
        let after_first = fs::read(dir.join("1.tbl"))?;
        drop(Instance::new(path, false)?);
        let after_second = fs::read(dir.join("1.tbl"))?;
        assert_eq!(after_first, after_second);

        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        assert_eq!(
            instance.scan_table(txn_id, table_id_of(&dir)?)?,
            vec![vec![1].into_boxed_slice()]
        );
        Ok(())
    }

    fn table_id_of(dir: &Path) -> Result<TableID> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "tbl") {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.parse::<u32>().ok())
                {
                    return Ok(TableID(id));
                }
            }
        }
        Err(anyhow!("no table file found"))
    }

    #[test]
    fn test_reopen_empty_log_is_a_noop() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let path = dir.to_str().unwrap();
        drop(Instance::new(path, true)?);
        let instance = Instance::new(path, false)?;
        let txn_id = instance.begin()?;
        assert_eq!(txn_id, TransactionID(1));
        Ok(())
    }

    #[test]
    fn test_lock_timeout_surfaces_transaction_aborted() -> Result<()> {
        let temp_dir = tempdir()?;
        let dir = temp_dir.path().join("test");
        let config = Config {
            lock_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let instance = Instance::with_config(dir.to_str().unwrap(), true, config)?;
        let table_id = instance.create_table()?;

        let txn1 = instance.begin()?;
        instance.insert_tuple(txn1, table_id, &[1])?;
        let txn2 = instance.begin()?;
        let err = instance
            .insert_tuple(txn2, table_id, &[2])
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<DbError>(),
            Some(&DbError::TransactionAborted)
        );
        instance.abort(txn2)?;
        instance.commit(txn1)?;
        Ok(())
    }

    // Strict 2PL: a lock held by a running transaction is never granted to
    // another transaction until commit or abort.
    #[test]
    fn test_locks_held_until_complete() -> Result<()> {
        let (_dir, instance, table_id) = setup_test_database()?;
        let instance = Arc::new(instance);

        let txn1 = instance.begin()?;
        let rid = instance.insert_tuple(txn1, table_id, &[1])?;
        assert!(instance.lock_manager.holds(txn1, rid.0));

        let handle = {
            let instance = instance.clone();
            thread::spawn(move || -> Result<()> {
                let txn2 = instance.begin()?;
                instance.insert_tuple(txn2, table_id, &[2])?;
                instance.commit(txn2)?;
                Ok(())
            })
        };
        thread::sleep(Duration::from_millis(200));
        assert!(!handle.is_finished());

        instance.commit(txn1)?;
        assert!(!instance.lock_manager.holds(txn1, rid.0));
        handle.join().unwrap()?;

        let txn_id = instance.begin()?;
        assert_eq!(instance.scan_table(txn_id, table_id)?.len(), 2);
        Ok(())
    }
}
