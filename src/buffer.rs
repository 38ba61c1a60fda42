use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, RwLock},
};

use anyhow::{anyhow, Result};
use tracing::trace;

use crate::{
    common::{FileKind, PageID, TableID, TransactionID, RID, PAGE_SIZE},
    disk::DiskManager,
    error::DbError,
    lock::{LockManager, LockMode},
    log::LogManager,
    page::{heap_page, Page},
    recovery,
    table::TableHeap,
};

pub struct BufferPoolManager {
    disk_manager: Mutex<DiskManager>,
    log_manager: Arc<Mutex<LogManager>>,
    lock_manager: Arc<LockManager>,
    size: usize,
    pages: Mutex<BTreeMap<PageID, Arc<RwLock<Page>>>>,
}

impl BufferPoolManager {
    pub fn new(
        disk_manager: DiskManager,
        log_manager: Arc<Mutex<LogManager>>,
        lock_manager: Arc<LockManager>,
        size: usize,
    ) -> Self {
        Self {
            disk_manager: Mutex::new(disk_manager),
            log_manager,
            lock_manager,
            size,
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register_table(&self, table_id: TableID, kind: FileKind) -> Result<()> {
        self.disk_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .register_table(table_id, kind)
    }

    pub fn num_pages(&self, table_id: TableID) -> Result<u32> {
        self.disk_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .num_pages(table_id)
    }

    /// Acquires the requested page lock (blocking until granted, aborted, or
    /// timed out), then returns the cached image, loading it from disk on a
    /// miss.
    pub fn get_page(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
        mode: LockMode,
    ) -> Result<Arc<RwLock<Page>>> {
        self.lock_manager.acquire(txn_id, page_id, mode)?;

        let mut pages = self.pages.lock().map_err(|_| anyhow!("lock error"))?;
        if let Some(page) = pages.get(&page_id) {
            return Ok(page.clone());
        }
        if pages.len() >= self.size {
            self.evict(&mut pages)?;
        }
        let mut data = vec![0u8; PAGE_SIZE];
        self.disk_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .read_page(page_id, &mut data)?;
        let page = Arc::new(RwLock::new(Page::from_disk(page_id, &data)));
        pages.insert(page_id, page.clone());
        Ok(page)
    }

    // Mutators re-insert the pages they dirtied so later readers observe
    // up-to-date images even if a clean copy was evicted in between.
    pub fn put_page(&self, page_id: PageID, page: &Arc<RwLock<Page>>) -> Result<()> {
        let mut pages = self.pages.lock().map_err(|_| anyhow!("lock error"))?;
        if pages.contains_key(&page_id) {
            return Ok(());
        }
        if pages.len() >= self.size {
            self.evict(&mut pages)?;
        }
        pages.insert(page_id, page.clone());
        Ok(())
    }

    /// Appends a formatted empty heap page to the table file. The new page is
    /// immediately durable; a later abort restores its bytes but never
    /// reclaims the allocation.
    pub fn allocate_page(&self, table_id: TableID) -> Result<PageID> {
        let mut data = vec![0u8; PAGE_SIZE];
        heap_page::init(&mut data);
        self.disk_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .allocate_page(table_id, &data)
    }

    pub fn insert_tuple(&self, txn_id: TransactionID, table_id: TableID, tuple: &[u8]) -> Result<RID> {
        TableHeap::new(table_id, self).insert(txn_id, tuple)
    }

    pub fn delete_tuple(&self, txn_id: TransactionID, rid: RID) -> Result<()> {
        TableHeap::new(rid.0.table_id, self).delete(txn_id, rid)
    }

    pub fn transaction_complete(&self, txn_id: TransactionID, commit: bool) -> Result<()> {
        if commit {
            let dirtied: Vec<(PageID, Arc<RwLock<Page>>)> = {
                let pages = self.pages.lock().map_err(|_| anyhow!("lock error"))?;
                pages
                    .iter()
                    .filter(|(_, page)| {
                        page.read()
                            .map(|page| page.is_dirty() == Some(txn_id))
                            .unwrap_or(false)
                    })
                    .map(|(&page_id, page)| (page_id, page.clone()))
                    .collect()
            };
            for (page_id, page) in &dirtied {
                self.flush_page(*page_id, page)?;
            }
            self.log_manager
                .lock()
                .map_err(|_| anyhow!("lock error"))?
                .log_commit(txn_id)?;
            // The committer still holds its X-locks, so nothing can observe
            // the window between the forced COMMIT and the snapshot update.
            for (page_id, page) in &dirtied {
                debug_assert!(self.lock_manager.holds(txn_id, *page_id));
                let mut page = page.write().map_err(|_| anyhow!("lock error"))?;
                page.set_before_image();
                page.mark_dirty(None);
            }
            self.lock_manager.release_all(txn_id);
        } else {
            {
                let mut disk_manager =
                    self.disk_manager.lock().map_err(|_| anyhow!("lock error"))?;
                let mut log_manager =
                    self.log_manager.lock().map_err(|_| anyhow!("lock error"))?;
                let restored = recovery::rollback(&mut log_manager, &mut disk_manager, txn_id)?;
                drop(log_manager);
                drop(disk_manager);

                let mut pages = self.pages.lock().map_err(|_| anyhow!("lock error"))?;
                for page_id in &restored {
                    pages.remove(page_id);
                }
                // Pages dirtied in cache but never flushed have no update
                // records; dropping them uncovers the old disk bytes.
                let stale: Vec<PageID> = pages
                    .iter()
                    .filter(|(_, page)| {
                        page.read()
                            .map(|page| page.is_dirty() == Some(txn_id))
                            .unwrap_or(false)
                    })
                    .map(|(&page_id, _)| page_id)
                    .collect();
                for page_id in stale {
                    pages.remove(&page_id);
                }
            }
            self.log_manager
                .lock()
                .map_err(|_| anyhow!("lock error"))?
                .log_abort(txn_id)?;
            self.lock_manager.release_all(txn_id);
        }
        Ok(())
    }

    /// Diagnostic: forces every dirty page through the WAL path. Never called
    /// by the commit or abort paths.
    pub fn flush_all_pages(&self) -> Result<()> {
        let all: Vec<(PageID, Arc<RwLock<Page>>)> = {
            let pages = self.pages.lock().map_err(|_| anyhow!("lock error"))?;
            pages
                .iter()
                .map(|(&page_id, page)| (page_id, page.clone()))
                .collect()
        };
        for (page_id, page) in all {
            self.flush_page(page_id, &page)?;
        }
        Ok(())
    }

    pub fn discard_page(&self, page_id: PageID) {
        if let Ok(mut pages) = self.pages.lock() {
            pages.remove(&page_id);
        }
    }

    pub fn cached_page_count(&self) -> usize {
        self.pages.lock().map(|pages| pages.len()).unwrap_or(0)
    }

    pub(crate) fn write_page_to_disk(&self, page_id: PageID, data: &[u8]) -> Result<()> {
        self.disk_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .write_page(page_id, data)
    }

    // The write-ahead rule: the update record is on stable storage before the
    // page bytes are.
    fn flush_page(&self, page_id: PageID, page: &Arc<RwLock<Page>>) -> Result<()> {
        let page = page.read().map_err(|_| anyhow!("lock error"))?;
        let dirtier = match page.is_dirty() {
            Some(txn_id) => txn_id,
            None => return Ok(()),
        };
        let kind = self
            .disk_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .kind_of(page_id.table_id)?;
        {
            let mut log_manager = self.log_manager.lock().map_err(|_| anyhow!("lock error"))?;
            log_manager.log_update(dirtier, kind, page_id, page.before_image(), page.data())?;
            log_manager.force()?;
        }
        self.disk_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .write_page(page_id, page.data())?;
        Ok(())
    }

    fn evict(&self, pages: &mut BTreeMap<PageID, Arc<RwLock<Page>>>) -> Result<()> {
        let victim = pages
            .iter()
            .find(|(_, page)| {
                page.read()
                    .map(|page| page.is_dirty().is_none())
                    .unwrap_or(false)
            })
            .map(|(&page_id, _)| page_id);
        match victim {
            Some(page_id) => {
                trace!(page = ?page_id, "buffer.evict");
                pages.remove(&page_id);
                Ok(())
            }
            None => Err(DbError::OutOfBufferSpace.into()),
        }
    }
}
