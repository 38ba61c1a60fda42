use anyhow::{anyhow, Result};

use crate::{
    buffer::BufferPoolManager,
    common::{PageID, TableID, TransactionID, RID},
    error::DbError,
    lock::LockMode,
    page::heap_page,
};

/// Tuple-level access to one heap table, routed through the buffer pool so
/// every touched page is locked and cached.
pub struct TableHeap<'a> {
    table_id: TableID,
    buffer_pool_manager: &'a BufferPoolManager,
}

impl<'a> TableHeap<'a> {
    pub fn new(table_id: TableID, buffer_pool_manager: &'a BufferPoolManager) -> Self {
        Self {
            table_id,
            buffer_pool_manager,
        }
    }

    // First fit over the existing pages, appending a fresh page when every
    // one is full. The X-locks taken while probing stay held (strict 2PL).
    pub fn insert(&self, txn_id: TransactionID, tuple: &[u8]) -> Result<RID> {
        if tuple.len() > heap_page::MAX_TUPLE_SIZE {
            return Err(DbError::TupleTooLarge(tuple.len()).into());
        }
        let num_pages = self.buffer_pool_manager.num_pages(self.table_id)?;
        for page_no in 0..num_pages {
            let page_id = PageID::new(self.table_id, page_no);
            if let Some(rid) = self.try_insert_into(txn_id, page_id, tuple)? {
                return Ok(rid);
            }
        }
        let page_id = self.buffer_pool_manager.allocate_page(self.table_id)?;
        match self.try_insert_into(txn_id, page_id, tuple)? {
            Some(rid) => Ok(rid),
            None => Err(anyhow!("freshly allocated page rejected the tuple")),
        }
    }

    pub fn delete(&self, txn_id: TransactionID, rid: RID) -> Result<()> {
        let page = self
            .buffer_pool_manager
            .get_page(txn_id, rid.0, LockMode::Exclusive)?;
        {
            let mut page = page.write().map_err(|_| anyhow!("lock error"))?;
            heap_page::delete(page.data_mut(), rid.1)?;
            page.mark_dirty(Some(txn_id));
        }
        self.buffer_pool_manager.put_page(rid.0, &page)?;
        Ok(())
    }

    pub fn scan(&self, txn_id: TransactionID) -> Result<Vec<(RID, Box<[u8]>)>> {
        let num_pages = self.buffer_pool_manager.num_pages(self.table_id)?;
        let mut tuples = Vec::new();
        for page_no in 0..num_pages {
            let page_id = PageID::new(self.table_id, page_no);
            let page = self
                .buffer_pool_manager
                .get_page(txn_id, page_id, LockMode::Shared)?;
            let page = page.read().map_err(|_| anyhow!("lock error"))?;
            heap_page::check_page_type(page.data())?;
            for slot in 0..heap_page::slot_count(page.data()) as u32 {
                if let Some(tuple) = heap_page::tuple(page.data(), slot) {
                    tuples.push((RID(page_id, slot), tuple));
                }
            }
        }
        Ok(tuples)
    }

    fn try_insert_into(
        &self,
        txn_id: TransactionID,
        page_id: PageID,
        tuple: &[u8],
    ) -> Result<Option<RID>> {
        let page = self
            .buffer_pool_manager
            .get_page(txn_id, page_id, LockMode::Exclusive)?;
        let slot = {
            let mut page = page.write().map_err(|_| anyhow!("lock error"))?;
            if !heap_page::has_space_for(page.data(), tuple.len()) {
                return Ok(None);
            }
            let slot = heap_page::insert(page.data_mut(), tuple)?;
            page.mark_dirty(Some(txn_id));
            slot
        };
        self.buffer_pool_manager.put_page(page_id, &page)?;
        Ok(Some(RID(page_id, slot)))
    }
}
