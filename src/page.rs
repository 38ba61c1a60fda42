use crate::common::{PageID, TransactionID, PAGE_SIZE};

pub mod heap_page;

#[derive(Debug)]
pub struct Page {
    page_id: PageID,
    data: Box<[u8]>,
    before_image: Box<[u8]>,
    dirty_by: Option<TransactionID>,
}

impl Page {
    // On entry to the buffer pool the before-image equals the bytes on disk.
    pub fn from_disk(page_id: PageID, data: &[u8]) -> Self {
        assert!(data.len() == PAGE_SIZE);
        Self {
            page_id,
            data: data.into(),
            before_image: data.into(),
            dirty_by: None,
        }
    }

    pub fn page_id(&self) -> PageID {
        self.page_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Copies the current bytes into the before-image snapshot. Only valid
    /// once the current bytes are known to be the committed version on disk,
    /// which is why only the commit-time flush calls this.
    pub fn set_before_image(&mut self) {
        self.before_image.copy_from_slice(&self.data);
    }

    pub fn mark_dirty(&mut self, txn_id: Option<TransactionID>) {
        self.dirty_by = txn_id;
    }

    pub fn is_dirty(&self) -> Option<TransactionID> {
        self.dirty_by
    }
}
