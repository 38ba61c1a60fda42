use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::{anyhow, Result};
use tracing::info;

use crate::common::{FileKind, PageID, TableID, TransactionID, PAGE_SIZE};

// The file starts with the offset of the last checkpoint record (-1 if none);
// records follow back to back, each ending with an 8-byte trailer that
// repeats the record's start offset.
pub const LOG_HEADER_SIZE: u64 = 8;
pub const NO_CHECKPOINT: i64 = -1;

const BEGIN_RECORD: u32 = 1;
const UPDATE_RECORD: u32 = 2;
const COMMIT_RECORD: u32 = 3;
const ABORT_RECORD: u32 = 4;
const CHECKPOINT_RECORD: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Begin {
        txn_id: TransactionID,
    },
    Update {
        txn_id: TransactionID,
        kind: FileKind,
        page_id: PageID,
        before: Box<[u8]>,
        after: Box<[u8]>,
    },
    Commit {
        txn_id: TransactionID,
    },
    Abort {
        txn_id: TransactionID,
    },
    Checkpoint {
        active: Vec<(TransactionID, u64)>,
    },
}

impl LogRecord {
    fn serialize(&self, start_offset: u64) -> Vec<u8> {
        let mut buffer = Vec::new();
        match self {
            LogRecord::Begin { txn_id } => {
                buffer.extend_from_slice(&BEGIN_RECORD.to_le_bytes());
                buffer.extend_from_slice(&txn_id.0.to_le_bytes());
            }
            LogRecord::Update {
                txn_id,
                kind,
                page_id,
                before,
                after,
            } => {
                buffer.extend_from_slice(&UPDATE_RECORD.to_le_bytes());
                buffer.extend_from_slice(&txn_id.0.to_le_bytes());
                buffer.extend_from_slice(&kind.tag().to_le_bytes());
                buffer.extend_from_slice(&page_id.table_id.0.to_le_bytes());
                buffer.extend_from_slice(&page_id.page_no.to_le_bytes());
                buffer.extend_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
                buffer.extend_from_slice(before);
                buffer.extend_from_slice(after);
            }
            LogRecord::Commit { txn_id } => {
                buffer.extend_from_slice(&COMMIT_RECORD.to_le_bytes());
                buffer.extend_from_slice(&txn_id.0.to_le_bytes());
            }
            LogRecord::Abort { txn_id } => {
                buffer.extend_from_slice(&ABORT_RECORD.to_le_bytes());
                buffer.extend_from_slice(&txn_id.0.to_le_bytes());
            }
            LogRecord::Checkpoint { active } => {
                buffer.extend_from_slice(&CHECKPOINT_RECORD.to_le_bytes());
                buffer.extend_from_slice(&(active.len() as u32).to_le_bytes());
                for (txn_id, first_offset) in active {
                    buffer.extend_from_slice(&txn_id.0.to_le_bytes());
                    buffer.extend_from_slice(&first_offset.to_le_bytes());
                }
            }
        }
        buffer.extend_from_slice(&start_offset.to_le_bytes());
        buffer
    }

    // Returns the record and the offset just past its trailer, or None when
    // the buffer ends in a torn tail from an unforced append.
    fn parse(buffer: &[u8], start: usize) -> Result<Option<(LogRecord, usize)>> {
        let Some(type_tag) = read_u32(buffer, start) else {
            return Ok(None);
        };
        let mut pos = start + 4;
        let record = match type_tag {
            BEGIN_RECORD | COMMIT_RECORD | ABORT_RECORD => {
                let Some(txn_id) = read_u64(buffer, pos) else {
                    return Ok(None);
                };
                pos += 8;
                let txn_id = TransactionID(txn_id);
                match type_tag {
                    BEGIN_RECORD => LogRecord::Begin { txn_id },
                    COMMIT_RECORD => LogRecord::Commit { txn_id },
                    _ => LogRecord::Abort { txn_id },
                }
            }
            UPDATE_RECORD => {
                if buffer.len() < pos + 8 + 16 + 2 * PAGE_SIZE {
                    return Ok(None);
                }
                let txn_id = TransactionID(read_u64(buffer, pos).unwrap());
                pos += 8;
                let kind_tag = read_u32(buffer, pos).unwrap();
                let kind = FileKind::from_tag(kind_tag)
                    .ok_or_else(|| anyhow!("unknown file kind tag {} in log", kind_tag))?;
                pos += 4;
                let table_id = TableID(read_u32(buffer, pos).unwrap());
                pos += 4;
                let page_no = read_u32(buffer, pos).unwrap();
                pos += 4;
                let page_size = read_u32(buffer, pos).unwrap() as usize;
                pos += 4;
                if page_size != PAGE_SIZE {
                    return Err(anyhow!("log update with page size {}", page_size));
                }
                let before: Box<[u8]> = buffer[pos..pos + PAGE_SIZE].into();
                pos += PAGE_SIZE;
                let after: Box<[u8]> = buffer[pos..pos + PAGE_SIZE].into();
                pos += PAGE_SIZE;
                LogRecord::Update {
                    txn_id,
                    kind,
                    page_id: PageID::new(table_id, page_no),
                    before,
                    after,
                }
            }
            CHECKPOINT_RECORD => {
                let Some(count) = read_u32(buffer, pos) else {
                    return Ok(None);
                };
                pos += 4;
                if buffer.len() < pos + count as usize * 16 {
                    return Ok(None);
                }
                let mut active = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let txn_id = TransactionID(read_u64(buffer, pos).unwrap());
                    let first_offset = read_u64(buffer, pos + 8).unwrap();
                    pos += 16;
                    active.push((txn_id, first_offset));
                }
                LogRecord::Checkpoint { active }
            }
            _ => return Err(anyhow!("unknown log record type {}", type_tag)),
        };
        let Some(trailer) = read_u64(buffer, pos) else {
            return Ok(None);
        };
        pos += 8;
        if trailer != start as u64 {
            return Err(anyhow!(
                "log trailer {} does not match record offset {}",
                trailer,
                start
            ));
        }
        Ok(Some((record, pos)))
    }
}

fn read_u32(buffer: &[u8], pos: usize) -> Option<u32> {
    let bytes: [u8; 4] = buffer.get(pos..pos + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

fn read_u64(buffer: &[u8], pos: usize) -> Option<u64> {
    let bytes: [u8; 8] = buffer.get(pos..pos + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

pub struct LogManager {
    log_file: File,
    next_offset: u64,
    last_checkpoint_offset: i64,
    // offset of each in-flight transaction's BEGIN record
    first_offset: HashMap<TransactionID, u64>,
}

impl LogManager {
    pub fn new(log_file_path: &Path) -> Result<Self> {
        let mut log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_file_path)?;
        let len = log_file.metadata()?.len();
        let last_checkpoint_offset = if len == 0 {
            log_file.write_all(&NO_CHECKPOINT.to_le_bytes())?;
            log_file.sync_all()?;
            NO_CHECKPOINT
        } else {
            let mut bytes = [0u8; 8];
            log_file.seek(SeekFrom::Start(0))?;
            log_file.read_exact(&mut bytes)?;
            i64::from_le_bytes(bytes)
        };
        let next_offset = log_file.metadata()?.len().max(LOG_HEADER_SIZE);
        Ok(Self {
            log_file,
            next_offset,
            last_checkpoint_offset,
            first_offset: HashMap::new(),
        })
    }

    pub fn log_begin(&mut self, txn_id: TransactionID) -> Result<u64> {
        let offset = self.append(&LogRecord::Begin { txn_id })?;
        self.first_offset.insert(txn_id, offset);
        Ok(offset)
    }

    pub fn log_update(
        &mut self,
        txn_id: TransactionID,
        kind: FileKind,
        page_id: PageID,
        before: &[u8],
        after: &[u8],
    ) -> Result<u64> {
        assert!(before.len() == PAGE_SIZE && after.len() == PAGE_SIZE);
        self.append(&LogRecord::Update {
            txn_id,
            kind,
            page_id,
            before: before.into(),
            after: after.into(),
        })
    }

    pub fn log_commit(&mut self, txn_id: TransactionID) -> Result<u64> {
        let offset = self.append(&LogRecord::Commit { txn_id })?;
        self.force()?;
        self.first_offset.remove(&txn_id);
        Ok(offset)
    }

    pub fn log_abort(&mut self, txn_id: TransactionID) -> Result<u64> {
        let offset = self.append(&LogRecord::Abort { txn_id })?;
        self.force()?;
        self.first_offset.remove(&txn_id);
        Ok(offset)
    }

    /// Writes a checkpoint record naming every in-flight transaction, then
    /// points the file header at it. The caller must have forced all dirty
    /// buffers first.
    pub fn log_checkpoint(&mut self) -> Result<u64> {
        let active: Vec<(TransactionID, u64)> = self
            .first_offset
            .iter()
            .map(|(&txn_id, &offset)| (txn_id, offset))
            .collect();
        let offset = self.append(&LogRecord::Checkpoint {
            active: active.clone(),
        })?;
        self.log_file.seek(SeekFrom::Start(0))?;
        self.log_file.write_all(&(offset as i64).to_le_bytes())?;
        self.last_checkpoint_offset = offset as i64;
        self.force()?;
        info!(offset, active = active.len(), "log.checkpoint");
        Ok(offset)
    }

    pub fn force(&mut self) -> Result<()> {
        self.log_file.sync_all()?;
        Ok(())
    }

    pub fn first_offset(&self, txn_id: TransactionID) -> Option<u64> {
        self.first_offset.get(&txn_id).cloned()
    }

    pub fn set_first_offset(&mut self, txn_id: TransactionID, offset: u64) {
        self.first_offset.insert(txn_id, offset);
    }

    pub fn remove_first_offset(&mut self, txn_id: TransactionID) {
        self.first_offset.remove(&txn_id);
    }

    pub fn active_transactions(&self) -> Vec<(TransactionID, u64)> {
        self.first_offset
            .iter()
            .map(|(&txn_id, &offset)| (txn_id, offset))
            .collect()
    }

    pub fn last_checkpoint_offset(&self) -> i64 {
        self.last_checkpoint_offset
    }

    pub fn records_from(&mut self, offset: u64) -> Result<Vec<(u64, LogRecord)>> {
        let mut buffer = Vec::new();
        self.log_file.seek(SeekFrom::Start(0))?;
        self.log_file.read_to_end(&mut buffer)?;
        let mut records = Vec::new();
        let mut pos = offset as usize;
        while pos < buffer.len() {
            match LogRecord::parse(&buffer, pos)? {
                Some((record, next)) => {
                    records.push((pos as u64, record));
                    pos = next;
                }
                None => break,
            }
        }
        Ok(records)
    }

    fn append(&mut self, record: &LogRecord) -> Result<u64> {
        let offset = self.next_offset;
        let bytes = record.serialize(offset);
        self.log_file.seek(SeekFrom::Start(offset))?;
        self.log_file.write_all(&bytes)?;
        self.next_offset += bytes.len() as u64;
        Ok(offset)
    }
}
