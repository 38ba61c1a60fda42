use anyhow::Result;

use crate::common::PAGE_SIZE;
use crate::error::DbError;

pub const HEAP_PAGE_TYPE: u32 = 1;

const PAGE_TYPE_OFFSET: usize = 0;
const PAGE_TYPE_SIZE: usize = 4;
const LOWER_OFFSET_OFFSET: usize = PAGE_TYPE_OFFSET + PAGE_TYPE_SIZE;
const LOWER_OFFSET_SIZE: usize = 4;
const UPPER_OFFSET_OFFSET: usize = LOWER_OFFSET_OFFSET + LOWER_OFFSET_SIZE;
const UPPER_OFFSET_SIZE: usize = 4;
const HEADER_SIZE: usize = PAGE_TYPE_SIZE + LOWER_OFFSET_SIZE + UPPER_OFFSET_SIZE;
const LINE_POINTER_OFFSET_SIZE: usize = 4;
const LINE_POINTER_SIZE_SIZE: usize = 4;
const LINE_POINTER_SIZE: usize = LINE_POINTER_OFFSET_SIZE + LINE_POINTER_SIZE_SIZE;

pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - HEADER_SIZE - LINE_POINTER_SIZE;

pub fn init(data: &mut [u8]) {
    assert!(data.len() == PAGE_SIZE);
    data.fill(0);
    data[PAGE_TYPE_OFFSET..(PAGE_TYPE_OFFSET + PAGE_TYPE_SIZE)]
        .copy_from_slice(&HEAP_PAGE_TYPE.to_le_bytes());
    data[LOWER_OFFSET_OFFSET..(LOWER_OFFSET_OFFSET + LOWER_OFFSET_SIZE)]
        .copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    data[UPPER_OFFSET_OFFSET..(UPPER_OFFSET_OFFSET + UPPER_OFFSET_SIZE)]
        .copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
}

pub fn check_page_type(data: &[u8]) -> Result<()> {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[PAGE_TYPE_OFFSET..(PAGE_TYPE_OFFSET + PAGE_TYPE_SIZE)]);
    let found = u32::from_le_bytes(bytes);
    if found != HEAP_PAGE_TYPE {
        return Err(DbError::PageTypeMismatch {
            expected: HEAP_PAGE_TYPE,
            found,
        }
        .into());
    }
    Ok(())
}

pub fn insert(data: &mut [u8], tuple: &[u8]) -> Result<u32> {
    check_page_type(data)?;
    if tuple.len() > MAX_TUPLE_SIZE {
        return Err(DbError::TupleTooLarge(tuple.len()).into());
    }
    if free_space(data) < tuple.len() + LINE_POINTER_SIZE {
        return Err(DbError::PageFull.into());
    }

    let lower_offset = lower_offset(data);
    let upper_offset = upper_offset(data);
    let slot = (lower_offset as usize - HEADER_SIZE) / LINE_POINTER_SIZE;
    let next_lower_offset = lower_offset + LINE_POINTER_SIZE as u32;
    let next_upper_offset = upper_offset - tuple.len() as u32;
    data[LOWER_OFFSET_OFFSET..(LOWER_OFFSET_OFFSET + LOWER_OFFSET_SIZE)]
        .copy_from_slice(&next_lower_offset.to_le_bytes());
    data[UPPER_OFFSET_OFFSET..(UPPER_OFFSET_OFFSET + UPPER_OFFSET_SIZE)]
        .copy_from_slice(&next_upper_offset.to_le_bytes());
    data[(lower_offset as usize)..(lower_offset as usize + LINE_POINTER_OFFSET_SIZE)]
        .copy_from_slice(&next_upper_offset.to_le_bytes());
    data[((lower_offset as usize) + LINE_POINTER_OFFSET_SIZE)
        ..((lower_offset as usize) + LINE_POINTER_SIZE)]
        .copy_from_slice(&(tuple.len() as u32).to_le_bytes());
    data[(next_upper_offset as usize)..(upper_offset as usize)].copy_from_slice(tuple);

    Ok(slot as u32)
}

// Deleted slots become (0, 0) tombstones; the space is not compacted and the
// slot is never reused.
pub fn delete(data: &mut [u8], slot: u32) -> Result<()> {
    check_page_type(data)?;
    if slot as usize >= tuple_count(data) {
        return Err(anyhow::anyhow!("slot {} out of range", slot));
    }
    let offset = HEADER_SIZE + slot as usize * LINE_POINTER_SIZE;
    data[offset..(offset + LINE_POINTER_SIZE)].fill(0);
    Ok(())
}

pub fn tuple(data: &[u8], slot: u32) -> Option<Box<[u8]>> {
    if slot as usize >= tuple_count(data) {
        return None;
    }
    let size = line_pointer_size(data, slot as usize) as usize;
    if size == 0 {
        return None;
    }
    let offset = line_pointer_offset(data, slot as usize) as usize;
    Some(data[offset..(offset + size)].into())
}

pub fn tuples(data: &[u8]) -> Vec<Box<[u8]>> {
    (0..tuple_count(data) as u32)
        .filter_map(|slot| tuple(data, slot))
        .collect()
}

pub fn free_space(data: &[u8]) -> usize {
    (upper_offset(data) - lower_offset(data)) as usize
}

pub fn has_space_for(data: &[u8], tuple_len: usize) -> bool {
    free_space(data) >= tuple_len + LINE_POINTER_SIZE
}

pub fn slot_count(data: &[u8]) -> usize {
    tuple_count(data)
}

fn tuple_count(data: &[u8]) -> usize {
    (lower_offset(data) as usize - HEADER_SIZE) / LINE_POINTER_SIZE
}

fn lower_offset(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[LOWER_OFFSET_OFFSET..(LOWER_OFFSET_OFFSET + LOWER_OFFSET_SIZE)]);
    u32::from_le_bytes(bytes)
}

fn upper_offset(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[UPPER_OFFSET_OFFSET..(UPPER_OFFSET_OFFSET + UPPER_OFFSET_SIZE)]);
    u32::from_le_bytes(bytes)
}

fn line_pointer_offset(data: &[u8], index: usize) -> u32 {
    let offset = HEADER_SIZE + index * LINE_POINTER_SIZE;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..(offset + LINE_POINTER_OFFSET_SIZE)]);
    u32::from_le_bytes(bytes)
}

fn line_pointer_size(data: &[u8], index: usize) -> u32 {
    let offset = HEADER_SIZE + index * LINE_POINTER_SIZE + LINE_POINTER_OFFSET_SIZE;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..(offset + LINE_POINTER_SIZE_SIZE)]);
    u32::from_le_bytes(bytes)
}
