use anyhow::Result;
use tempfile::TempDir;

use crate::{common::TableID, instance::Instance};

pub fn setup_test_database() -> Result<(TempDir, Instance, TableID)> {
    let dir = tempfile::tempdir()?;
    let data_dir = dir.path().join("data");
    let instance = Instance::new(data_dir.to_str().unwrap(), true)?;
    let table_id = instance.create_table()?;
    Ok((dir, instance, table_id))
}
