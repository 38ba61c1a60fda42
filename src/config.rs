use std::time::Duration;

/// Startup tunables for a database instance. Page size is a process-wide
/// constant and is not configurable here.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of pages cached by the buffer pool.
    pub pool_size: usize,
    /// How long a lock acquisition may block before the transaction is
    /// aborted.
    pub lock_timeout: Duration,
    /// Name of the write-ahead log file inside the database directory.
    pub log_file_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 50,
            lock_timeout: Duration::from_secs(30),
            log_file_name: "wal.log".to_string(),
        }
    }
}
