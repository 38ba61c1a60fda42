use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use tracing::warn;

use crate::common::{PageID, TransactionID};
use crate::error::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockTable {
    shared: HashMap<PageID, HashSet<TransactionID>>,
    exclusive: HashMap<PageID, TransactionID>,
    // txn -> set of txns it is currently blocked on
    wait_for: HashMap<TransactionID, HashSet<TransactionID>>,
    started_at: HashMap<TransactionID, Instant>,
    pages_by_txn: HashMap<TransactionID, HashSet<PageID>>,
}

impl LockTable {
    fn blockers(&self, txn_id: TransactionID, page_id: PageID, mode: LockMode) -> Vec<TransactionID> {
        if let Some(&holder) = self.exclusive.get(&page_id) {
            if holder != txn_id {
                return vec![holder];
            }
            return vec![];
        }
        if mode == LockMode::Exclusive {
            if let Some(holders) = self.shared.get(&page_id) {
                return holders.iter().cloned().filter(|&t| t != txn_id).collect();
            }
        }
        vec![]
    }

    fn grant(&mut self, txn_id: TransactionID, page_id: PageID, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.entry(page_id).or_default().insert(txn_id);
            }
            LockMode::Exclusive => {
                if let Some(holders) = self.shared.get_mut(&page_id) {
                    holders.remove(&txn_id);
                }
                self.exclusive.insert(page_id, txn_id);
            }
        }
        self.pages_by_txn.entry(txn_id).or_default().insert(page_id);
        self.wait_for.remove(&txn_id);
    }

    // BFS over the wait-for graph starting from the requester; a path back
    // to the requester is a cycle.
    fn has_cycle_from(&self, start: TransactionID) -> bool {
        let mut queue: VecDeque<TransactionID> = match self.wait_for.get(&start) {
            Some(targets) => targets.iter().cloned().collect(),
            None => return false,
        };
        let mut visited = HashSet::new();
        while let Some(txn_id) = queue.pop_front() {
            if txn_id == start {
                return true;
            }
            if visited.insert(txn_id) {
                if let Some(targets) = self.wait_for.get(&txn_id) {
                    queue.extend(targets.iter().cloned());
                }
            }
        }
        false
    }
}

pub struct LockManager {
    table: Mutex<LockTable>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            timeout,
        }
    }

    /// Records the start timestamp used for the acquisition timeout. Called
    /// at transaction begin; acquisitions by unregistered transactions start
    /// their clock at first contact.
    pub fn register(&self, txn_id: TransactionID) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.started_at.entry(txn_id).or_insert_with(Instant::now);
    }

    pub fn acquire(&self, txn_id: TransactionID, page_id: PageID, mode: LockMode) -> Result<()> {
        loop {
            {
                let mut table = self
                    .table
                    .lock()
                    .map_err(|_| anyhow!("lock table poisoned"))?;
                // An exclusive lock subsumes any request by its holder; a
                // shared request by an existing shared holder is a no-op.
                if table.exclusive.get(&page_id) == Some(&txn_id) {
                    return Ok(());
                }
                if mode == LockMode::Shared
                    && table
                        .shared
                        .get(&page_id)
                        .map_or(false, |holders| holders.contains(&txn_id))
                {
                    return Ok(());
                }
                let blockers = table.blockers(txn_id, page_id, mode);
                if blockers.is_empty() {
                    table.grant(txn_id, page_id, mode);
                    return Ok(());
                }

                let started_at = *table
                    .started_at
                    .entry(txn_id)
                    .or_insert_with(Instant::now);
                let edges = table.wait_for.entry(txn_id).or_default();
                edges.clear();
                edges.extend(blockers);

                if table.has_cycle_from(txn_id) {
                    // The requester is the victim; dropping its edges breaks
                    // the cycle for every other participant.
                    table.wait_for.remove(&txn_id);
                    warn!(txn = txn_id.0, page = ?page_id, "lock.deadlock_victim");
                    return Err(DbError::TransactionAborted.into());
                }
                if started_at.elapsed() > self.timeout {
                    table.wait_for.remove(&txn_id);
                    warn!(txn = txn_id.0, page = ?page_id, "lock.timeout");
                    return Err(DbError::TransactionAborted.into());
                }
            }
            thread::yield_now();
        }
    }

    pub fn release(&self, txn_id: TransactionID, page_id: PageID) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        Self::release_one(&mut table, txn_id, page_id);
        if let Some(pages) = table.pages_by_txn.get_mut(&txn_id) {
            pages.remove(&page_id);
        }
    }

    pub fn release_all(&self, txn_id: TransactionID) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pages) = table.pages_by_txn.remove(&txn_id) {
            for page_id in pages {
                Self::release_one(&mut table, txn_id, page_id);
            }
        }
        table.wait_for.remove(&txn_id);
        for targets in table.wait_for.values_mut() {
            targets.remove(&txn_id);
        }
        table.started_at.remove(&txn_id);
    }

    pub fn holds(&self, txn_id: TransactionID, page_id: PageID) -> bool {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.exclusive.get(&page_id) == Some(&txn_id) {
            return true;
        }
        table
            .shared
            .get(&page_id)
            .map_or(false, |holders| holders.contains(&txn_id))
    }

    pub fn locked_pages(&self, txn_id: TransactionID) -> Vec<PageID> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .pages_by_txn
            .get(&txn_id)
            .map(|pages| pages.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn release_one(table: &mut LockTable, txn_id: TransactionID, page_id: PageID) {
        if table.exclusive.get(&page_id) == Some(&txn_id) {
            table.exclusive.remove(&page_id);
        }
        if let Some(holders) = table.shared.get_mut(&page_id) {
            holders.remove(&txn_id);
            if holders.is_empty() {
                table.shared.remove(&page_id);
            }
        }
    }
}
