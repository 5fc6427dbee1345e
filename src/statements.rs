//! Per-connection prepared-statement cache.
//!
//! A two-metric bounded LRU: entry count and summed SQL byte size. Borrowing
//! removes the entry from the cache (so it cannot be evicted mid-execution);
//! releasing puts it back and bumps its recency. Evicted entries queue a
//! server-side Close that the executor drains before its next Sync.

use std::collections::VecDeque;

use lru::LruCache;
use log::debug;

use crate::query::{FieldDescription, NativeQuery};

/// Cache key: the statement identity the driver layer sees. The same SQL
/// text under a different escape-processing mode, or with a different
/// generated-column projection, prepares to a different server statement
/// and must not share a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    pub sql: String,
    pub escape_processing: bool,
    pub returning_columns: Vec<String>,
}

impl StatementKey {
    pub fn new(sql: &str, escape_processing: bool, returning_columns: &[String]) -> StatementKey {
        // Sorted so the key ignores the order the caller listed columns in.
        let mut returning_columns = returning_columns.to_vec();
        returning_columns.sort_unstable();
        StatementKey {
            sql: sql.into(),
            escape_processing,
            returning_columns,
        }
    }

    pub fn for_query(query: &NativeQuery) -> StatementKey {
        StatementKey::new(
            &query.sql,
            query.escape_processing,
            &query.returning_columns,
        )
    }

    fn weight(&self) -> usize {
        self.sql.len() + self.returning_columns.iter().map(|c| c.len()).sum::<usize>()
    }
}

/// Server-side state of one prepared statement.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub key: StatementKey,
    /// Server-assigned name; empty for the unnamed one-shot statement.
    pub name: String,
    /// Parameter OID signature as last prepared.
    pub param_oids: Vec<u32>,
    /// Row description captured from the last Describe.
    pub fields: Option<Vec<FieldDescription>>,
    pub portal_described: bool,
    /// Whether Parse has completed on the server under the current epoch.
    pub prepared: bool,
    pub epoch: u64,
}

impl PreparedStatement {
    pub fn new(key: StatementKey, name: String, epoch: u64) -> PreparedStatement {
        PreparedStatement {
            key,
            name,
            param_oids: Vec::new(),
            fields: None,
            portal_described: false,
            prepared: false,
            epoch,
        }
    }

    pub fn is_oneshot(&self) -> bool {
        self.name.is_empty()
    }

    /// Parse must be re-sent when the statement was never prepared, the epoch
    /// moved underneath it, or the caller's parameter signature changed.
    pub fn needs_parse(&self, current_epoch: u64, param_oids: &[u32]) -> bool {
        !self.prepared || self.epoch != current_epoch || self.param_oids != param_oids
    }
}

#[derive(Debug)]
pub struct StatementCache {
    entries: LruCache<StatementKey, PreparedStatement>,
    max_entries: usize,
    max_bytes: usize,
    current_bytes: usize,
    epoch: u64,
    /// Server-side names whose Close message is still owed to the server.
    pending_closes: VecDeque<String>,
}

impl StatementCache {
    pub fn new(max_entries: usize, max_bytes: usize) -> StatementCache {
        StatementCache {
            entries: LruCache::unbounded(),
            max_entries: max_entries.max(1),
            max_bytes: max_bytes.max(1),
            current_bytes: 0,
            epoch: 0,
            pending_closes: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Invalidate every server-side plan. Entries stay cached; their stale
    /// epoch forces a re-Parse on the next borrow.
    pub fn bump_epoch(&mut self) {
        self.epoch += 1;
        debug!("Statement cache epoch bumped to {}", self.epoch);
    }

    /// Take an entry out for execution, bumping it to most-recent standing.
    /// A stale-epoch entry comes back unprepared and stamped with the current
    /// epoch, so the executor transparently re-parses it.
    pub fn borrow(&mut self, key: &StatementKey) -> Option<PreparedStatement> {
        let mut entry = self.entries.pop(key)?;
        self.current_bytes -= entry.key.weight();
        if entry.epoch != self.epoch {
            entry.prepared = false;
            entry.portal_described = false;
            entry.fields = None;
            entry.epoch = self.epoch;
        }
        Some(entry)
    }

    /// Return a borrowed entry, or insert a fresh one. Evicts least-recent
    /// entries until both bounds hold; each eviction owes the server a Close.
    pub fn put(&mut self, entry: PreparedStatement) {
        self.current_bytes += entry.key.weight();
        self.entries.put(entry.key.clone(), entry);

        while self.entries.len() > self.max_entries || self.current_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((key, evicted)) => {
                    self.current_bytes -= key.weight();
                    if evicted.prepared && !evicted.name.is_empty() {
                        debug!("Evicting prepared statement {}", evicted.name);
                        self.pending_closes.push_back(evicted.name);
                    }
                }
                None => break,
            }
        }
    }

    /// Queue a Close for a statement discarded outside the eviction path.
    pub fn queue_close(&mut self, name: String) {
        if !name.is_empty() {
            self.pending_closes.push_back(name);
        }
    }

    /// Drain the server-side names owed a Close message.
    pub fn take_pending_closes(&mut self) -> Vec<String> {
        self.pending_closes.drain(..).collect()
    }

    /// Forget every entry without closing server-side names; used after the
    /// server itself reported DEALLOCATE/DISCARD ALL.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_bytes = 0;
        self.pending_closes.clear();
    }
}
