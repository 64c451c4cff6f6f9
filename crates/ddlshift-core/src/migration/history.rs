//! Migration history persistence.
//!
//! The history store is the duplicate-application guard: a plan whose
//! checksum belongs to a `COMPLETED` record is never executed again.

use super::error::MigrationError;
use super::state::{MigrationRecord, RecordStatus, StateTransition};
use parking_lot::Mutex;

/// Selects records from a history store.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    /// Only records for this scope.
    pub scope: Option<String>,
    /// Only records with this status.
    pub status: Option<RecordStatus>,
    /// Only records with this plan checksum.
    pub checksum: Option<String>,
    /// Only records applied at or after this time (microseconds since epoch).
    pub since: Option<u64>,
    /// Keep at most this many of the most recent matches.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// Match everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a scope.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Restrict to a status.
    pub fn status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to a checksum.
    pub fn checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Restrict to records applied at or after `since`.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Keep only the most recent `limit` matches.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check if a record passes every predicate.
    pub fn matches(&self, record: &MigrationRecord) -> bool {
        self.scope.as_deref().map_or(true, |s| record.scope == s)
            && self.status.map_or(true, |s| record.status == s)
            && self.checksum.as_deref().map_or(true, |c| record.checksum == c)
            && self.since.map_or(true, |t| record.applied_at >= t)
    }

    /// Apply the limit to matches given oldest first.
    fn truncate(&self, mut records: Vec<MigrationRecord>) -> Vec<MigrationRecord> {
        if let Some(limit) = self.limit {
            if records.len() > limit {
                records.drain(..records.len() - limit);
            }
        }
        records
    }
}

/// Durable store of migration records.
pub trait HistoryStore: Send + Sync {
    /// Check if a `COMPLETED` record exists for the checksum.
    fn has_applied(&self, checksum: &str) -> Result<bool, MigrationError>;

    /// Persist a new record. Record IDs are unique.
    fn record(&self, record: &MigrationRecord) -> Result<(), MigrationError>;

    /// Append a transition to an existing record (explicit rollback).
    fn append_transition(
        &self,
        record_id: &str,
        transition: StateTransition,
    ) -> Result<MigrationRecord, MigrationError>;

    /// Get a record by ID.
    fn get(&self, record_id: &str) -> Result<Option<MigrationRecord>, MigrationError>;

    /// Records matching the filter, oldest first.
    fn list(&self, filter: &HistoryFilter) -> Result<Vec<MigrationRecord>, MigrationError>;
}

/// In-memory history store.
#[derive(Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<MigrationRecord>>,
}

impl MemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn has_applied(&self, checksum: &str) -> Result<bool, MigrationError> {
        Ok(self
            .records
            .lock()
            .iter()
            .any(|r| r.checksum == checksum && r.status == RecordStatus::Completed))
    }

    fn record(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        let mut records = self.records.lock();
        if records.iter().any(|r| r.id == record.id) {
            return Err(MigrationError::Configuration(format!(
                "duplicate migration record id {}",
                record.id
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    fn append_transition(
        &self,
        record_id: &str,
        transition: StateTransition,
    ) -> Result<MigrationRecord, MigrationError> {
        let mut records = self.records.lock();
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| MigrationError::RecordNotFound {
                record_id: record_id.to_string(),
            })?;
        record.append_transition(transition)?;
        Ok(record.clone())
    }

    fn get(&self, record_id: &str) -> Result<Option<MigrationRecord>, MigrationError> {
        Ok(self.records.lock().iter().find(|r| r.id == record_id).cloned())
    }

    fn list(&self, filter: &HistoryFilter) -> Result<Vec<MigrationRecord>, MigrationError> {
        let mut matches: Vec<MigrationRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(filter.truncate(matches))
    }
}

/// History store persisted in sled.
///
/// Records live in one tree keyed by their time-ordered hex ID; a second
/// tree indexes record IDs by checksum.
pub struct SledHistoryStore {
    records: sled::Tree,
    by_checksum: sled::Tree,
}

impl SledHistoryStore {
    /// Tree name for records.
    pub const TREE_NAME: &'static str = "ddlshift:history";

    /// Tree name for the checksum index.
    pub const INDEX_TREE_NAME: &'static str = "ddlshift:history:checksum";

    /// Open or create the history trees.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        Ok(Self {
            records: db.open_tree(Self::TREE_NAME)?,
            by_checksum: db.open_tree(Self::INDEX_TREE_NAME)?,
        })
    }

    fn index_key(checksum: &str, record_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(checksum.len() + record_id.len() + 1);
        key.extend_from_slice(checksum.as_bytes());
        key.push(b':');
        key.extend_from_slice(record_id.as_bytes());
        key
    }

    fn index_prefix(checksum: &str) -> Vec<u8> {
        let mut key = checksum.as_bytes().to_vec();
        key.push(b':');
        key
    }

    /// Flush both trees to disk.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.records.flush()?;
        self.by_checksum.flush()?;
        Ok(())
    }
}

impl HistoryStore for SledHistoryStore {
    fn has_applied(&self, checksum: &str) -> Result<bool, MigrationError> {
        for entry in self.by_checksum.scan_prefix(Self::index_prefix(checksum)) {
            let (_, record_id) = entry?;
            if let Some(bytes) = self.records.get(&record_id)? {
                if MigrationRecord::from_bytes(&bytes)?.status == RecordStatus::Completed {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn record(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        let value = record.to_bytes()?;
        let inserted = self
            .records
            .compare_and_swap(record.id.as_bytes(), None as Option<&[u8]>, Some(value))?;
        if inserted.is_err() {
            return Err(MigrationError::Configuration(format!(
                "duplicate migration record id {}",
                record.id
            )));
        }
        self.by_checksum.insert(
            Self::index_key(&record.checksum, &record.id),
            record.id.as_bytes(),
        )?;
        Ok(())
    }

    fn append_transition(
        &self,
        record_id: &str,
        transition: StateTransition,
    ) -> Result<MigrationRecord, MigrationError> {
        loop {
            let current = self.records.get(record_id.as_bytes())?.ok_or_else(|| {
                MigrationError::RecordNotFound {
                    record_id: record_id.to_string(),
                }
            })?;
            let mut record = MigrationRecord::from_bytes(&current)?;
            record.append_transition(transition.clone())?;
            let updated = record.to_bytes()?;

            // Another writer may have appended in between; re-read and re-check.
            if self
                .records
                .compare_and_swap(record_id.as_bytes(), Some(current), Some(updated))?
                .is_ok()
            {
                return Ok(record);
            }
        }
    }

    fn get(&self, record_id: &str) -> Result<Option<MigrationRecord>, MigrationError> {
        match self.records.get(record_id.as_bytes())? {
            Some(bytes) => Ok(Some(MigrationRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list(&self, filter: &HistoryFilter) -> Result<Vec<MigrationRecord>, MigrationError> {
        let ids: Option<Vec<sled::IVec>> = match &filter.checksum {
            Some(checksum) => Some(
                self.by_checksum
                    .scan_prefix(Self::index_prefix(checksum))
                    .values()
                    .collect::<Result<_, _>>()?,
            ),
            None => None,
        };

        let mut matches = Vec::new();
        match ids {
            Some(ids) => {
                for id in ids {
                    if let Some(bytes) = self.records.get(&id)? {
                        let record = MigrationRecord::from_bytes(&bytes)?;
                        if filter.matches(&record) {
                            matches.push(record);
                        }
                    }
                }
                matches.sort_by(|a, b| a.id.cmp(&b.id));
            }
            None => {
                for entry in self.records.iter() {
                    let (_, bytes) = entry?;
                    let record = MigrationRecord::from_bytes(&bytes)?;
                    if filter.matches(&record) {
                        matches.push(record);
                    }
                }
            }
        }
        Ok(filter.truncate(matches))
    }
}
