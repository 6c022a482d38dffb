//! Durable resume position.
//!
//! One small JSON file per configured database, rewritten in full on every
//! save. The file is advisory: any IO or parse problem is logged and the
//! in-memory state stays authoritative.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::connector::replicate::transaction::TransactionStore;
use crate::connector::{ReaderState, Scn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub database: String,
    pub sequence: u32,
    pub scn: Scn,
    pub resetlogs: u32,
}

#[derive(Debug)]
pub struct Checkpoint {
    database: String,
    path: PathBuf,
    interval: Duration,
    last_saved: Instant,
}

impl Checkpoint {
    pub fn new(directory: impl Into<PathBuf>, database: &str, interval: Duration) -> Self {
        let path = directory.into().join(format!("{database}.json"));
        Self {
            database: database.to_string(),
            path,
            interval,
            last_saved: Instant::now(),
        }
    }

    /// Reads the stored position. A missing file is a cold start; a
    /// malformed file or one written for a different database is discarded
    /// with an error, never trusted.
    pub fn load(&self) -> Option<CheckpointRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no checkpoint at {}, cold start", self.path.display());
                return None;
            }
            Err(e) => {
                error!("reading checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };

        let record: CheckpointRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                error!("parsing checkpoint {}: {}", self.path.display(), e);
                return None;
            }
        };

        if record.database != self.database {
            error!(
                "checkpoint {} belongs to database {}, expected {}, discarding it",
                self.path.display(),
                record.database,
                self.database
            );
            return None;
        }

        Some(record)
    }

    /// Persists the resume position. The sequence written is the oldest
    /// first-sequence of any open transaction, so recovery rereads enough
    /// log to rebuild them; with nothing open it is the read cursor itself.
    pub fn save(
        &mut self,
        state: &ReaderState,
        transactions: &dyn TransactionStore,
        at_shutdown: bool,
    ) {
        let min_sequence = transactions
            .min_first_sequence()
            .map_or(state.sequence, |first| first.min(state.sequence));

        debug!(
            "writing checkpoint SEQ: {}/{} SCN: {}",
            min_sequence,
            state.sequence,
            state.display_scn(state.scn)
        );

        let record = CheckpointRecord {
            database: self.database.clone(),
            sequence: min_sequence,
            scn: state.scn,
            resetlogs: state.resetlogs,
        };

        match serde_json::to_string_pretty(&record) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    error!("writing checkpoint {}: {}", self.path.display(), e);
                    return;
                }
            }
            Err(e) => {
                error!("serializing checkpoint for {}: {}", self.database, e);
                return;
            }
        }

        if at_shutdown {
            info!("checkpoint at exit for {}", self.database);
            info!("- con_id: {}", state.con_id);
            info!("- sequence: {}", min_sequence);
            info!("- scn: {}", state.scn);
            info!("- resetlogs: {}", state.resetlogs);
        }

        self.last_saved = Instant::now();
    }

    /// Interval-based save, called from spots that do not advance the
    /// sequence themselves.
    pub fn maybe_save(&mut self, state: &ReaderState, transactions: &dyn TransactionStore) {
        if self.last_saved.elapsed() > self.interval {
            self.save(state, transactions, false);
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::replicate::codec::LittleEndian;

    struct OpenTransactions(Vec<u32>);

    impl TransactionStore for OpenTransactions {
        fn min_first_sequence(&self) -> Option<u32> {
            self.0.iter().copied().min()
        }

        fn open_transaction_count(&self) -> usize {
            self.0.len()
        }

        fn describe_open(&self) -> Vec<String> {
            self.0.iter().map(|seq| format!("first seq {seq}")).collect()
        }
    }

    fn state(sequence: u32) -> ReaderState {
        ReaderState {
            database: "DB1".into(),
            sequence,
            scn: 0x1234,
            resetlogs: 7,
            version: 0x12200,
            con_id: 0,
            big_endian: false,
            byte_order: &LittleEndian,
        }
    }

    #[test]
    fn exact_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(10));
        checkpoint.save(&state(100), &OpenTransactions(vec![]), false);

        let written = std::fs::read_to_string(dir.path().join("DB1.json")).unwrap();
        assert_eq!(
            written,
            "{\n  \"database\": \"DB1\",\n  \"sequence\": 100,\n  \"scn\": 4660,\n  \"resetlogs\": 7\n}"
        );
    }

    #[test]
    fn open_transactions_hold_the_sequence_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(10));
        checkpoint.save(&state(200), &OpenTransactions(vec![198, 195]), false);

        let record = checkpoint.load().unwrap();
        assert_eq!(record.sequence, 195);
        assert_eq!(record.scn, 0x1234);
        assert_eq!(record.resetlogs, 7);
    }

    #[test]
    fn missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(10));
        assert!(checkpoint.load().is_none());
    }

    #[test]
    fn malformed_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("DB1.json"), "{not json").unwrap();
        let checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(10));
        assert!(checkpoint.load().is_none());
    }

    #[test]
    fn foreign_database_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(10));
        checkpoint.save(&state(100), &OpenTransactions(vec![]), false);

        let other = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(10));
        assert!(other.load().is_some());

        std::fs::rename(dir.path().join("DB1.json"), dir.path().join("DB2.json")).unwrap();
        let mismatched = Checkpoint::new(dir.path(), "DB2", Duration::from_secs(10));
        assert!(mismatched.load().is_none());
    }

    #[test]
    fn tolerates_reformatted_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("DB1.json"),
            "{\"scn\":9,\"resetlogs\":1,\"database\":\"DB1\",\"sequence\":4}",
        )
        .unwrap();
        let checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(10));
        let record = checkpoint.load().unwrap();
        assert_eq!(record.sequence, 4);
        assert_eq!(record.scn, 9);
    }

    #[test]
    fn interval_gates_maybe_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::from_secs(3600));
        checkpoint.maybe_save(&state(100), &OpenTransactions(vec![]));
        assert!(checkpoint.load().is_none());

        let mut checkpoint = Checkpoint::new(dir.path(), "DB1", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        checkpoint.maybe_save(&state(100), &OpenTransactions(vec![]));
        assert_eq!(checkpoint.load().unwrap().sequence, 100);
    }
}
