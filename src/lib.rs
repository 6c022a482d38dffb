//! Change-data-capture reader core for Oracle redo logs.
//!
//! The reader mines the redo stream directly: it schedules online and
//! archived log files in generation order, keeps a durable resume
//! checkpoint, selects the endian-aware binary codec the parser decodes
//! with, and bootstraps the table catalog from the data dictionary. Record
//! parsing, transaction reassembly and the output stage are supplied by the
//! caller through the [`LogReader`], [`TransactionStore`] and
//! [`CommandBuffer`] traits.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Deserialize;

pub mod connector;

pub use connector::catalog::{Catalog, Column, Table};
pub use connector::checkpoint::{Checkpoint, CheckpointRecord};
pub use connector::replicate::codec::{byte_order_for, BigEndian, LittleEndian, RedoByteOrder};
pub use connector::replicate::log::listing::{ArchiveQueue, LogCollector};
pub use connector::replicate::log::{LogReader, LogSource, ProcessOutcome, RedoLog, ResumeState};
pub use connector::replicate::transaction::{CommandBuffer, TransactionStore};
pub use connector::replicate::Replicator;
pub use connector::{Connector, Error, ReaderState, Result, Scn};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OracleReaderConfig {
    /// Logical database name; also the checkpoint filename stem.
    pub database: String,
    pub user: String,
    pub password: String,
    /// `host:port/service` connect string.
    pub connect_string: String,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Microseconds to sleep when no new redo is available.
    #[serde(default = "default_redo_read_sleep_us")]
    pub redo_read_sleep_us: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// Dictionary patterns (`OWNER.NAME`, SQL `LIKE` syntax) selecting the
    /// tables to replicate.
    #[serde(default)]
    pub tables: Vec<TableSelector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSelector {
    pub pattern: String,
    #[serde(default)]
    pub options: u64,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_redo_read_sleep_us() -> u64 {
    10_000
}

fn default_checkpoint_interval_secs() -> u64 {
    10
}

/// The reader: owns the catalog and the shutdown flag, and drives
/// bootstrap plus the replication loop on the calling thread.
#[derive(Debug)]
pub struct OracleReader {
    config: OracleReaderConfig,
    catalog: Arc<Catalog>,
    shutdown: Arc<AtomicBool>,
}

impl OracleReader {
    pub fn new(config: OracleReaderConfig) -> Self {
        Self {
            config,
            catalog: Arc::new(Catalog::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that stops the reader from another thread. The loop
    /// polls it at every step; blocking waits are bounded by the redo read
    /// sleep and the connect backoff.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// The table catalog, shared with downstream row decoding.
    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.clone()
    }

    /// Connects, verifies the database, warms up the catalog and runs the
    /// scheduler until shutdown or a fatal error. A shutdown raised while
    /// waiting for the database is a clean exit.
    pub fn start<R: LogReader>(
        &mut self,
        reader: &mut R,
        transactions: &dyn TransactionStore,
        output: &dyn CommandBuffer,
    ) -> Result<()> {
        let result = self.start_inner(reader, transactions, output);
        match result {
            Err(Error::Shutdown) => Ok(()),
            other => other,
        }
    }

    fn start_inner<R: LogReader>(
        &mut self,
        reader: &mut R,
        transactions: &dyn TransactionStore,
        output: &dyn CommandBuffer,
    ) -> Result<()> {
        let mut connector = Connector::new(
            self.config.database.clone(),
            self.config.user.clone(),
            self.config.password.clone(),
            self.config.connect_string.clone(),
            self.shutdown.clone(),
        );

        let mut checkpoint = Checkpoint::new(
            self.config.checkpoint_dir.clone(),
            &self.config.database,
            Duration::from_secs(self.config.checkpoint_interval_secs),
        );

        let mut state =
            connector::bootstrap::bootstrap(&mut connector, &self.config.database, &checkpoint)?;
        info!("Oracle reader for: {}", self.config.database);

        for selector in &self.config.tables {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Shutdown);
            }
            self.catalog
                .add_tables_matching(&mut connector, &selector.pattern, selector.options);
        }

        Replicator {
            state: &mut state,
            source: LogCollector::new(&mut connector),
            reader,
            transactions,
            output,
            catalog: &self.catalog,
            checkpoint: &mut checkpoint,
            redo_read_sleep: Duration::from_micros(self.config.redo_read_sleep_us),
            shutdown: self.shutdown.clone(),
        }
        .run()
    }
}
