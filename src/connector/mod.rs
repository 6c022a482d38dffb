use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use oracle::Connection;

use crate::connector::replicate::codec::RedoByteOrder;

pub mod bootstrap;
pub mod catalog;
pub mod checkpoint;
pub mod replicate;

/// System change number, the database-wide logical clock.
pub type Scn = u64;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("oracle error: {0}")]
    Oracle(Arc<oracle::Error>),
    #[error("database not in ARCHIVELOG mode")]
    NotArchiveLog,
    #[error("supplemental log data not enabled")]
    NoSupplementalLog,
    #[error(
        "incorrect database incarnation, checkpoint resetlogs {checkpoint}, database resetlogs {current}"
    )]
    IncarnationMismatch { checkpoint: u32, current: u32 },
    #[error("cannot read any member of redo log group {group}")]
    NoReadableMember { group: i32 },
    #[error("missing archived log for sequence {expected}, found {found} instead")]
    SequenceGap { expected: u32, found: u32 },
    #[error("cannot interpret dictionary value: {0}")]
    BadDictionaryValue(String),
    #[error("redo log {name}: {message}")]
    LogProcessing { name: String, message: String },
    #[error("shutdown requested")]
    Shutdown,
}

impl From<oracle::Error> for Error {
    fn from(value: oracle::Error) -> Self {
        Self::Oracle(Arc::new(value))
    }
}

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A lazy database session. The connection is established on first use and
/// re-established with a fixed backoff after it is invalidated; only a
/// shutdown request breaks the retry loop.
pub struct Connector {
    database: String,
    username: String,
    password: String,
    connect_string: String,
    connection: Option<Connection>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("connect_string", &self.connect_string)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl Connector {
    pub fn new(
        database: String,
        username: String,
        password: String,
        connect_string: String,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            database,
            username,
            password,
            connect_string,
            connection: None,
            shutdown,
        }
    }

    pub fn ensure_connected(&mut self) -> Result<&Connection> {
        while self.connection.is_none() {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(Error::Shutdown);
            }
            info!("connecting to Oracle database {}", self.database);
            match Connection::connect(&self.username, &self.password, &self.connect_string) {
                Ok(connection) => self.connection = Some(connection),
                Err(e) => {
                    error!(
                        "cannot connect to database {}, retry in {} sec: {}",
                        self.database,
                        RECONNECT_DELAY.as_secs(),
                        e
                    );
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
        match self.connection.as_ref() {
            Some(connection) => Ok(connection),
            None => Err(Error::Shutdown),
        }
    }

    /// Drops the cached connection so the next call reconnects.
    pub fn invalidate(&mut self) {
        self.connection = None;
    }

    pub fn database(&self) -> &str {
        &self.database
    }
}

/// Process-lifetime reader state, owned by the replication entry point and
/// passed by reference into bootstrap and the scheduler.
#[derive(Debug)]
pub struct ReaderState {
    /// Logical database name, the checkpoint filename stem.
    pub database: String,
    /// The next redo log generation the scheduler expects to consume.
    pub sequence: u32,
    /// Last persisted commit position.
    pub scn: Scn,
    /// Database incarnation identifier.
    pub resetlogs: u32,
    /// Server version, packed as hex digits (12.2 is 0x12200).
    pub version: u32,
    /// Container id, 0 on pre-multitenant servers.
    pub con_id: u32,
    pub big_endian: bool,
    pub byte_order: &'static dyn RedoByteOrder,
}

impl ReaderState {
    /// SCN rendering follows the server version: 48 bits before 12.2,
    /// 64 bits from there on.
    pub fn display_scn(&self, scn: Scn) -> String {
        if self.version >= 0x12200 {
            format!("0x{:016x}", scn)
        } else {
            format!("0x{:04x}.{:08x}", scn >> 32, scn & 0xFFFF_FFFF)
        }
    }
}
