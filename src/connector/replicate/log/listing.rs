//! Redo log inventory: which files exist, and in which order to read them.

use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::connector::replicate::log::{LogSource, RedoLog};
use crate::connector::{Connector, Error, Result, Scn};

const LOG_FILES_SQL: &str = "SELECT LF.GROUP#, LF.MEMBER FROM SYS.V_$LOGFILE LF \
     ORDER BY LF.GROUP# ASC, LF.IS_RECOVERY_DEST_FILE DESC, LF.MEMBER ASC";

const ONLINE_LOGS_SQL: &str = "SELECT L.GROUP#, L.SEQUENCE#, L.FIRST_CHANGE#, L.NEXT_CHANGE#, \
     L.STATUS FROM SYS.V_$LOG L";

const ARCHIVED_LOGS_SQL: &str = "SELECT NAME, SEQUENCE#, FIRST_CHANGE#, FIRST_TIME, \
     NEXT_CHANGE#, NEXT_TIME FROM SYS.V_$ARCHIVED_LOG \
     WHERE SEQUENCE# >= :seq AND RESETLOGS_ID = :resetlogs AND NAME IS NOT NULL \
     ORDER BY SEQUENCE#, DEST_ID";

/// Picks one readable member per group from the ordered `V$LOGFILE` rows.
/// Members of a group mirror the same bytes, so the first one that can be
/// opened stands in for the group; a group with no reachable member makes
/// the whole redo stream non-navigable.
pub(crate) fn choose_group_members(
    rows: &[(i32, String)],
    readable: impl Fn(&str) -> bool,
) -> Result<Vec<RedoLog>> {
    let mut logs = Vec::new();
    let mut i = 0;
    while i < rows.len() {
        let group = rows[i].0;
        let mut member = None;
        while i < rows.len() && rows[i].0 == group {
            if member.is_none() && readable(&rows[i].1) {
                member = Some(rows[i].1.clone());
            }
            i += 1;
        }
        match member {
            Some(member) => {
                info!("found log GROUP: {} PATH: {}", group, member);
                logs.push(RedoLog::online(group, member));
            }
            None => return Err(Error::NoReadableMember { group }),
        }
    }
    Ok(logs)
}

/// Archived logs ordered by sequence, smallest first. Rebuilt from the
/// database on every archive pass.
#[derive(Debug, Default)]
pub struct ArchiveQueue {
    heap: BinaryHeap<BySequenceMin>,
}

impl ArchiveQueue {
    pub fn new(logs: Vec<RedoLog>) -> Self {
        Self {
            heap: logs.into_iter().map(BySequenceMin).collect(),
        }
    }

    pub fn pop(&mut self) -> Option<RedoLog> {
        self.heap.pop().map(|entry| entry.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Heap entry ordered by sequence alone; handles with equal sequence are
/// interchangeable copies of the same generation.
#[derive(Debug)]
struct BySequenceMin(RedoLog);

impl PartialEq for BySequenceMin {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence == other.0.sequence
    }
}

impl Eq for BySequenceMin {}

impl PartialOrd for BySequenceMin {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BySequenceMin {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.0.sequence.cmp(&self.0.sequence)
    }
}

/// The database-backed [`LogSource`].
#[derive(Debug)]
pub struct LogCollector<'a> {
    connector: &'a mut Connector,
}

impl<'a> LogCollector<'a> {
    pub fn new(connector: &'a mut Connector) -> Self {
        Self { connector }
    }
}

impl LogSource for LogCollector<'_> {
    fn online_logs(&mut self) -> Result<Vec<RedoLog>> {
        let connection = self.connector.ensure_connected()?;
        debug!("{}", LOG_FILES_SQL);
        let rows = connection
            .query_as::<(i32, String)>(LOG_FILES_SQL, &[])?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        choose_group_members(&rows, |path| std::fs::metadata(path).is_ok())
    }

    fn refresh(&mut self, online: &mut [RedoLog]) -> Result<()> {
        let connection = self.connector.ensure_connected()?;

        debug!("{}", ONLINE_LOGS_SQL);
        let rows = match connection
            .query_as::<(i32, u32, u64, u64, String)>(ONLINE_LOGS_SQL, &[])
            .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
        {
            Ok(rows) => rows,
            Err(e) => {
                // Keep the stale view; the next pass reconnects and retries.
                error!("refreshing online log list: {}", e);
                self.connector.invalidate();
                return Ok(());
            }
        };

        let by_group: HashMap<i32, (u32, Scn, Scn, String)> = rows
            .into_iter()
            .map(|(group, sequence, first, next, status)| (group, (sequence, first, next, status)))
            .collect();

        for log in online.iter_mut() {
            let Some((sequence, first_change, next_change, status)) = by_group.get(&log.group)
            else {
                warn!("redo log group {} disappeared from V$LOG", log.group);
                continue;
            };
            log.sequence = *sequence;
            log.first_change = *first_change;
            log.next_change = (status.as_str() != "CURRENT").then_some(*next_change);
            if let Err(e) = log.reload() {
                warn!("cannot stat {}: {}", log.name, e);
            }
        }
        Ok(())
    }

    fn archived_logs(&mut self, from_sequence: u32, resetlogs: u32) -> Result<Vec<RedoLog>> {
        let connection = self.connector.ensure_connected()?;

        debug!("{}, {}, {}", ARCHIVED_LOGS_SQL, from_sequence, resetlogs);
        let listed = (|| -> std::result::Result<Vec<RedoLog>, oracle::Error> {
            let mut stmt = connection.statement(ARCHIVED_LOGS_SQL).build()?;
            stmt.bind("seq", &from_sequence)?;
            stmt.bind("resetlogs", &resetlogs)?;
            let rows = stmt.query_as::<(
                String,
                u32,
                u64,
                Option<DateTime<Utc>>,
                u64,
                Option<DateTime<Utc>>,
            )>(&[])?;

            let mut logs = Vec::new();
            for row in rows {
                let (name, sequence, first_change, first_time, next_change, _next_time) = row?;
                logs.push(RedoLog::archived(
                    name,
                    sequence,
                    first_change,
                    next_change,
                    first_time,
                ));
            }
            Ok(logs)
        })();

        match listed {
            Ok(logs) => Ok(logs),
            Err(e) => {
                // Same policy as a refresh failure: report, reconnect later,
                // let the scheduler idle until the archive is listable.
                error!("getting archived log list: {}", e);
                self.connector.invalidate();
                Ok(Vec::new())
            }
        }
    }
}
