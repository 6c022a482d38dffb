use std::any::Any;
use std::fmt::Debug;

use chrono::{DateTime, Utc};

use crate::connector::catalog::Catalog;
use crate::connector::{ReaderState, Result, Scn};

pub mod listing;

/// A single redo log file known to the scheduler.
///
/// Online members keep their handle for the process lifetime; archived
/// handles live only until their log is fully consumed. A handle is owned by
/// exactly one collection, never shared between the online set and the
/// archive queue.
#[derive(Debug)]
pub struct RedoLog {
    /// Redo group number, >= 1 for online members, 0 for archived logs.
    pub group: i32,
    /// File path of the chosen member.
    pub name: String,
    /// Generation number this file holds.
    pub sequence: u32,
    pub first_change: Scn,
    /// `None` while the log is still being written.
    pub next_change: Option<Scn>,
    pub first_time: Option<DateTime<Utc>>,
    pub file_size: u64,
    resume: Option<Box<dyn ResumeState>>,
}

impl RedoLog {
    pub fn online(group: i32, name: String) -> Self {
        Self {
            group,
            name,
            sequence: 0,
            first_change: 0,
            next_change: None,
            first_time: None,
            file_size: 0,
            resume: None,
        }
    }

    pub fn archived(
        name: String,
        sequence: u32,
        first_change: Scn,
        next_change: Scn,
        first_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            group: 0,
            name,
            sequence,
            first_change,
            next_change: Some(next_change),
            first_time,
            file_size: 0,
            resume: None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.group == 0
    }

    /// Re-stats the file so the parser sees growth of the active log.
    pub fn reload(&mut self) -> std::io::Result<()> {
        self.file_size = std::fs::metadata(&self.name)?.len();
        Ok(())
    }

    pub fn resume_state(&self) -> Option<&dyn ResumeState> {
        self.resume.as_deref()
    }

    pub fn set_resume_state(&mut self, state: Box<dyn ResumeState>) {
        self.resume = Some(state);
    }

    pub fn clone_resume_state(&self) -> Option<Box<dyn ResumeState>> {
        self.resume.as_ref().map(|state| state.clone_box())
    }

    pub fn clear_resume_state(&mut self) {
        self.resume = None;
    }
}

/// In-flight parser state stashed on a [`RedoLog`] between `process` calls:
/// file offset, partially reassembled records, whatever the parser needs to
/// continue mid-log. Cloned (not aliased) across the overwrite handoff from
/// an online handle to its archived copy.
pub trait ResumeState: Debug + Send {
    fn clone_box(&self) -> Box<dyn ResumeState>;
    fn as_any(&self) -> &dyn Any;
}

/// What a `process` call did with the log it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The log was read to its end (or, for the active online log, the
    /// database switched away from it after we caught up).
    Processed,
    /// The online log was recycled and overwritten while being read; the
    /// same sequence must be re-read from its archived copy.
    SequenceSwitched,
}

/// The external redo record parser. Given an opened log handle it walks the
/// physical records, calling back into the codec (`state.byte_order`) and
/// the catalog, and leaves its in-flight state on the handle.
pub trait LogReader {
    fn process(
        &mut self,
        log: &mut RedoLog,
        state: &ReaderState,
        catalog: &Catalog,
    ) -> Result<ProcessOutcome>;
}

/// Where the scheduler learns which log files exist. Implemented against the
/// database by [`listing::LogCollector`] and by in-memory fakes in tests.
pub trait LogSource {
    /// Enumerates the online groups, choosing one readable member per group.
    /// Called once at startup; the set is never resized afterwards.
    fn online_logs(&mut self) -> Result<Vec<RedoLog>>;

    /// Re-stamps sequence numbers and SCN ranges onto the fixed online set.
    fn refresh(&mut self, online: &mut [RedoLog]) -> Result<()>;

    /// Archived logs with `sequence >= from_sequence` in the given
    /// incarnation, ordered by sequence.
    fn archived_logs(&mut self, from_sequence: u32, resetlogs: u32) -> Result<Vec<RedoLog>>;
}
