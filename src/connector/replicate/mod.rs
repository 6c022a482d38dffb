//! The replication scheduler: decides which redo log file to read next.
//!
//! One thread, one loop. Online logs are preferred as long as the expected
//! generation is still among them; once the database has moved past it the
//! archived copies take over. An online log overwritten mid-read is resumed
//! from its archived copy with the parser's in-flight state carried across.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// `::log` disambiguates the logging facade from the `log` submodule below.
use ::log::{error, info, trace};

use crate::connector::catalog::Catalog;
use crate::connector::checkpoint::Checkpoint;
use crate::connector::replicate::log::listing::ArchiveQueue;
use crate::connector::replicate::log::{LogReader, LogSource, ProcessOutcome, ResumeState};
use crate::connector::replicate::transaction::{CommandBuffer, TransactionStore};
use crate::connector::{Error, ReaderState, Result};

pub mod codec;
pub mod log;
pub mod transaction;

/// In-flight state rescued from an online handle whose log was overwritten,
/// waiting to be seeded into the matching archived handle.
struct SwitchedLog {
    sequence: u32,
    resume: Option<Box<dyn ResumeState>>,
}

pub struct Replicator<'a, S: LogSource, R: LogReader> {
    pub state: &'a mut ReaderState,
    pub source: S,
    pub reader: &'a mut R,
    pub transactions: &'a dyn TransactionStore,
    pub output: &'a dyn CommandBuffer,
    pub catalog: &'a Catalog,
    pub checkpoint: &'a mut Checkpoint,
    pub redo_read_sleep: Duration,
    pub shutdown: Arc<AtomicBool>,
}

impl<S: LogSource, R: LogReader> Replicator<'_, S, R> {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed) || self.output.is_closed()
    }

    /// Runs until shutdown or a fatal error. Always writes a final
    /// checkpoint and dumps open-transaction diagnostics on the way out.
    pub fn run(mut self) -> Result<()> {
        let result = self.run_inner();

        self.checkpoint.save(self.state, self.transactions, true);
        let open = self.transactions.open_transaction_count();
        if open > 0 {
            info!("transactions open at shutdown: {}", open);
            for line in self.transactions.describe_open() {
                info!("{}", line);
            }
        }

        result
    }

    fn run_inner(&mut self) -> Result<()> {
        let mut online = self.source.online_logs()?;
        let mut switched: Option<SwitchedLog> = None;

        'outer: loop {
            let mut logs_processed = false;

            if self.stopping() {
                break;
            }
            trace!(target: "redo", "checking online redo logs");
            self.source.refresh(&mut online)?;

            // Keep consuming online logs while the expected generation is
            // among them.
            'online: loop {
                trace!(
                    target: "redo",
                    "searching online redo log for sequence: {}",
                    self.state.sequence
                );
                let mut candidate = None;
                loop {
                    let mut has_higher = false;
                    for (idx, log) in online.iter().enumerate() {
                        trace!(target: "redo", "{} is {}", log.name, log.sequence);
                        if log.sequence == self.state.sequence {
                            candidate = Some(idx);
                        } else if log.sequence > self.state.sequence {
                            has_higher = true;
                        }
                    }
                    if candidate.is_some() || has_higher {
                        break;
                    }
                    // Nothing new yet; wait for the database to write more.
                    if self.stopping() {
                        break 'outer;
                    }
                    std::thread::sleep(self.redo_read_sleep);
                    self.source.refresh(&mut online)?;
                }

                let Some(idx) = candidate else {
                    // The expected log was already recycled; its copy has to
                    // come from the archive.
                    break 'online;
                };

                if self.stopping() {
                    break 'outer;
                }
                logs_processed = true;
                let log = &mut online[idx];
                match self.reader.process(log, self.state, self.catalog)? {
                    ProcessOutcome::Processed => {
                        self.state.sequence += 1;
                        self.checkpoint.save(self.state, self.transactions, false);
                    }
                    ProcessOutcome::SequenceSwitched => {
                        info!(
                            "online redo log {} overwritten by new data, continuing from archive",
                            log.name
                        );
                        switched = Some(SwitchedLog {
                            sequence: log.sequence,
                            resume: log.clone_resume_state(),
                        });
                        log.clear_resume_state();
                        break 'online;
                    }
                }
                if self.stopping() {
                    break 'outer;
                }
            }

            if self.stopping() {
                break;
            }
            trace!(target: "redo", "checking archived redo logs");
            let mut queue = ArchiveQueue::new(
                self.source
                    .archived_logs(self.state.sequence, self.state.resetlogs)?,
            );

            while let Some(mut redo) = queue.pop() {
                trace!(
                    target: "redo",
                    "searching archived redo log for sequence: {}",
                    self.state.sequence
                );
                if let Some(prev) = switched.as_ref() {
                    if prev.sequence == redo.sequence {
                        info!(
                            "continuing broken online redo read of sequence {} from {}",
                            redo.sequence, redo.name
                        );
                        if let Some(resume) = prev.resume.as_ref() {
                            redo.set_resume_state(resume.clone_box());
                        }
                    }
                }

                if redo.sequence < self.state.sequence {
                    continue;
                }
                if redo.sequence > self.state.sequence {
                    error!(
                        "could not find archive log for sequence: {}, found: {} instead",
                        self.state.sequence, redo.sequence
                    );
                    return Err(Error::SequenceGap {
                        expected: self.state.sequence,
                        found: redo.sequence,
                    });
                }

                if self.stopping() {
                    break 'outer;
                }
                logs_processed = true;
                match self.reader.process(&mut redo, self.state, self.catalog)? {
                    ProcessOutcome::Processed => {}
                    // Archives are sealed; a switch signal here means the
                    // file is not what the database said it was.
                    ProcessOutcome::SequenceSwitched => {
                        return Err(Error::LogProcessing {
                            name: redo.name,
                            message: "archived log reported a sequence switch".into(),
                        });
                    }
                }

                switched = None;
                self.state.sequence += 1;
                self.checkpoint.save(self.state, self.transactions, false);
            }

            if self.stopping() {
                break;
            }
            self.checkpoint.maybe_save(self.state, self.transactions);
            if !logs_processed {
                std::thread::sleep(self.redo_read_sleep);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::collections::VecDeque;

    use super::*;
    use crate::connector::replicate::codec::LittleEndian;
    use crate::connector::replicate::log::RedoLog;

    fn test_state(sequence: u32) -> ReaderState {
        ReaderState {
            database: "TESTDB".into(),
            sequence,
            scn: 5000,
            resetlogs: 3,
            version: 0x12200,
            con_id: 0,
            big_endian: false,
            byte_order: &LittleEndian,
        }
    }

    fn online_log(group: i32, sequence: u32) -> RedoLog {
        let mut log = RedoLog::online(group, format!("/redo/group{group}.log"));
        log.sequence = sequence;
        log
    }

    fn archived_log(sequence: u32) -> RedoLog {
        RedoLog::archived(format!("/arch/seq{sequence}.arc"), sequence, 0, 0, None)
    }

    struct NoTransactions;

    impl TransactionStore for NoTransactions {
        fn min_first_sequence(&self) -> Option<u32> {
            None
        }

        fn open_transaction_count(&self) -> usize {
            0
        }

        fn describe_open(&self) -> Vec<String> {
            vec![]
        }
    }

    struct OpenOutput;

    impl CommandBuffer for OpenOutput {
        fn is_closed(&self) -> bool {
            false
        }
    }

    /// Serves a scripted inventory; flips the shutdown flag after a
    /// configured number of refreshes so idle tests terminate.
    struct ScriptedSource {
        online: Vec<(i32, u32)>,
        archived: Vec<u32>,
        refreshes_before_shutdown: Option<usize>,
        refresh_count: usize,
        shutdown: Arc<AtomicBool>,
    }

    impl LogSource for ScriptedSource {
        fn online_logs(&mut self) -> Result<Vec<RedoLog>> {
            Ok(self
                .online
                .iter()
                .map(|(group, sequence)| online_log(*group, *sequence))
                .collect())
        }

        fn refresh(&mut self, online: &mut [RedoLog]) -> Result<()> {
            self.refresh_count += 1;
            if let Some(limit) = self.refreshes_before_shutdown {
                if self.refresh_count > limit {
                    self.shutdown.store(true, Ordering::Relaxed);
                }
            }
            for (log, (_, sequence)) in online.iter_mut().zip(self.online.iter()) {
                log.sequence = *sequence;
            }
            Ok(())
        }

        fn archived_logs(&mut self, from_sequence: u32, _resetlogs: u32) -> Result<Vec<RedoLog>> {
            Ok(self
                .archived
                .iter()
                .filter(|sequence| **sequence >= from_sequence)
                .map(|sequence| archived_log(*sequence))
                .collect())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Cursor(u64);

    impl ResumeState for Cursor {
        fn clone_box(&self) -> Box<dyn ResumeState> {
            Box::new(self.clone())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Replays a scripted list of outcomes and records every log it was
    /// handed, flipping shutdown when the script runs dry.
    struct ScriptedReader {
        script: VecDeque<ProcessOutcome>,
        seen: Vec<(String, u32, bool, Option<Cursor>)>,
        stash_cursor: Option<u64>,
        shutdown: Arc<AtomicBool>,
    }

    impl ScriptedReader {
        fn new(script: Vec<ProcessOutcome>, shutdown: Arc<AtomicBool>) -> Self {
            Self {
                script: script.into(),
                seen: Vec::new(),
                stash_cursor: None,
                shutdown,
            }
        }
    }

    impl LogReader for ScriptedReader {
        fn process(
            &mut self,
            log: &mut RedoLog,
            _state: &ReaderState,
            _catalog: &Catalog,
        ) -> Result<ProcessOutcome> {
            let resume = log
                .resume_state()
                .and_then(|state| state.as_any().downcast_ref::<Cursor>())
                .cloned();
            self.seen
                .push((log.name.clone(), log.sequence, log.is_archived(), resume));

            let Some(outcome) = self.script.pop_front() else {
                self.shutdown.store(true, Ordering::Relaxed);
                return Ok(ProcessOutcome::Processed);
            };
            if outcome == ProcessOutcome::SequenceSwitched {
                if let Some(cursor) = self.stash_cursor {
                    log.set_resume_state(Box::new(Cursor(cursor)));
                }
            }
            if self.script.is_empty() {
                self.shutdown.store(true, Ordering::Relaxed);
            }
            Ok(outcome)
        }
    }

    struct Fixture {
        state: ReaderState,
        catalog: Catalog,
        checkpoint: Checkpoint,
        shutdown: Arc<AtomicBool>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(sequence: u32) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let checkpoint = Checkpoint::new(dir.path(), "TESTDB", Duration::from_secs(3600));
            Self {
                state: test_state(sequence),
                catalog: Catalog::new(),
                checkpoint,
                shutdown: Arc::new(AtomicBool::new(false)),
                _dir: dir,
            }
        }

        fn run(
            &mut self,
            source: ScriptedSource,
            reader: &mut ScriptedReader,
        ) -> Result<()> {
            Replicator {
                state: &mut self.state,
                source,
                reader,
                transactions: &NoTransactions,
                output: &OpenOutput,
                catalog: &self.catalog,
                checkpoint: &mut self.checkpoint,
                redo_read_sleep: Duration::from_millis(1),
                shutdown: self.shutdown.clone(),
            }
            .run()
        }

        fn source(&self, online: Vec<(i32, u32)>, archived: Vec<u32>) -> ScriptedSource {
            ScriptedSource {
                online,
                archived,
                refreshes_before_shutdown: None,
                refresh_count: 0,
                shutdown: self.shutdown.clone(),
            }
        }

        fn stored_sequence(&self) -> u32 {
            self.checkpoint.load().unwrap().sequence
        }
    }

    #[test]
    fn steady_state_consumes_online_log_and_checkpoints() {
        let mut fixture = Fixture::new(100);
        let source = fixture.source(vec![(1, 100), (2, 101)], vec![]);
        let mut reader = ScriptedReader::new(vec![ProcessOutcome::Processed], fixture.shutdown.clone());

        fixture.run(source, &mut reader).unwrap();

        assert_eq!(fixture.state.sequence, 101);
        assert!(fixture.stored_sequence() >= 100);
        assert_eq!(reader.seen[0].1, 100);
        assert!(!reader.seen[0].2, "first log must come from the online set");
    }

    #[test]
    fn overwritten_online_log_resumes_from_archive_with_state() {
        let mut fixture = Fixture::new(100);
        let source = fixture.source(vec![(1, 100)], vec![100]);
        let mut reader = ScriptedReader::new(
            vec![ProcessOutcome::SequenceSwitched, ProcessOutcome::Processed],
            fixture.shutdown.clone(),
        );
        reader.stash_cursor = Some(0xBEEF);

        fixture.run(source, &mut reader).unwrap();

        assert_eq!(fixture.state.sequence, 101);
        assert_eq!(reader.seen.len(), 2);

        let (_, sequence, archived, resume) = &reader.seen[1];
        assert_eq!(*sequence, 100);
        assert!(*archived, "the retry must come from the archive");
        assert_eq!(
            resume.as_ref(),
            Some(&Cursor(0xBEEF)),
            "in-flight parser state must survive the handoff"
        );
    }

    #[test]
    fn missing_archived_generation_is_fatal() {
        let mut fixture = Fixture::new(50);
        // The online logs have moved on and the archive starts at 60: the
        // generations in between are gone.
        let source = fixture.source(vec![(1, 60), (2, 61)], vec![60, 61]);
        let mut reader = ScriptedReader::new(vec![], fixture.shutdown.clone());

        let result = fixture.run(source, &mut reader);

        match result {
            Err(Error::SequenceGap {
                expected: 50,
                found: 60,
            }) => {}
            other => panic!("expected a sequence gap, got {other:?}"),
        }
        assert!(reader.seen.is_empty(), "nothing must be dispatched across a gap");
    }

    #[test]
    fn idle_reader_waits_without_progress() {
        let mut fixture = Fixture::new(100);
        let mut source = fixture.source(vec![(1, 98), (2, 99)], vec![]);
        source.refreshes_before_shutdown = Some(3);
        let mut reader = ScriptedReader::new(vec![], fixture.shutdown.clone());

        fixture.run(source, &mut reader).unwrap();

        assert_eq!(fixture.state.sequence, 100, "no progress while idle");
        assert!(reader.seen.is_empty(), "nothing to process while idle");
        // Only the shutdown checkpoint is on disk, still at the old cursor.
        assert_eq!(fixture.stored_sequence(), 100);
    }

    #[test]
    fn duplicate_archived_copies_are_dropped() {
        let mut fixture = Fixture::new(101);
        // The same generation archived to two destinations: one copy is
        // read, the other is already behind the cursor and dropped.
        let source = fixture.source(vec![(1, 103)], vec![101, 101]);
        let mut reader = ScriptedReader::new(vec![ProcessOutcome::Processed], fixture.shutdown.clone());

        fixture.run(source, &mut reader).unwrap();

        assert_eq!(fixture.state.sequence, 102);
        assert_eq!(reader.seen.len(), 1);
        assert_eq!(reader.seen[0].1, 101);
    }

    #[test]
    fn closed_output_stops_the_loop() {
        struct ClosedOutput;
        impl CommandBuffer for ClosedOutput {
            fn is_closed(&self) -> bool {
                true
            }
        }

        let mut fixture = Fixture::new(100);
        let source = fixture.source(vec![(1, 100)], vec![]);
        let mut reader = ScriptedReader::new(vec![ProcessOutcome::Processed], fixture.shutdown.clone());

        let result = Replicator {
            state: &mut fixture.state,
            source,
            reader: &mut reader,
            transactions: &NoTransactions,
            output: &ClosedOutput,
            catalog: &fixture.catalog,
            checkpoint: &mut fixture.checkpoint,
            redo_read_sleep: Duration::from_millis(1),
            shutdown: fixture.shutdown.clone(),
        }
        .run();

        result.unwrap();
        assert!(reader.seen.is_empty(), "a closed output must stop dispatch");
    }

    #[test]
    fn checkpoint_reflects_open_transactions() {
        struct TwoOpen;
        impl TransactionStore for TwoOpen {
            fn min_first_sequence(&self) -> Option<u32> {
                Some(195)
            }

            fn open_transaction_count(&self) -> usize {
                2
            }

            fn describe_open(&self) -> Vec<String> {
                vec!["xid 1 first seq 195".into(), "xid 2 first seq 198".into()]
            }
        }

        let mut fixture = Fixture::new(200);
        fixture
            .checkpoint
            .save(&fixture.state, &TwoOpen, false);
        assert_eq!(fixture.stored_sequence(), 195);
    }

    // The sequence advance + checkpoint order guarantees the stored value
    // never runs ahead of what was fully read.
    #[test]
    fn checkpoint_never_exceeds_consumed_sequence() {
        let mut fixture = Fixture::new(100);
        let source = fixture.source(vec![(1, 100), (2, 101), (3, 102)], vec![]);
        let mut reader = ScriptedReader::new(
            vec![ProcessOutcome::Processed, ProcessOutcome::Processed],
            fixture.shutdown.clone(),
        );

        fixture.run(source, &mut reader).unwrap();

        assert_eq!(fixture.state.sequence, 102);
        assert!(fixture.stored_sequence() <= fixture.state.sequence);
    }
}
