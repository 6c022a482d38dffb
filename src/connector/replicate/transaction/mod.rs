//! Seams towards the transaction engine and the output stage.
//!
//! The reader core never reassembles transactions itself; it only needs to
//! know how far back the engine still reaches (for checkpointing) and
//! whether the downstream consumer is still there.

/// The transaction engine: accumulates per-transaction chunks emitted by the
/// log parser and materializes row changes at commit.
pub trait TransactionStore {
    /// The smallest redo sequence any open transaction started in, if any.
    /// The checkpoint never advances past this, so a restarted process
    /// rereads enough log to rebuild everything still in flight.
    fn min_first_sequence(&self) -> Option<u32>;

    fn open_transaction_count(&self) -> usize;

    /// One line per open transaction, logged at shutdown.
    fn describe_open(&self) -> Vec<String>;
}

/// The output stage receiving reconstructed changes. The scheduler only
/// observes whether the receiving side is still alive; a closed buffer ends
/// replication gracefully.
pub trait CommandBuffer {
    fn is_closed(&self) -> bool;
}
