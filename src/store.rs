//! Attribute cache persistence.
//!
//! The engine hands every saved cache to a [`CacheStore`] collaborator and
//! rebuilds from it on reconnect. All requests are fire-and-forget: the
//! store reports completion by posting [`StoreMsg`] messages back to the
//! engine, keyed by the connection id that issued the request. Records move
//! in bounded batches in both directions; a load round that is not the last
//! completes with [`Status::More`](crate::att::Status::More) and the engine
//! requests the next round with an advanced record index.
//!
//! Any store failure during a load makes the engine fall back to live
//! discovery. That fallback is the contract: a store may fail any request
//! and the worst outcome is a slower reconnect.

use crate::att::Status;
use crate::cache::CacheRecord;
use crate::le::Addr;
use crate::transport::ConnId;

/// Number of records exchanged with the store per round.
pub const BATCH_RECORDS: usize = 10;

/// Current record format version. A store must fail a load whose persisted
/// version differs.
pub const FORMAT_VERSION: u8 = 1;

/// Completion messages posted back by a [`CacheStore`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum StoreMsg {
    Opened {
        conn: ConnId,
        status: Status,
    },
    /// One load round. `status` is `More` when further rounds remain, `Ok`
    /// for the final round, or an error.
    Loaded {
        conn: ConnId,
        status: Status,
        recs: Vec<CacheRecord>,
    },
    Saved {
        conn: ConnId,
        status: Status,
    },
}

/// Destination for store completion messages. Implemented by the pump
/// [`Handle`](crate::client::Handle), which feeds them back into the
/// engine.
pub trait StoreSink: Send + Sync {
    fn complete(&self, msg: StoreMsg);
}

/// Non-volatile cache storage owned by the integrator.
///
/// `open`, `load`, and `save` must each produce exactly one completion
/// message; `close` and `reset` complete silently. The engine runs at most
/// one load or save sequence per peer at a time. When the driving
/// connection is lost it closes the sequence early, so a `close` may
/// arrive while an `open` or `load` is still outstanding; the completion
/// for that request is then ignored.
pub trait CacheStore: Send + Sync {
    /// Opens the record set for `peer`. `write` selects between a load
    /// (false) and a save that replaces any previous contents (true).
    fn open(&self, conn: ConnId, peer: Addr, write: bool);

    /// Requests the load round starting at record `index`.
    fn load(&self, conn: ConnId, peer: Addr, index: u16);

    /// Appends one batch of records starting at `index`. `last` marks the
    /// final batch; the store must not commit before it.
    fn save(&self, conn: ConnId, peer: Addr, index: u16, recs: Vec<CacheRecord>, last: bool);

    /// Closes the record set opened for `peer`.
    fn close(&self, conn: ConnId, peer: Addr);

    /// Discards all persisted records for `peer`. May be called without a
    /// prior `open` and must be idempotent.
    fn reset(&self, peer: Addr);
}
