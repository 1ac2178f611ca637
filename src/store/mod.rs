//! Local store interface consumed by the replication service
//!
//! The primary and secondary sides are both built around a pre-opened local
//! store with the same on-disk transaction log format. The service only ever
//! touches stores through the narrow `Storage` (and optionally
//! `BlobStorage`) interface below; `FileStore` is the concrete
//! implementation shipped with this crate.

pub mod filelog;
pub mod format;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::errors::{ReplicationError, ReplicationResult};
use crate::types::{Oid, Tid, TransactionMeta};

pub use filelog::FileStore;

/// Marker prefix identifying a data payload as a large-object reference.
/// The object bytes live in the blob area; the payload after the marker is
/// the blob's committed size in decimal ASCII.
pub const BLOB_MARKER: &[u8; 8] = b"%BLOBREF";

/// Whether a record payload refers to a blob rather than carrying the data.
pub fn is_blob_record(data: &[u8]) -> bool {
    data.len() >= BLOB_MARKER.len() && &data[..BLOB_MARKER.len()] == BLOB_MARKER
}

/// Read-only snapshot of the writer's log file state.
///
/// The iterator opens the log file independently of the writer and compares
/// `generation` on each resume; a pack bumps the generation, telling the
/// iterator to reopen and reposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSnapshot {
    pub path: PathBuf,
    pub generation: u64,
    pub append_pos: u64,
}

/// The narrow store interface the replication service consumes.
///
/// Commit protocol: `tpc_begin` opens a pending transaction described by a
/// `TransactionMeta` (a zero TID asks the store to allocate one at finish),
/// `store`/`restore` buffer data records, `tpc_vote` validates, and
/// `tpc_finish` appends the transaction to the log atomically, returning
/// the committed TID. `tpc_abort` discards pending state.
pub trait Storage: Send + Sync {
    fn name(&self) -> String;
    fn last_transaction(&self) -> Tid;
    fn log_snapshot(&self) -> LogSnapshot;

    /// Current data and commit TID for an object.
    fn load(&self, oid: Oid) -> ReplicationResult<(Vec<u8>, Tid)>;
    /// Most recent revision committed strictly before `tid`, with the TID
    /// of the following revision when one exists.
    fn load_before(
        &self,
        oid: Oid,
        tid: Tid,
    ) -> ReplicationResult<Option<(Vec<u8>, Tid, Option<Tid>)>>;
    /// The exact revision committed at `serial`.
    fn load_serial(&self, oid: Oid, serial: Tid) -> ReplicationResult<Vec<u8>>;

    fn new_oid(&self) -> ReplicationResult<Oid>;
    fn store(&self, oid: Oid, data: &[u8]) -> ReplicationResult<()>;
    fn restore(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
    ) -> ReplicationResult<()>;

    fn tpc_begin(&self, meta: &TransactionMeta) -> ReplicationResult<()>;
    fn tpc_vote(&self) -> ReplicationResult<()>;
    fn tpc_finish(&self) -> ReplicationResult<Tid>;
    fn tpc_abort(&self) -> ReplicationResult<()>;

    /// Discard non-current object revisions committed before `before`.
    /// Invalidates log file handle identity.
    fn pack(&self, before: Tid) -> ReplicationResult<()>;

    fn close(&self) -> ReplicationResult<()>;

    /// Blob capability advertisement; `Some` for blob-capable stores.
    fn blobs(&self) -> Option<&dyn BlobStorage> {
        None
    }
}

/// Extension interface for stores that keep large objects outside the log.
pub trait BlobStorage: Send + Sync {
    /// Path of the committed blob file for `(oid, tid)`.
    fn load_blob(&self, oid: Oid, tid: Tid) -> ReplicationResult<PathBuf>;
    /// Directory for spooling inbound blob data before restore.
    fn temporary_directory(&self) -> PathBuf;
    /// Buffer a blob record in the pending transaction; `blob_path` is
    /// moved into the blob area at finish.
    fn restore_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        blob_path: &Path,
        prev_txn: Option<Tid>,
    ) -> ReplicationResult<()>;
    /// Store a new blob within the current (primary-side) transaction.
    fn store_blob(&self, oid: Oid, data: &[u8], blob_path: &Path) -> ReplicationResult<()>;
}

/// Read-only facade presented by a secondary.
///
/// Public mutators are rejected; the replication automaton applies inbound
/// transactions through the wrapped store directly, bypassing the facade.
pub struct ReadOnlyStore {
    inner: Arc<dyn Storage>,
}

impl ReadOnlyStore {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self { inner }
    }
}

impl Storage for ReadOnlyStore {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn last_transaction(&self) -> Tid {
        self.inner.last_transaction()
    }

    fn log_snapshot(&self) -> LogSnapshot {
        self.inner.log_snapshot()
    }

    fn load(&self, oid: Oid) -> ReplicationResult<(Vec<u8>, Tid)> {
        self.inner.load(oid)
    }

    fn load_before(
        &self,
        oid: Oid,
        tid: Tid,
    ) -> ReplicationResult<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        self.inner.load_before(oid, tid)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> ReplicationResult<Vec<u8>> {
        self.inner.load_serial(oid, serial)
    }

    fn new_oid(&self) -> ReplicationResult<Oid> {
        Err(ReplicationError::ReadOnly)
    }

    fn store(&self, _oid: Oid, _data: &[u8]) -> ReplicationResult<()> {
        Err(ReplicationError::ReadOnly)
    }

    fn restore(
        &self,
        _oid: Oid,
        _serial: Tid,
        _data: Option<&[u8]>,
        _prev_txn: Option<Tid>,
    ) -> ReplicationResult<()> {
        Err(ReplicationError::ReadOnly)
    }

    fn tpc_begin(&self, _meta: &TransactionMeta) -> ReplicationResult<()> {
        Err(ReplicationError::ReadOnly)
    }

    fn tpc_vote(&self) -> ReplicationResult<()> {
        Err(ReplicationError::ReadOnly)
    }

    fn tpc_finish(&self) -> ReplicationResult<Tid> {
        Err(ReplicationError::ReadOnly)
    }

    fn tpc_abort(&self) -> ReplicationResult<()> {
        Err(ReplicationError::ReadOnly)
    }

    fn pack(&self, before: Tid) -> ReplicationResult<()> {
        self.inner.pack(before)
    }

    fn close(&self) -> ReplicationResult<()> {
        self.inner.close()
    }

    fn blobs(&self) -> Option<&dyn BlobStorage> {
        self.inner.blobs()
    }
}
