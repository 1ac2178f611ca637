//! Append-only file store
//!
//! `FileStore` owns a directory containing the transaction log (`data.log`)
//! and, for blob-capable stores, a blob area (`blobs/`) plus a spool
//! directory (`tmp/`). The log layout is defined in [`format`](super::format).
//!
//! Commits are two-phase: the transaction is appended with status `c`
//! (in-progress), flushed, and only then is the status byte patched to its
//! final value and the new append position published. A reader that observes
//! the `c` status or a missing trailer simply waits; it never sees a partial
//! transaction as committed.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::errors::{ReplicationError, ReplicationResult};
use crate::store::format::{
    self, DATA_HEADER_LEN, DATA_START, MAGIC, TRAILER_LEN,
};
use crate::store::{BlobStorage, LogSnapshot, Storage};
use crate::types::{DataRecord, Oid, Tid, TransactionMeta, TxnStatus};

const LOG_FILE_NAME: &str = "data.log";
const BLOB_DIR_NAME: &str = "blobs";
const TMP_DIR_NAME: &str = "tmp";

/// One committed revision of an object.
#[derive(Debug, Clone, Copy)]
struct Revision {
    tid: Tid,
    /// Offset of the data payload in the log file
    pos: u64,
    dlen: u32,
}

struct PendingTxn {
    meta: TransactionMeta,
    records: Vec<DataRecord>,
    /// Spooled blob files to move into the blob area at finish
    blobs: Vec<(Oid, PathBuf)>,
    voted: bool,
}

struct StoreState {
    file: File,
    append_pos: u64,
    last_tid: Tid,
    generation: u64,
    next_oid: u64,
    /// Per-object history, ascending TID order
    index: HashMap<Oid, Vec<Revision>>,
    pending: Option<PendingTxn>,
    closed: bool,
}

pub struct FileStore {
    dir: PathBuf,
    log_path: PathBuf,
    blob_dir: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open (creating if necessary) a store without a blob area.
    pub fn open(dir: impl AsRef<Path>) -> ReplicationResult<Self> {
        Self::open_inner(dir.as_ref(), false)
    }

    /// Open (creating if necessary) a blob-capable store.
    pub fn open_with_blobs(dir: impl AsRef<Path>) -> ReplicationResult<Self> {
        Self::open_inner(dir.as_ref(), true)
    }

    fn open_inner(dir: &Path, blobs: bool) -> ReplicationResult<Self> {
        fs::create_dir_all(dir)?;
        let log_path = dir.join(LOG_FILE_NAME);
        let blob_dir = if blobs {
            let blob_dir = dir.join(BLOB_DIR_NAME);
            fs::create_dir_all(&blob_dir)?;
            fs::create_dir_all(dir.join(TMP_DIR_NAME))?;
            Some(blob_dir)
        } else {
            None
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&log_path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(MAGIC)?;
            file.flush()?;
        } else {
            let mut magic = [0u8; 4];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if &magic != MAGIC {
                return Err(ReplicationError::storage(format!(
                    "{} is not a transaction log",
                    log_path.display()
                )));
            }
        }

        let scan = scan_log(&mut file, &log_path)?;
        let store = Self {
            dir: dir.to_path_buf(),
            log_path,
            blob_dir,
            state: Mutex::new(StoreState {
                file,
                append_pos: scan.append_pos,
                last_tid: scan.last_tid,
                generation: 0,
                next_oid: scan.max_oid + 1,
                index: scan.index,
                pending: None,
                closed: false,
            }),
        };
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // Mutex poisoning only happens if a holder panicked; the state is
        // still consistent for read paths, so recover the guard.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_tid(state: &StoreState) -> Tid {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let candidate = ms << 16;
        let last = state.last_tid.as_u64();
        Tid::from_u64(candidate.max(last + 1))
    }

    fn blob_path(&self, oid: Oid, tid: Tid) -> ReplicationResult<PathBuf> {
        let blob_dir = self
            .blob_dir
            .as_ref()
            .ok_or_else(|| ReplicationError::storage("store has no blob area"))?;
        Ok(blob_dir.join(oid.to_string()).join(format!("{tid}.blob")))
    }

    fn find_revision(
        state: &StoreState,
        oid: Oid,
    ) -> ReplicationResult<Revision> {
        state
            .index
            .get(&oid)
            .and_then(|revs| revs.last())
            .copied()
            .ok_or_else(|| ReplicationError::storage(format!("no such object {oid}")))
    }

    fn read_payload(state: &mut StoreState, rev: Revision) -> ReplicationResult<Vec<u8>> {
        if rev.dlen == 0 {
            return Err(ReplicationError::storage("record has no data"));
        }
        let mut payload = vec![0u8; rev.dlen as usize];
        state.file.seek(SeekFrom::Start(rev.pos))?;
        state.file.read_exact(&mut payload)?;
        Ok(payload)
    }
}

struct ScanResult {
    append_pos: u64,
    last_tid: Tid,
    max_oid: u64,
    index: HashMap<Oid, Vec<Revision>>,
}

/// Rebuild the in-memory state by walking the log. An unfinished tail
/// (missing trailer or in-progress status) is truncated away.
fn scan_log(file: &mut File, path: &Path) -> ReplicationResult<ScanResult> {
    let mut pos = DATA_START;
    let mut last_tid = Tid::ZERO;
    let mut max_oid = 0u64;
    let mut index: HashMap<Oid, Vec<Revision>> = HashMap::new();

    loop {
        let header = match format::read_txn_header(file, pos)? {
            Some(header) => header,
            None => break,
        };
        let trailer = format::read_trailer(file, pos + header.tlen)?;
        if header.status == b'c' || trailer != Some(header.tlen) {
            warn!(
                "{} has an unfinished transaction at {}; truncating",
                path.display(),
                pos
            );
            file.set_len(pos)?;
            break;
        }
        if header.status != b'u' {
            let records = format::read_data_records(
                file,
                pos,
                pos + header.header_len(),
                pos + header.tlen,
                header.tid,
            )?;
            let mut rpos = pos + header.header_len();
            for record in &records {
                let dlen = record.data.as_ref().map_or(0, |d| d.len() as u32);
                index.entry(record.oid).or_default().push(Revision {
                    tid: header.tid,
                    pos: rpos + DATA_HEADER_LEN,
                    dlen,
                });
                max_oid = max_oid.max(record.oid.as_u64());
                rpos += DATA_HEADER_LEN + dlen as u64;
            }
        }
        last_tid = header.tid;
        pos += header.tlen + TRAILER_LEN;
    }

    Ok(ScanResult {
        append_pos: pos,
        last_tid,
        max_oid,
        index,
    })
}

impl Storage for FileStore {
    fn name(&self) -> String {
        self.dir.display().to_string()
    }

    fn last_transaction(&self) -> Tid {
        self.lock().last_tid
    }

    fn log_snapshot(&self) -> LogSnapshot {
        let state = self.lock();
        LogSnapshot {
            path: self.log_path.clone(),
            generation: state.generation,
            append_pos: state.append_pos,
        }
    }

    fn load(&self, oid: Oid) -> ReplicationResult<(Vec<u8>, Tid)> {
        let mut state = self.lock();
        let rev = Self::find_revision(&state, oid)?;
        let payload = Self::read_payload(&mut state, rev)?;
        Ok((payload, rev.tid))
    }

    fn load_before(
        &self,
        oid: Oid,
        tid: Tid,
    ) -> ReplicationResult<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        let mut state = self.lock();
        let revs = match state.index.get(&oid) {
            Some(revs) => revs.clone(),
            None => return Err(ReplicationError::storage(format!("no such object {oid}"))),
        };
        let at = match revs.iter().rposition(|r| r.tid < tid) {
            Some(at) => at,
            None => return Ok(None),
        };
        let next = revs.get(at + 1).map(|r| r.tid);
        let payload = Self::read_payload(&mut state, revs[at])?;
        Ok(Some((payload, revs[at].tid, next)))
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> ReplicationResult<Vec<u8>> {
        let mut state = self.lock();
        let rev = state
            .index
            .get(&oid)
            .and_then(|revs| revs.iter().find(|r| r.tid == serial))
            .copied()
            .ok_or_else(|| {
                ReplicationError::storage(format!("no revision {serial} of object {oid}"))
            })?;
        Self::read_payload(&mut state, rev)
    }

    fn new_oid(&self) -> ReplicationResult<Oid> {
        let mut state = self.lock();
        if state.closed {
            return Err(ReplicationError::storage("store is closed"));
        }
        let oid = Oid::from_u64(state.next_oid);
        state.next_oid += 1;
        Ok(oid)
    }

    fn store(&self, oid: Oid, data: &[u8]) -> ReplicationResult<()> {
        let mut state = self.lock();
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| ReplicationError::storage("no transaction in progress"))?;
        pending.records.push(DataRecord {
            oid,
            tid: pending.meta.tid,
            version: String::new(),
            data: Some(data.to_vec()),
            prev_txn: None,
        });
        Ok(())
    }

    fn restore(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
    ) -> ReplicationResult<()> {
        let mut state = self.lock();
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| ReplicationError::storage("no transaction in progress"))?;
        pending.records.push(DataRecord {
            oid,
            tid: serial,
            version: String::new(),
            data: data.map(|d| d.to_vec()),
            prev_txn,
        });
        Ok(())
    }

    fn tpc_begin(&self, meta: &TransactionMeta) -> ReplicationResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(ReplicationError::storage("store is closed"));
        }
        if state.pending.is_some() {
            return Err(ReplicationError::storage("transaction already in progress"));
        }
        if !meta.tid.is_zero() && meta.tid <= state.last_tid {
            return Err(ReplicationError::storage(format!(
                "transaction id {} does not advance the log (last {})",
                meta.tid, state.last_tid
            )));
        }
        state.pending = Some(PendingTxn {
            meta: meta.clone(),
            records: Vec::new(),
            blobs: Vec::new(),
            voted: false,
        });
        Ok(())
    }

    fn tpc_vote(&self) -> ReplicationResult<()> {
        let mut state = self.lock();
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| ReplicationError::storage("no transaction in progress"))?;
        pending.voted = true;
        Ok(())
    }

    fn tpc_finish(&self) -> ReplicationResult<Tid> {
        let mut state = self.lock();
        let mut pending = state
            .pending
            .take()
            .ok_or_else(|| ReplicationError::storage("no transaction in progress"))?;
        if !pending.voted {
            state.pending = Some(pending);
            return Err(ReplicationError::storage("transaction was not voted"));
        }

        let tid = if pending.meta.tid.is_zero() {
            Self::allocate_tid(&state)
        } else {
            pending.meta.tid
        };
        pending.meta.tid = tid;
        for record in &mut pending.records {
            if record.tid.is_zero() {
                record.tid = tid;
            }
        }

        let mut meta = pending.meta.clone();
        let final_status = meta.status;
        meta.status = TxnStatus::Checkpoint;
        let (bytes, status_offset) = format::encode_transaction(&meta, &pending.records);

        let pos = state.append_pos;
        state.file.seek(SeekFrom::Start(pos))?;
        state.file.write_all(&bytes)?;
        state.file.sync_data()?;

        // Blob files become visible before the commit is finalized; an
        // aborted finish leaves orphans, never dangling references.
        for (oid, spool) in &pending.blobs {
            let target = self.blob_path(*oid, tid)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(spool, &target)?;
        }

        state.file.seek(SeekFrom::Start(pos + status_offset as u64))?;
        state.file.write_all(&[final_status.as_byte()])?;
        state.file.sync_data()?;

        let header_len = {
            let ext_len = if meta.extension.is_empty() {
                0
            } else {
                serde_json::to_vec(&meta.extension).unwrap_or_default().len()
            };
            format::TXN_HEADER_LEN
                + meta.user.len() as u64
                + meta.description.len() as u64
                + ext_len as u64
        };
        let mut rpos = pos + header_len;
        for record in &pending.records {
            let dlen = record.data.as_ref().map_or(0, |d| d.len() as u32);
            state.index.entry(record.oid).or_default().push(Revision {
                tid,
                pos: rpos + DATA_HEADER_LEN,
                dlen,
            });
            state.next_oid = state.next_oid.max(record.oid.as_u64() + 1);
            rpos += DATA_HEADER_LEN + dlen as u64;
        }

        state.append_pos = pos + (bytes.len() as u64);
        state.last_tid = tid;
        Ok(tid)
    }

    fn tpc_abort(&self) -> ReplicationResult<()> {
        let mut state = self.lock();
        if let Some(pending) = state.pending.take() {
            for (_, spool) in pending.blobs {
                let _ = fs::remove_file(spool);
            }
        }
        Ok(())
    }

    fn pack(&self, before: Tid) -> ReplicationResult<()> {
        let mut state = self.lock();
        if state.pending.is_some() {
            return Err(ReplicationError::storage("cannot pack during a commit"));
        }
        info!("Packing {} before {}", self.log_path.display(), before);

        // Revisions that survive: each object's most recent revision at or
        // before the pack point, plus everything after it.
        let mut keep: HashMap<Oid, Vec<Tid>> = HashMap::new();
        for (oid, revs) in &state.index {
            let mut kept: Vec<Tid> = revs.iter().filter(|r| r.tid > before).map(|r| r.tid).collect();
            if let Some(current) = revs.iter().rev().find(|r| r.tid <= before) {
                kept.push(current.tid);
            }
            keep.insert(*oid, kept);
        }

        let tmp_path = self.log_path.with_extension("pack");
        let mut out = File::create(&tmp_path)?;
        out.write_all(MAGIC)?;

        let mut pos = DATA_START;
        loop {
            let header = match format::read_txn_header(&mut state.file, pos)? {
                Some(header) => header,
                None => break,
            };
            let tend = pos + header.tlen;
            if header.status != b'u' {
                let status = TxnStatus::from_byte(header.status).unwrap_or(TxnStatus::Normal);
                let meta =
                    format::read_txn_meta(&mut state.file, pos, &header, status)?;
                let records = format::read_data_records(
                    &mut state.file,
                    pos,
                    pos + header.header_len(),
                    tend,
                    header.tid,
                )?;
                let surviving: Vec<DataRecord> = records
                    .into_iter()
                    .filter(|r| {
                        keep.get(&r.oid)
                            .map(|tids| tids.contains(&header.tid))
                            .unwrap_or(false)
                    })
                    .collect();
                if !surviving.is_empty() {
                    let mut meta = meta;
                    if meta.tid <= before {
                        meta.status = TxnStatus::Packed;
                    }
                    let (bytes, _) = format::encode_transaction(&meta, &surviving);
                    out.write_all(&bytes)?;
                }
            }
            pos = tend + TRAILER_LEN;
        }
        out.sync_all()?;
        drop(out);

        fs::rename(&tmp_path, &self.log_path)?;
        let mut file = OpenOptions::new().read(true).write(true).open(&self.log_path)?;
        let scan = scan_log(&mut file, &self.log_path)?;
        state.file = file;
        state.append_pos = scan.append_pos;
        state.index = scan.index;
        state.generation += 1;
        Ok(())
    }

    fn close(&self) -> ReplicationResult<()> {
        let mut state = self.lock();
        if !state.closed {
            state.closed = true;
            state.file.sync_all()?;
            info!("Closed store {}", self.dir.display());
        }
        Ok(())
    }

    fn blobs(&self) -> Option<&dyn BlobStorage> {
        if self.blob_dir.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl BlobStorage for FileStore {
    fn load_blob(&self, oid: Oid, tid: Tid) -> ReplicationResult<PathBuf> {
        let path = self.blob_path(oid, tid)?;
        if !path.exists() {
            return Err(ReplicationError::storage(format!(
                "no blob for {oid} at {tid}"
            )));
        }
        Ok(path)
    }

    fn temporary_directory(&self) -> PathBuf {
        self.dir.join(TMP_DIR_NAME)
    }

    fn restore_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        blob_path: &Path,
        prev_txn: Option<Tid>,
    ) -> ReplicationResult<()> {
        let mut state = self.lock();
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| ReplicationError::storage("no transaction in progress"))?;
        pending.records.push(DataRecord {
            oid,
            tid: serial,
            version: String::new(),
            data: data.map(|d| d.to_vec()),
            prev_txn,
        });
        pending.blobs.push((oid, blob_path.to_path_buf()));
        Ok(())
    }

    fn store_blob(&self, oid: Oid, data: &[u8], blob_path: &Path) -> ReplicationResult<()> {
        let mut state = self.lock();
        let pending = state
            .pending
            .as_mut()
            .ok_or_else(|| ReplicationError::storage("no transaction in progress"))?;
        pending.records.push(DataRecord {
            oid,
            tid: pending.meta.tid,
            version: String::new(),
            data: Some(data.to_vec()),
            prev_txn: None,
        });
        pending.blobs.push((oid, blob_path.to_path_buf()));
        Ok(())
    }
}
