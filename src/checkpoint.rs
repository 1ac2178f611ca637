//! Checkpoint log: on-disk capture of the replication stream
//!
//! A destination directory holds a sequence of append-only files whose
//! names are the 16 lowercase hex digits of the last committed TID at the
//! time each file was created. Each record is
//! `u32_be(L) || type(1) || body(L-1) || u32_be(L)`; the trailing length
//! makes a reverse scan possible, so reopening walks the newest file
//! backward from EOF and truncates anything after the last `C` record.
//!
//! Record types mirror the wire protocol: `T`, `S` and `B` carry the
//! control-message body (tag stripped), `d` a raw data payload, `b` one
//! blob block, and `C` the 8-byte TID of the completed transaction. The
//! `Recorder` is a secondary variant that captures the stream instead of
//! applying it; `replay` reissues the captured operations against another
//! store to rebuild a replica.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{ReplicationError, ReplicationResult};
use crate::primary::PROTO_CURRENT;
use crate::secondary::{verify_checksum, ClientHandle, SecondaryOptions, StreamConsumer};
use crate::store::Storage;
use crate::types::{Message, Oid, Tid};

/// Default rotation threshold: 500 MiB.
pub const DEFAULT_ROTATE_SIZE: u64 = 500 * (1 << 20);

const RECORD_OVERHEAD: u64 = 8; // leading + trailing length

fn readlen(file: &mut File, pos: u64) -> ReplicationResult<u32> {
    file.seek(SeekFrom::Start(pos))?;
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Step backward over the record ending at `pos`; returns the record's
/// start position and its type byte.
fn readback(file: &mut File, pos: u64) -> ReplicationResult<(u64, u8)> {
    if pos < 4 {
        return Err(ReplicationError::corrupted(pos, "record trailer underruns the file"));
    }
    let l = readlen(file, pos - 4)? as u64;
    if l + RECORD_OVERHEAD > pos {
        return Err(ReplicationError::corrupted(pos, "record length underruns the file"));
    }
    let start = pos - l - RECORD_OVERHEAD;
    let leading = readlen(file, start)? as u64;
    if leading != l {
        return Err(ReplicationError::corrupted(start, "record length fields disagree"));
    }
    let mut mtype = [0u8; 1];
    file.read_exact(&mut mtype)?;
    Ok((start, mtype[0]))
}

fn is_log_name(name: &str) -> bool {
    name.len() == 16 && name.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn log_file_names(destination: &Path) -> ReplicationResult<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(destination)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if is_log_name(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

struct LogState {
    file: File,
    pos: u64,
    /// Position of the end of the last `C` record; abort truncates here
    tpos: u64,
    tid: Tid,
}

pub struct CheckpointLog {
    destination: PathBuf,
    max_size: u64,
    state: Mutex<LogState>,
}

impl CheckpointLog {
    /// Open the newest valid log file in `destination`, truncating any
    /// unfinished tail, or start a fresh one.
    pub fn open(destination: impl AsRef<Path>, max_size: u64) -> ReplicationResult<Self> {
        let destination = destination.as_ref().to_path_buf();
        fs::create_dir_all(&destination)?;

        let mut names = log_file_names(&destination)?;
        while let Some(name) = names.pop() {
            let path = destination.join(&name);
            match Self::open_existing(&path, &destination, max_size) {
                Ok(Some(state)) => {
                    return Ok(Self {
                        destination,
                        max_size,
                        state: Mutex::new(state),
                    });
                }
                Ok(None) | Err(_) => {
                    warn!("Error reading log file {}; removing it", path.display());
                    let _ = fs::remove_file(&path);
                }
            }
        }

        let state = Self::create_file(&destination, Tid::ZERO)?;
        Ok(Self {
            destination,
            max_size,
            state: Mutex::new(state),
        })
    }

    fn create_file(destination: &Path, tid: Tid) -> ReplicationResult<LogState> {
        let path = destination.join(tid.to_string());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(LogState {
            file,
            pos: 0,
            tpos: 0,
            tid,
        })
    }

    /// Scan an existing file backward from EOF for its last `C` record.
    /// `Ok(None)` means the file holds no complete transaction.
    fn open_existing(
        path: &Path,
        destination: &Path,
        max_size: u64,
    ) -> ReplicationResult<Option<LogState>> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let opos = file.seek(SeekFrom::End(0))?;
        let mut pos = opos;
        while pos > 0 {
            let (start, mtype) = readback(&mut file, pos)?;
            if mtype == b'C' {
                if pos != opos {
                    file.set_len(pos)?;
                }
                let l = readlen(&mut file, start)?;
                if l != 9 {
                    return Err(ReplicationError::corrupted(start, "bad checkpoint record"));
                }
                let mut body = [0u8; 9];
                file.read_exact(&mut body)?;
                let tid = Tid::from_slice(&body[1..])?;
                if pos >= max_size {
                    // File is already full; start the next one
                    return Ok(Some(Self::create_file(destination, tid)?));
                }
                return Ok(Some(LogState {
                    file,
                    pos,
                    tpos: pos,
                    tid,
                }));
            }
            pos = start;
        }
        Ok(None)
    }

    pub fn last_transaction(&self) -> Tid {
        self.lock().tid
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one record. A `C` record carries the committed TID, makes
    /// everything since the previous `C` durable and may rotate the file.
    pub fn output(&self, mtype: u8, body: &[u8]) -> ReplicationResult<()> {
        let mut state = self.lock();
        let l = body.len() as u32 + 1;
        let pos = state.pos;
        state.file.seek(SeekFrom::Start(pos))?;
        state.file.write_all(&l.to_be_bytes())?;
        state.file.write_all(&[mtype])?;
        state.file.write_all(body)?;
        state.file.write_all(&l.to_be_bytes())?;
        state.pos += l as u64 + RECORD_OVERHEAD;

        if mtype == b'C' {
            state.tid = Tid::from_slice(body)?;
            state.file.sync_data()?;
            if state.pos >= self.max_size {
                let tid = state.tid;
                *state = Self::create_file(&self.destination, tid)?;
            }
            state.tpos = state.pos;
        }
        Ok(())
    }

    /// Truncate back to the last complete transaction.
    pub fn tpc_abort(&self) -> ReplicationResult<()> {
        let mut state = self.lock();
        let tpos = state.tpos;
        state.file.set_len(tpos)?;
        state.file.sync_data()?;
        state.pos = tpos;
        Ok(())
    }

    pub fn close(&self) -> ReplicationResult<()> {
        self.tpc_abort()?;
        self.lock().file.sync_all()?;
        Ok(())
    }
}

/// A secondary variant that records the replication stream to a
/// `CheckpointLog` instead of applying it to a store.
pub struct Recorder {
    log: Arc<CheckpointLog>,
    addr: String,
    client: ClientHandle,
}

impl Recorder {
    pub fn open(
        addr: impl Into<String>,
        destination: impl AsRef<Path>,
        max_size: u64,
        options: SecondaryOptions,
    ) -> ReplicationResult<Arc<Self>> {
        let addr = addr.into();
        let log = Arc::new(CheckpointLog::open(destination, max_size)?);
        info!("Opening recorder {} -> {}", addr, log.destination.display());

        let client = {
            let log = log.clone();
            let check_checksums = options.check_checksums;
            ClientHandle::spawn(addr.clone(), options, move || {
                Ok(RecorderConsumer::new(log.clone(), check_checksums))
            })
        };
        Ok(Arc::new(Self { log, addr, client }))
    }

    pub fn last_transaction(&self) -> Tid {
        self.log.last_transaction()
    }

    pub async fn close(&self) -> ReplicationResult<()> {
        info!("Closing recorder {}", self.addr);
        self.client.shutdown().await;
        self.log.close()
    }
}

struct RecorderConsumer {
    log: Arc<CheckpointLog>,
    check_checksums: bool,
    md5: md5::Context,
    txn: Option<Tid>,
    data_record_next: bool,
    blob_blocks: u64,
}

impl RecorderConsumer {
    fn new(log: Arc<CheckpointLog>, check_checksums: bool) -> Self {
        let mut md5 = md5::Context::new();
        md5.consume(log.last_transaction().as_bytes());
        Self {
            log,
            check_checksums,
            md5,
            txn: None,
            data_record_next: false,
            blob_blocks: 0,
        }
    }
}

impl StreamConsumer for RecorderConsumer {
    fn protocol(&self) -> &'static [u8] {
        PROTO_CURRENT
    }

    fn start(&self) -> Tid {
        self.log.last_transaction()
    }

    fn process(&mut self, message: Vec<u8>) -> ReplicationResult<()> {
        if self.data_record_next {
            self.data_record_next = false;
            self.log.output(b'd', &message)?;
        } else if self.blob_blocks > 0 {
            self.blob_blocks -= 1;
            self.log.output(b'b', &message)?;
        } else {
            match Message::decode(&message)? {
                Message::Transaction { tid, .. } => {
                    if self.txn.is_some() {
                        return Err(ReplicationError::protocol(
                            "transaction started inside a transaction",
                        ));
                    }
                    self.txn = Some(tid);
                    self.log.output(b'T', &message[1..])?;
                }
                Message::Store { .. } => {
                    self.data_record_next = true;
                    self.log.output(b'S', &message[1..])?;
                }
                Message::Blob { blocks, .. } => {
                    self.data_record_next = true;
                    self.blob_blocks = blocks;
                    self.log.output(b'B', &message[1..])?;
                }
                Message::Checksum { digest } => {
                    verify_checksum(&self.md5, self.check_checksums, digest)?;
                    let tid = self.txn.take().ok_or_else(|| {
                        ReplicationError::protocol("transaction finished outside a transaction")
                    })?;
                    self.log.output(b'C', tid.as_bytes())?;
                }
            }
        }
        self.md5.consume(&message);
        Ok(())
    }

    fn abort(&mut self) {
        self.txn = None;
        self.data_record_next = false;
        self.blob_blocks = 0;
        if let Err(e) = self.log.tpc_abort() {
            error!("checkpoint log abort failed: {e}");
        }
    }
}

fn name_to_tid(name: &str) -> ReplicationResult<Tid> {
    u64::from_str_radix(name, 16)
        .map(Tid::from_u64)
        .map_err(|_| ReplicationError::storage(format!("bad log file name {name}")))
}

/// Replay a checkpoint-log directory onto `storage`, reissuing the captured
/// store operations to rebuild another replica. The storage's current
/// transaction must appear in the log.
pub fn replay(log_dir: impl AsRef<Path>, storage: &dyn Storage) -> ReplicationResult<()> {
    let log_dir = log_dir.as_ref();
    let mut stid = storage.last_transaction();
    let filenames = log_file_names(log_dir)?;

    let before = filenames
        .iter()
        .filter(|name| name_to_tid(name).map(|t| t <= stid).unwrap_or(false))
        .next_back()
        .cloned()
        .ok_or_else(|| ReplicationError::storage("storage last transaction not in log"))?;

    let before_tid = name_to_tid(&before)?;
    let mut file = File::open(log_dir.join(&before))?;
    let mut pos = 0u64;
    if before_tid < stid {
        // Scan to the transaction just past the storage's current TID
        let size = file.metadata()?.len();
        let mut found = None;
        while pos < size {
            let l = readlen(&mut file, pos)? as u64;
            let mut mtype = [0u8; 1];
            file.read_exact(&mut mtype)?;
            if mtype[0] == b'C' {
                let mut body = [0u8; 8];
                file.read_exact(&mut body)?;
                let tid = Tid::from_bytes(body);
                pos += l + RECORD_OVERHEAD;
                found = Some(tid);
                if tid >= stid {
                    break;
                }
            } else {
                pos += l + RECORD_OVERHEAD;
            }
        }
        if found != Some(stid) {
            return Err(ReplicationError::storage(
                "storage last transaction not in log",
            ));
        }
    }
    if let Some(last) = replay_file(&mut file, pos, storage)? {
        stid = last;
    }

    for name in &filenames {
        let tid = name_to_tid(name)?;
        if tid < stid || *name == before {
            continue;
        }
        if tid != stid {
            return Err(ReplicationError::storage(format!(
                "gap in checkpoint log: expected {stid}, found {name}"
            )));
        }
        let mut file = File::open(log_dir.join(name))?;
        if let Some(last) = replay_file(&mut file, 0, storage)? {
            stid = last;
        }
    }
    Ok(())
}

/// Replay the records of one file from `pos` to EOF; returns the TID of
/// the last transaction committed, if any.
fn replay_file(
    file: &mut File,
    mut pos: u64,
    storage: &dyn Storage,
) -> ReplicationResult<Option<Tid>> {
    let size = file.metadata()?.len();
    let mut last = None;
    let mut txn: Option<Tid> = None;
    let mut record: Option<(Oid, Tid, Option<Tid>)> = None;
    let mut dbdata: Vec<u8> = Vec::new();
    let mut spool: Option<(File, PathBuf)> = None;
    let mut nblob = 0u64;

    while pos < size {
        let l = readlen(file, pos)? as u64;
        if l == 0 || pos + l + RECORD_OVERHEAD > size {
            return Err(ReplicationError::corrupted(pos, "truncated checkpoint record"));
        }
        let mut mtype = [0u8; 1];
        file.read_exact(&mut mtype)?;
        let mut body = vec![0u8; (l - 1) as usize];
        file.read_exact(&mut body)?;
        let trailing = {
            let mut buf = [0u8; 4];
            file.read_exact(&mut buf)?;
            u32::from_be_bytes(buf) as u64
        };
        if trailing != l {
            return Err(ReplicationError::corrupted(pos, "record length fields disagree"));
        }
        pos += l + RECORD_OVERHEAD;

        match mtype[0] {
            b'd' => {
                dbdata = body;
                if nblob == 0 {
                    let (oid, serial, prev_txn) = record.take().ok_or_else(|| {
                        ReplicationError::corrupted(pos, "data payload without a record")
                    })?;
                    let data = if dbdata.is_empty() {
                        None
                    } else {
                        Some(dbdata.as_slice())
                    };
                    match spool.take() {
                        None => storage.restore(oid, serial, data, prev_txn)?,
                        Some((spool_file, path)) => {
                            drop(spool_file);
                            let blobs = storage.blobs().ok_or_else(|| {
                                ReplicationError::storage("replay target cannot restore blobs")
                            })?;
                            blobs.restore_blob(oid, serial, data, &path, prev_txn)?;
                        }
                    }
                }
            }
            b'b' => {
                if nblob == 0 {
                    return Err(ReplicationError::corrupted(pos, "unexpected blob block"));
                }
                let (spool_file, _) = spool.as_mut().ok_or_else(|| {
                    ReplicationError::corrupted(pos, "blob block without a spool file")
                })?;
                spool_file.write_all(&body)?;
                nblob -= 1;
                if nblob == 0 {
                    let (spool_file, path) = match spool.take() {
                        Some(s) => s,
                        None => continue,
                    };
                    spool_file.sync_data()?;
                    drop(spool_file);
                    let (oid, serial, prev_txn) = record.take().ok_or_else(|| {
                        ReplicationError::corrupted(pos, "blob stream without a record")
                    })?;
                    let data = if dbdata.is_empty() {
                        None
                    } else {
                        Some(dbdata.as_slice())
                    };
                    let blobs = storage.blobs().ok_or_else(|| {
                        ReplicationError::storage("replay target cannot restore blobs")
                    })?;
                    blobs.restore_blob(oid, serial, data, &path, prev_txn)?;
                }
            }
            b'C' => {
                let ctid = Tid::from_slice(&body)?;
                let started = txn.take().ok_or_else(|| {
                    ReplicationError::corrupted(pos, "commit outside a transaction")
                })?;
                if ctid != started {
                    return Err(ReplicationError::corrupted(pos, "commit for a different transaction"));
                }
                storage.tpc_vote()?;
                storage.tpc_finish()?;
                last = Some(ctid);
            }
            tag @ (b'T' | b'S' | b'B') => {
                let mut payload = Vec::with_capacity(body.len() + 1);
                payload.push(tag);
                payload.extend_from_slice(&body);
                match Message::decode(&payload)? {
                    Message::Transaction {
                        tid,
                        status,
                        user,
                        description,
                        extension,
                    } => {
                        let meta = crate::types::TransactionMeta {
                            tid,
                            status,
                            user,
                            description,
                            extension,
                        };
                        storage.tpc_begin(&meta)?;
                        txn = Some(tid);
                    }
                    Message::Store {
                        oid,
                        tid,
                        version: _,
                        prev_txn,
                    } => {
                        record = Some((oid, tid, prev_txn));
                    }
                    Message::Blob {
                        oid,
                        tid,
                        version: _,
                        prev_txn,
                        blocks,
                    } => {
                        record = Some((oid, tid, prev_txn));
                        nblob = blocks;
                        let blobs = storage.blobs().ok_or_else(|| {
                            ReplicationError::storage("replay target cannot restore blobs")
                        })?;
                        let path = blobs
                            .temporary_directory()
                            .join(format!("replay-{}.blob", Uuid::new_v4()));
                        spool = Some((File::create(&path)?, path));
                    }
                    Message::Checksum { .. } => {
                        return Err(ReplicationError::corrupted(pos, "misfiled checkpoint record"));
                    }
                }
            }
            other => {
                return Err(ReplicationError::corrupted(
                    pos,
                    format!("unknown record type {:?}", other as char),
                ));
            }
        }
    }
    Ok(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::types::TxnStatus;

    fn record_transaction(log: &CheckpointLog, tid: Tid, oid: Oid, data: &[u8]) {
        let t = Message::Transaction {
            tid,
            status: TxnStatus::Normal,
            user: String::new(),
            description: String::new(),
            extension: Default::default(),
        }
        .encode();
        let s = Message::Store {
            oid,
            tid,
            version: String::new(),
            prev_txn: None,
        }
        .encode();
        log.output(b'T', &t[1..]).unwrap();
        log.output(b'S', &s[1..]).unwrap();
        log.output(b'd', data).unwrap();
        log.output(b'C', tid.as_bytes()).unwrap();
    }

    #[test]
    fn test_reopen_finds_last_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let tid = Tid::from_u64(0x20000);
        {
            let log = CheckpointLog::open(dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
            assert!(log.last_transaction().is_zero());
            record_transaction(&log, tid, Oid::from_u64(1), b"hello");
            log.close().unwrap();
        }
        let log = CheckpointLog::open(dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
        assert_eq!(log.last_transaction(), tid);
    }

    #[test]
    fn test_reopen_truncates_unfinished_tail() {
        let dir = tempfile::tempdir().unwrap();
        let tid = Tid::from_u64(0x20000);
        let path;
        {
            let log = CheckpointLog::open(dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
            record_transaction(&log, tid, Oid::from_u64(1), b"hello");
            // A transaction the connection never finished
            log.output(b'T', b"unfinished").unwrap();
            log.output(b'd', b"dangling").unwrap();
            path = dir.path().join(Tid::ZERO.to_string());
            // No close: simulate a crash with the tail on disk
            let full = fs::metadata(&path).unwrap().len();
            drop(log);
            assert!(full > 0);
        }
        let truncated = {
            let log = CheckpointLog::open(dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
            assert_eq!(log.last_transaction(), tid);
            fs::metadata(&path).unwrap().len()
        };
        // The reopened file ends exactly at the last C record
        let mut file = File::open(&path).unwrap();
        let (_, mtype) = readback(&mut file, truncated).unwrap();
        assert_eq!(mtype, b'C');
    }

    #[test]
    fn test_abort_discards_partial_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::open(dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
        let tid = Tid::from_u64(0x20000);
        record_transaction(&log, tid, Oid::from_u64(1), b"hello");
        log.output(b'T', b"partial").unwrap();
        log.tpc_abort().unwrap();
        record_transaction(&log, Tid::from_u64(0x30000), Oid::from_u64(2), b"next");
        assert_eq!(log.last_transaction(), Tid::from_u64(0x30000));
    }

    #[test]
    fn test_rotation_starts_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny threshold so the first transaction fills the file
        let log = CheckpointLog::open(dir.path(), 64).unwrap();
        let t1 = Tid::from_u64(0x20000);
        let t2 = Tid::from_u64(0x30000);
        record_transaction(&log, t1, Oid::from_u64(1), b"first");
        record_transaction(&log, t2, Oid::from_u64(2), b"second");
        log.close().unwrap();

        let names = log_file_names(dir.path()).unwrap();
        assert_eq!(
            names,
            vec![Tid::ZERO.to_string(), t1.to_string(), t2.to_string()]
        );
    }

    #[test]
    fn test_replay_rebuilds_a_replica() {
        let log_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let t1 = Tid::from_u64(0x20000);
        let t2 = Tid::from_u64(0x30000);
        let oid = Oid::from_u64(1);
        {
            let log = CheckpointLog::open(log_dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
            record_transaction(&log, t1, oid, b"one");
            record_transaction(&log, t2, oid, b"two");
            log.close().unwrap();
        }

        let store = FileStore::open(store_dir.path()).unwrap();
        replay(log_dir.path(), &store).unwrap();
        assert_eq!(store.last_transaction(), t2);
        assert_eq!(store.load(oid).unwrap(), (b"two".to_vec(), t2));
        assert_eq!(store.load_serial(oid, t1).unwrap(), b"one");
    }

    #[test]
    fn test_replay_resumes_from_storage_tid() {
        let log_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let t1 = Tid::from_u64(0x20000);
        let t2 = Tid::from_u64(0x30000);
        let oid = Oid::from_u64(1);
        {
            let log = CheckpointLog::open(log_dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
            record_transaction(&log, t1, oid, b"one");
            record_transaction(&log, t2, oid, b"two");
            log.close().unwrap();
        }

        let store = FileStore::open(store_dir.path()).unwrap();
        replay(log_dir.path(), &store).unwrap();
        // A second replay from the current TID applies nothing new
        replay(log_dir.path(), &store).unwrap();
        assert_eq!(store.last_transaction(), t2);
        assert!(store.load_before(oid, t2).unwrap().is_some());
    }

    #[test]
    fn test_replay_rejects_unknown_storage_tid() {
        let log_dir = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        {
            let log = CheckpointLog::open(log_dir.path(), DEFAULT_ROTATE_SIZE).unwrap();
            record_transaction(&log, Tid::from_u64(0x20000), Oid::from_u64(1), b"one");
            log.close().unwrap();
        }
        let store = FileStore::open(store_dir.path()).unwrap();
        // Put the store ahead of anything the log knows about
        let meta = crate::types::TransactionMeta::new(Tid::from_u64(0x90000), TxnStatus::Normal);
        store.tpc_begin(&meta).unwrap();
        store
            .restore(Oid::from_u64(9), meta.tid, Some(b"alien"), None)
            .unwrap();
        store.tpc_vote().unwrap();
        store.tpc_finish().unwrap();

        assert!(replay(log_dir.path(), &store).is_err());
    }

    #[test]
    fn test_recorder_consumer_captures_stream() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(CheckpointLog::open(dir.path(), DEFAULT_ROTATE_SIZE).unwrap());
        let mut consumer = RecorderConsumer::new(log.clone(), false);

        let tid = Tid::from_u64(0x20000);
        let oid = Oid::from_u64(1);
        consumer
            .process(
                Message::Transaction {
                    tid,
                    status: TxnStatus::Normal,
                    user: String::new(),
                    description: String::new(),
                    extension: Default::default(),
                }
                .encode(),
            )
            .unwrap();
        consumer
            .process(
                Message::Store {
                    oid,
                    tid,
                    version: String::new(),
                    prev_txn: None,
                }
                .encode(),
            )
            .unwrap();
        consumer.process(b"payload".to_vec()).unwrap();
        consumer
            .process(Message::Checksum { digest: [0; 16] }.encode())
            .unwrap();

        assert_eq!(log.last_transaction(), tid);

        // The captured stream replays onto a fresh store
        let store_dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(store_dir.path()).unwrap();
        replay(dir.path(), &store).unwrap();
        assert_eq!(store.load(oid).unwrap(), (b"payload".to_vec(), tid));
    }
}
