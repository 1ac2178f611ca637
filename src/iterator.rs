//! Resume-and-tail iterator over the primary's transaction log
//!
//! A `LogIterator` opens the log file independently of the writer, positions
//! itself just past a starting TID, and then yields committed transactions in
//! commit order, blocking on the shared commit signal whenever it reaches the
//! end of the log. Committers wake every blocked iterator after each
//! successful `tpc_finish`; iterators discover the new data by re-reading the
//! file, so nothing but the wakeup crosses the signal.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{error, warn};

use crate::errors::{ReplicationError, ReplicationResult};
use crate::store::format::{self, DATA_START, TRAILER_LEN, TXN_HEADER_LEN};
use crate::store::Storage;
use crate::types::{Tid, TransactionRecord, TxnStatus};

/// Rendezvous between committers and iterators. Signaled under the lock
/// after each commit; iterators wait on it when the log is exhausted.
#[derive(Debug, Default)]
pub struct CommitSignal {
    lock: Mutex<()>,
    changed: Condvar,
}

impl CommitSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake every blocked iterator; called after a successful commit.
    pub fn notify_all(&self) {
        let _guard = self.acquire();
        self.changed.notify_all();
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        self.changed
            .wait(guard)
            .unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared boolean consulted inside the resume scans so that a disconnecting
/// client bounds the cost of a long search.
#[derive(Debug, Default)]
pub struct ScanControl {
    stopped: AtomicBool,
}

impl ScanControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Handle for stopping an iterator from another task.
#[derive(Clone)]
pub struct IteratorControl {
    stop: Arc<AtomicBool>,
    catch_up: Arc<AtomicBool>,
    signal: Arc<CommitSignal>,
}

impl IteratorControl {
    /// Terminal stop: subsequent `next` calls end the stream immediately.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.signal.notify_all();
    }

    /// Once the log is momentarily exhausted, end the stream instead of
    /// blocking. Used by graceful shutdown to drain pending transactions.
    pub fn catch_up_then_stop(&self) {
        self.catch_up.store(true, Ordering::SeqCst);
        self.signal.notify_all();
    }
}

pub struct LogIterator {
    storage: Arc<dyn Storage>,
    signal: Arc<CommitSignal>,
    scan_control: Arc<ScanControl>,
    stop: Arc<AtomicBool>,
    catch_up: Arc<AtomicBool>,
    /// Last delivered TID; the next transaction yielded is strictly greater
    ltid: Tid,
    file: File,
    pos: u64,
    generation: u64,
}

impl LogIterator {
    /// Open the log and position just past `start`. Fails with `TidTooHigh`
    /// when `start` is beyond the writer's frontier and with `ScanStopped`
    /// when the scan control is cleared mid-search.
    pub fn new(
        storage: Arc<dyn Storage>,
        signal: Arc<CommitSignal>,
        start: Tid,
        scan_control: Arc<ScanControl>,
    ) -> ReplicationResult<Self> {
        let snapshot = storage.log_snapshot();
        let file = File::open(&snapshot.path)?;
        let mut iterator = Self {
            storage,
            signal,
            scan_control,
            stop: Arc::new(AtomicBool::new(false)),
            catch_up: Arc::new(AtomicBool::new(false)),
            ltid: start,
            file,
            pos: DATA_START,
            generation: snapshot.generation,
        };
        iterator.reposition(snapshot.append_pos)?;
        Ok(iterator)
    }

    pub fn control(&self) -> IteratorControl {
        IteratorControl {
            stop: self.stop.clone(),
            catch_up: self.catch_up.clone(),
            signal: self.signal.clone(),
        }
    }

    /// Yield the next committed transaction, blocking until one is appended,
    /// `stop`/`catch_up_then_stop` ends the stream (`Ok(None)`), or the log
    /// turns out to be damaged.
    pub fn next(&mut self) -> ReplicationResult<Option<TransactionRecord>> {
        let signal = self.signal.clone();
        let mut guard = signal.acquire();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(None);
            }
            if let Some(txn) = self.advance()? {
                return Ok(Some(txn));
            }
            if self.catch_up.load(Ordering::SeqCst) {
                return Ok(None);
            }
            guard = signal.wait(guard);
        }
    }

    /// Reopen the log (the store was packed or we are being constructed)
    /// and reposition just past the last delivered TID.
    fn open(&mut self) -> ReplicationResult<()> {
        let snapshot = self.storage.log_snapshot();
        self.file = File::open(&snapshot.path)?;
        self.generation = snapshot.generation;
        self.pos = DATA_START;
        self.reposition(snapshot.append_pos)
    }

    fn reposition(&mut self, append_pos: u64) -> ReplicationResult<()> {
        let ltid = self.ltid;
        if ltid.is_zero() {
            return Ok(());
        }

        // We aren't starting at the beginning. We need to find the first
        // transaction after ltid; search from whichever end is closer in
        // time.
        let first = match format::read_txn_header(&mut self.file, DATA_START)? {
            Some(header) => header,
            None => return Err(ReplicationError::TidTooHigh(ltid)),
        };
        let t1 = first.tid.time_secs();
        let t2 = self.storage.last_transaction().time_secs();
        let t = ltid.time_secs();

        if (t - t1) < (t2 - t1) / 2.0 {
            return self.scan_forward(DATA_START, ltid);
        }

        let mut pos = append_pos;
        if pos < DATA_START + TXN_HEADER_LEN + TRAILER_LEN {
            // strangely small position
            return self.scan_forward(DATA_START, ltid);
        }
        pos -= TRAILER_LEN;
        let tlen = match format::read_trailer(&mut self.file, pos)? {
            Some(tlen) => tlen,
            None => return self.scan_forward(DATA_START, ltid),
        };
        if tlen + DATA_START >= pos {
            // strangely small position
            return self.scan_forward(DATA_START, ltid);
        }
        pos -= tlen;
        let header = format::read_txn_header(&mut self.file, pos)?.ok_or_else(|| {
            ReplicationError::corrupted(pos, "trailing length points past the file")
        })?;
        if header.tid <= ltid {
            self.scan_forward(pos, ltid)
        } else {
            self.scan_backward(pos, ltid)
        }
    }

    fn scan_forward(&mut self, mut pos: u64, ltid: Tid) -> ReplicationResult<()> {
        loop {
            if self.scan_control.is_stopped() {
                return Err(ReplicationError::ScanStopped);
            }
            let header = match format::read_txn_header(&mut self.file, pos)? {
                Some(header) => header,
                None => {
                    // end of file
                    self.pos = pos;
                    return Err(ReplicationError::TidTooHigh(ltid));
                }
            };
            if header.status == b'c' {
                return Err(ReplicationError::TidTooHigh(ltid));
            }
            if header.tid > ltid {
                // This is the one we want to read next
                self.pos = pos;
                return Ok(());
            }
            pos += header.tlen + TRAILER_LEN;
            if header.tid == ltid {
                // We just read the one we want to skip past
                self.pos = pos;
                return Ok(());
            }
        }
    }

    fn scan_backward(&mut self, mut pos: u64, ltid: Tid) -> ReplicationResult<()> {
        loop {
            if self.scan_control.is_stopped() {
                return Err(ReplicationError::ScanStopped);
            }
            if pos < DATA_START + TRAILER_LEN {
                return Err(ReplicationError::corrupted(pos, "backward scan underran the log"));
            }
            pos -= TRAILER_LEN;
            let tlen = format::read_trailer(&mut self.file, pos)?.ok_or_else(|| {
                ReplicationError::corrupted(pos, "missing transaction trailer")
            })?;
            if tlen + DATA_START > pos {
                return Err(ReplicationError::corrupted(pos, "bad transaction trailer"));
            }
            pos -= tlen;
            let header = format::read_txn_header(&mut self.file, pos)?.ok_or_else(|| {
                ReplicationError::corrupted(pos, "missing transaction header")
            })?;
            if header.tid <= ltid {
                self.pos = pos + tlen + TRAILER_LEN;
                return Ok(());
            }
        }
    }

    /// Attempt to read the next committed transaction; `Ok(None)` means the
    /// log is exhausted (or ends in an in-flight commit) and the caller
    /// should wait.
    fn advance(&mut self) -> ReplicationResult<Option<TransactionRecord>> {
        let snapshot = self.storage.log_snapshot();
        if snapshot.generation != self.generation {
            // The store was packed; reopen and reposition at the last
            // delivered TID.
            self.open()?;
        }

        loop {
            let pos = self.pos;
            let header = match format::read_txn_header(&mut self.file, pos)? {
                Some(header) => header,
                None => return Ok(None),
            };

            if header.tid <= self.ltid && !self.ltid.is_zero() {
                warn!(
                    "{} time-stamp reduction at {}",
                    self.storage.name(),
                    pos
                );
            }

            if header.status == b'c' {
                // Assume we've hit the last, in-progress transaction.
                // Wait until there is more data.
                return Ok(None);
            }

            if !matches!(header.status, b' ' | b'u' | b'p') {
                warn!(
                    "{} has invalid status, {:?}, at {}",
                    self.storage.name(),
                    header.status as char,
                    pos
                );
            }

            if header.tlen < header.header_len() {
                error!(
                    "{} has invalid transaction header at {}",
                    self.storage.name(),
                    pos
                );
                return Err(ReplicationError::corrupted(pos, "invalid transaction header"));
            }

            let tend = pos + header.tlen;

            // Check the (intentionally redundant) transaction length
            match format::read_trailer(&mut self.file, tend)? {
                Some(rtl) if rtl == header.tlen => {}
                Some(_) => {
                    warn!(
                        "{} redundant transaction length check failed at {}",
                        self.storage.name(),
                        tend
                    );
                    return Ok(None);
                }
                None => return Ok(None),
            }

            self.pos = tend + TRAILER_LEN;
            self.ltid = header.tid;

            if header.status == b'u' {
                // Undone transaction; skip
                continue;
            }

            let status = TxnStatus::from_byte(header.status).unwrap_or(TxnStatus::Normal);
            let meta = format::read_txn_meta(&mut self.file, pos, &header, status)?;
            let records = format::read_data_records(
                &mut self.file,
                pos,
                pos + header.header_len(),
                tend,
                header.tid,
            )?;
            return Ok(Some(TransactionRecord { meta, records }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use crate::types::{Oid, TransactionMeta};
    use std::time::Duration;

    fn open_store(dir: &std::path::Path) -> Arc<FileStore> {
        Arc::new(FileStore::open(dir).unwrap())
    }

    fn commit(store: &FileStore, tid: Tid, oid: Oid, data: &[u8]) -> Tid {
        let meta = TransactionMeta::new(tid, TxnStatus::Normal);
        store.tpc_begin(&meta).unwrap();
        if tid.is_zero() {
            store.store(oid, data).unwrap();
        } else {
            store.restore(oid, tid, Some(data), None).unwrap();
        }
        store.tpc_vote().unwrap();
        store.tpc_finish().unwrap()
    }

    // TIDs with controlled embedded times so both scan directions are taken
    fn tid_at_ms(ms: u64) -> Tid {
        Tid::from_u64(ms << 16)
    }

    fn seeded_store(dir: &std::path::Path, count: u64) -> (Arc<FileStore>, Vec<Tid>) {
        let store = open_store(dir);
        let tids: Vec<Tid> = (1..=count)
            .map(|i| commit(&store, tid_at_ms(i * 1000), Oid::from_u64(i), format!("data-{i}").as_bytes()))
            .collect();
        (store, tids)
    }

    fn drain(iterator: &mut LogIterator) -> Vec<Tid> {
        iterator.control().catch_up_then_stop();
        let mut seen = Vec::new();
        while let Some(txn) = iterator.next().unwrap() {
            seen.push(txn.meta.tid);
        }
        seen
    }

    #[test]
    fn test_iterates_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let (store, tids) = seeded_store(dir.path(), 5);
        let mut iterator = LogIterator::new(
            store,
            CommitSignal::new(),
            Tid::ZERO,
            ScanControl::new(),
        )
        .unwrap();
        assert_eq!(drain(&mut iterator), tids);
    }

    #[test]
    fn test_resume_just_after_a_tid() {
        let dir = tempfile::tempdir().unwrap();
        let (store, tids) = seeded_store(dir.path(), 10);

        // Near the start resolves via the forward scan, near the end via
        // the backward scan; both must land on the same contract.
        for split in [1usize, 8] {
            let mut iterator = LogIterator::new(
                store.clone(),
                CommitSignal::new(),
                tids[split],
                ScanControl::new(),
            )
            .unwrap();
            assert_eq!(drain(&mut iterator), tids[split + 1..].to_vec());
        }
    }

    #[test]
    fn test_resume_between_tids() {
        let dir = tempfile::tempdir().unwrap();
        let (store, tids) = seeded_store(dir.path(), 6);
        let between = Tid::from_u64(tids[2].as_u64() + 1);
        let mut iterator =
            LogIterator::new(store, CommitSignal::new(), between, ScanControl::new()).unwrap();
        assert_eq!(drain(&mut iterator), tids[3..].to_vec());
    }

    #[test]
    fn test_tid_too_high() {
        let dir = tempfile::tempdir().unwrap();
        let (store, tids) = seeded_store(dir.path(), 3);
        let high = Tid::from_u64(tids[2].as_u64() + 0x10000);
        let err = LogIterator::new(store, CommitSignal::new(), high, ScanControl::new())
            .err()
            .expect("must not resume past the frontier");
        assert!(matches!(err, ReplicationError::TidTooHigh(_)));
    }

    #[test]
    fn test_tid_too_high_on_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let err = LogIterator::new(
            store,
            CommitSignal::new(),
            Tid::from_u64(1),
            ScanControl::new(),
        )
        .err()
        .expect("empty log has no transactions to resume from");
        assert!(matches!(err, ReplicationError::TidTooHigh(_)));
    }

    #[test]
    fn test_scan_control_aborts_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (store, tids) = seeded_store(dir.path(), 20);
        let scan_control = ScanControl::new();
        scan_control.stop();
        let err = LogIterator::new(store, CommitSignal::new(), tids[10], scan_control)
            .err()
            .expect("stopped scan must not deliver");
        assert!(matches!(err, ReplicationError::ScanStopped));
    }

    #[test]
    fn test_undone_transactions_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let t1 = commit(&store, tid_at_ms(1000), Oid::from_u64(1), b"keep");
        let meta = TransactionMeta::new(tid_at_ms(2000), TxnStatus::Undone);
        store.tpc_begin(&meta).unwrap();
        store
            .restore(Oid::from_u64(2), meta.tid, Some(b"gone"), None)
            .unwrap();
        store.tpc_vote().unwrap();
        store.tpc_finish().unwrap();
        let t3 = commit(&store, tid_at_ms(3000), Oid::from_u64(3), b"keep too");

        let mut iterator =
            LogIterator::new(store, CommitSignal::new(), Tid::ZERO, ScanControl::new()).unwrap();
        assert_eq!(drain(&mut iterator), vec![t1, t3]);
    }

    #[test]
    fn test_blocks_until_notified() {
        let dir = tempfile::tempdir().unwrap();
        let (store, tids) = seeded_store(dir.path(), 1);
        let signal = CommitSignal::new();
        let mut iterator = LogIterator::new(
            store.clone(),
            signal.clone(),
            tids[0],
            ScanControl::new(),
        )
        .unwrap();

        let committer = {
            let store = store.clone();
            let signal = signal.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                let tid = commit(&store, tid_at_ms(5000), Oid::from_u64(9), b"late");
                signal.notify_all();
                tid
            })
        };

        let txn = iterator.next().unwrap().expect("woken by commit");
        let committed = committer.join().unwrap();
        assert_eq!(txn.meta.tid, committed);
    }

    #[test]
    fn test_stop_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (store, tids) = seeded_store(dir.path(), 2);
        let mut iterator = LogIterator::new(
            store,
            CommitSignal::new(),
            tids[1],
            ScanControl::new(),
        )
        .unwrap();
        let control = iterator.control();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            control.stop();
        });
        assert!(iterator.next().unwrap().is_none());
        stopper.join().unwrap();
    }

    #[test]
    fn test_pack_reopens_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let oid = Oid::from_u64(1);
        let t1 = commit(&store, tid_at_ms(1000), oid, b"v1");
        let t2 = commit(&store, tid_at_ms(2000), oid, b"v2");

        let mut iterator = LogIterator::new(
            store.clone(),
            CommitSignal::new(),
            Tid::ZERO,
            ScanControl::new(),
        )
        .unwrap();
        assert_eq!(iterator.next().unwrap().unwrap().meta.tid, t1);

        // Pack away t1's revision; the iterator must notice the new file
        // and reposition at its last delivered TID.
        store.pack(t2).unwrap();
        let t3 = commit(&store, tid_at_ms(3000), oid, b"v3");

        iterator.control().catch_up_then_stop();
        let mut rest = Vec::new();
        while let Some(txn) = iterator.next().unwrap() {
            rest.push(txn.meta.tid);
        }
        assert_eq!(rest, vec![t2, t3]);
    }
}
