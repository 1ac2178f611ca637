//! Primary side of the replication service
//!
//! `Primary` wraps a writable local store and serves its transaction log to
//! subscribed secondaries. It is also the glue between the write path and
//! replication: committing through the `Storage` interface of a `Primary`
//! signals every active producer's iterator after `tpc_finish` returns. No
//! transaction identifier crosses that signal; iterators discover new data
//! by re-reading the log file.
//!
//! Each accepted connection performs a two-message handshake (protocol tag,
//! then an 8-byte start TID) and then gets its own producer: a blocking
//! worker that tails the log with a `LogIterator` and feeds framed messages
//! through a bounded channel to the socket writer task. The bounded channel
//! is the backpressure contract: when the client stops reading, the channel
//! fills and the worker blocks before producing the next write.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{ReplicationError, ReplicationResult};
use crate::framing::{marshal_parts, FrameStream};
use crate::iterator::{CommitSignal, IteratorControl, LogIterator, ScanControl};
use crate::store::{is_blob_record, BlobStorage, LogSnapshot, Storage};
use crate::tracing_context::TracingContext;
use crate::types::{Message, Oid, Tid, TransactionMeta};

/// Legacy protocol: no blob block streaming.
pub const PROTO_LEGACY: &[u8] = b"zrs2.0";
/// Current protocol: blob support required.
pub const PROTO_CURRENT: &[u8] = b"zrs2.1";

/// Blobs are split into fixed-size blocks on the wire; the last block may
/// be short.
pub const BLOB_BLOCK_SIZE: u64 = 1 << 16;

/// Handshake messages are tiny; anything longer is garbage.
const HANDSHAKE_FRAME_LIMIT: u64 = 8;
/// Outbound frames buffered per connection before the producer blocks.
const WRITE_QUEUE_DEPTH: usize = 64;
/// How long `close` waits for producers to drain.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-connection producer state shared between the connection reader, the
/// blocking worker and `Primary::close`.
///
/// The iterator is created on the worker after the handshake, so stop and
/// close requests can arrive before it exists; the flags remember them and
/// `set_control` replays them once the iterator is up.
struct ProducerShared {
    scan_control: Arc<ScanControl>,
    control: Mutex<Option<IteratorControl>>,
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl ProducerShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scan_control: ScanControl::new(),
            control: Mutex::new(None),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn set_control(&self, control: IteratorControl) {
        if self.stopped.load(Ordering::SeqCst) {
            control.stop();
        } else if self.closed.load(Ordering::SeqCst) {
            control.catch_up_then_stop();
        }
        *self.control.lock().unwrap_or_else(|e| e.into_inner()) = Some(control);
    }

    /// Transport-initiated: the client is gone, stop producing now.
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.scan_control.stop();
        if let Some(control) = &*self.control.lock().unwrap_or_else(|e| e.into_inner()) {
            control.stop();
        }
    }

    /// Application-initiated: drain pending transactions, then disconnect.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(control) = &*self.control.lock().unwrap_or_else(|e| e.into_inner()) {
            control.catch_up_then_stop();
        }
    }
}

struct ProducerEntry {
    shared: Arc<ProducerShared>,
    worker: JoinHandle<()>,
}

type ProducerRegistry = Mutex<HashMap<u64, ProducerEntry>>;

pub struct Primary {
    storage: Arc<dyn Storage>,
    signal: Arc<CommitSignal>,
    local_addr: std::net::SocketAddr,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    producers: Arc<ProducerRegistry>,
    next_producer_id: AtomicU64,
}

impl Primary {
    /// Wrap `storage` and start listening on `addr` for secondaries.
    pub async fn open(storage: Arc<dyn Storage>, addr: &str) -> ReplicationResult<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Opening {} {}", storage.name(), local_addr);

        let primary = Arc::new(Self {
            storage,
            signal: CommitSignal::new(),
            local_addr,
            accept_task: Mutex::new(None),
            producers: Arc::new(Mutex::new(HashMap::new())),
            next_producer_id: AtomicU64::new(0),
        });

        let accept = {
            let primary = primary.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((socket, peer)) => {
                            let primary = primary.clone();
                            tokio::spawn(async move {
                                primary.serve_connection(socket, peer).await;
                            });
                        }
                        Err(e) => {
                            warn!("Accept failed: {e}");
                        }
                    }
                }
            })
        };
        *primary.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(accept);
        Ok(primary)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Graceful shutdown: stop listening, close the underlying store to
    /// prevent new writes, then give the producers up to 60 seconds to
    /// drain pending transactions to their clients.
    pub async fn close(&self) -> ReplicationResult<()> {
        info!("Closing {} {}", self.storage.name(), self.local_addr);
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }

        // Close the storage first to prevent more writes and to give the
        // secondaries more time to catch up.
        self.storage.close()?;

        let entries: Vec<ProducerEntry> = {
            let mut producers = self.producers.lock().unwrap_or_else(|e| e.into_inner());
            producers.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.shared.close();
        }
        let drain = async {
            for entry in entries {
                let _ = entry.worker.await;
            }
        };
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Producers did not drain within {:?}", CLOSE_DRAIN_TIMEOUT);
        }
        Ok(())
    }

    async fn serve_connection(&self, socket: TcpStream, peer: std::net::SocketAddr) {
        let ctx = TracingContext::for_peer("primary", &peer.to_string());
        ctx.with_span(|| info!("{peer}: Connected"));

        let producer_id = self.next_producer_id.fetch_add(1, Ordering::SeqCst);
        let shared = ProducerShared::new();

        if let Err(e) = self.run_connection(socket, peer, producer_id, &shared).await {
            error!(correlation_id = %ctx.correlation_id, "{peer}: {e}");
        }

        // Disconnected (either way): stop the producer and forget it.
        shared.stop();
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&producer_id);
        info!(correlation_id = %ctx.correlation_id, "{peer}: Disconnected");
    }

    async fn run_connection(
        &self,
        socket: TcpStream,
        peer: std::net::SocketAddr,
        producer_id: u64,
        shared: &Arc<ProducerShared>,
    ) -> ReplicationResult<()> {
        let (mut reader, writer) = socket.into_split();
        let mut stream = FrameStream::with_limit(HANDSHAKE_FRAME_LIMIT);
        let mut buf = vec![0u8; 4096];
        let mut protocol: Option<Vec<u8>> = None;
        let mut started = false;
        let mut writer = Some(writer);

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            for message in stream.push(&buf[..n])? {
                if protocol.is_none() {
                    if message == PROTO_LEGACY {
                        if self.storage.blobs().is_some() {
                            return Err(ReplicationError::protocol(format!(
                                "Invalid protocol {:?}. Require >= 2.1",
                                String::from_utf8_lossy(&message)
                            )));
                        }
                    } else if message != PROTO_CURRENT {
                        return Err(ReplicationError::protocol(format!(
                            "Invalid protocol {:?}",
                            String::from_utf8_lossy(&message)
                        )));
                    }
                    protocol = Some(message);
                } else if !started {
                    let start = Tid::from_slice(&message).map_err(|_| {
                        ReplicationError::protocol(format!(
                            "Invalid transaction id, {message:?}"
                        ))
                    })?;
                    match start.timestamp() {
                        Some(ts) => info!("{peer}: start {start} ({ts})"),
                        None => info!("{peer}: start {start}"),
                    }
                    started = true;
                    self.start_producer(
                        producer_id,
                        shared.clone(),
                        writer.take().ok_or_else(|| {
                            ReplicationError::protocol("connection already started")
                        })?,
                        start,
                        peer,
                    );
                } else if message.is_empty() {
                    debug!("{peer}: keep-alive");
                } else {
                    return Err(ReplicationError::protocol("Too many messages"));
                }
            }
        }
    }

    fn start_producer(
        &self,
        producer_id: u64,
        shared: Arc<ProducerShared>,
        writer: OwnedWriteHalf,
        start: Tid,
        peer: std::net::SocketAddr,
    ) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);
        tokio::spawn(write_frames(writer, rx));

        let worker = {
            let storage = self.storage.clone();
            let signal = self.signal.clone();
            let shared = shared.clone();
            tokio::task::spawn_blocking(move || {
                produce(storage, signal, start, shared, tx, peer);
            })
        };

        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer_id, ProducerEntry { shared, worker });
    }
}

/// All commits flow through the `Storage` interface of the `Primary`;
/// `tpc_finish` is where the replication pipeline hooks in.
impl Storage for Primary {
    fn name(&self) -> String {
        self.storage.name()
    }

    fn last_transaction(&self) -> Tid {
        self.storage.last_transaction()
    }

    fn log_snapshot(&self) -> LogSnapshot {
        self.storage.log_snapshot()
    }

    fn load(&self, oid: Oid) -> ReplicationResult<(Vec<u8>, Tid)> {
        self.storage.load(oid)
    }

    fn load_before(
        &self,
        oid: Oid,
        tid: Tid,
    ) -> ReplicationResult<Option<(Vec<u8>, Tid, Option<Tid>)>> {
        self.storage.load_before(oid, tid)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> ReplicationResult<Vec<u8>> {
        self.storage.load_serial(oid, serial)
    }

    fn new_oid(&self) -> ReplicationResult<Oid> {
        self.storage.new_oid()
    }

    fn store(&self, oid: Oid, data: &[u8]) -> ReplicationResult<()> {
        self.storage.store(oid, data)
    }

    fn restore(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
    ) -> ReplicationResult<()> {
        self.storage.restore(oid, serial, data, prev_txn)
    }

    fn tpc_begin(&self, meta: &TransactionMeta) -> ReplicationResult<()> {
        self.storage.tpc_begin(meta)
    }

    fn tpc_vote(&self) -> ReplicationResult<()> {
        self.storage.tpc_vote()
    }

    fn tpc_finish(&self) -> ReplicationResult<Tid> {
        let tid = self.storage.tpc_finish()?;
        self.signal.notify_all();
        Ok(tid)
    }

    fn tpc_abort(&self) -> ReplicationResult<()> {
        self.storage.tpc_abort()
    }

    fn pack(&self, before: Tid) -> ReplicationResult<()> {
        self.storage.pack(before)
    }

    fn close(&self) -> ReplicationResult<()> {
        self.storage.close()
    }

    fn blobs(&self) -> Option<&dyn BlobStorage> {
        self.storage.blobs()
    }
}

/// Socket writer task: the only code that touches the write half. Frames
/// arrive pre-encoded; the length prefix is written vectored-style without
/// copying the payload.
async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        let (header, body) = marshal_parts(&payload);
        if writer.write_all(&header).await.is_err() || writer.write_all(body).await.is_err() {
            // Connection reset; the reader side notices and stops the
            // producer, we just stop consuming so senders unblock.
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Blocking producer worker: tails the log from `start` and streams every
/// committed transaction, maintaining the running MD5 over all payloads
/// written on this connection.
fn produce(
    storage: Arc<dyn Storage>,
    signal: Arc<CommitSignal>,
    start: Tid,
    shared: Arc<ProducerShared>,
    tx: mpsc::Sender<Vec<u8>>,
    peer: std::net::SocketAddr,
) {
    let mut iterator = match LogIterator::new(
        storage.clone(),
        signal,
        start,
        shared.scan_control.clone(),
    ) {
        Ok(iterator) => iterator,
        Err(ReplicationError::ScanStopped) => return,
        Err(e) => {
            error!("{peer}: {e}");
            return;
        }
    };
    shared.set_control(iterator.control());

    let mut md5 = md5::Context::new();
    md5.consume(start.as_bytes());

    let result = stream_transactions(&storage, &mut iterator, &mut md5, &tx);
    match result {
        Ok(()) => {}
        Err(ReplicationError::NetworkIO(_)) => {} // client went away mid-write
        Err(e) => error!("{peer}: {e}"),
    }
}

fn send(
    md5: &mut md5::Context,
    tx: &mpsc::Sender<Vec<u8>>,
    payload: Vec<u8>,
) -> ReplicationResult<()> {
    md5.consume(&payload);
    tx.blocking_send(payload)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe).into())
}

fn stream_transactions(
    storage: &Arc<dyn Storage>,
    iterator: &mut LogIterator,
    md5: &mut md5::Context,
    tx: &mpsc::Sender<Vec<u8>>,
) -> ReplicationResult<()> {
    while let Some(txn) = iterator.next()? {
        send(
            md5,
            tx,
            Message::Transaction {
                tid: txn.meta.tid,
                status: txn.meta.status,
                user: txn.meta.user.clone(),
                description: txn.meta.description.clone(),
                extension: txn.meta.extension.clone(),
            }
            .encode(),
        )?;

        for record in &txn.records {
            if let (Some(data), Some(blobs)) = (record.data.as_deref(), storage.blobs()) {
                if is_blob_record(data) && stream_blob(blobs, record.oid, record, md5, tx)? {
                    continue;
                }
            }
            send(
                md5,
                tx,
                Message::Store {
                    oid: record.oid,
                    tid: record.tid,
                    version: record.version.clone(),
                    prev_txn: record.prev_txn,
                }
                .encode(),
            )?;
            send(md5, tx, record.data.clone().unwrap_or_default())?;
        }

        let digest = md5.clone().compute().0;
        send(md5, tx, Message::Checksum { digest }.encode())?;
    }
    Ok(())
}

/// Stream one blob record: the `B` announcement, the marker payload, then
/// exactly `nblocks` raw blocks of at most 64 KiB. Returns `false` when the
/// blob file is not retrievable, letting the caller fall back to a plain
/// `S` record.
fn stream_blob(
    blobs: &dyn BlobStorage,
    oid: Oid,
    record: &crate::types::DataRecord,
    md5: &mut md5::Context,
    tx: &mpsc::Sender<Vec<u8>>,
) -> ReplicationResult<bool> {
    let path = match blobs.load_blob(oid, record.tid) {
        Ok(path) => path,
        Err(_) => return Ok(false),
    };
    let mut file = match File::open(&path) {
        Ok(file) => file,
        Err(_) => return Ok(false),
    };
    let size = file.metadata()?.len();
    let mut blocks = size / BLOB_BLOCK_SIZE;
    if size % BLOB_BLOCK_SIZE != 0 {
        blocks += 1;
    }

    send(
        md5,
        tx,
        Message::Blob {
            oid,
            tid: record.tid,
            version: record.version.clone(),
            prev_txn: record.prev_txn,
            blocks,
        }
        .encode(),
    )?;
    send(md5, tx, record.data.clone().unwrap_or_default())?;

    let mut remaining = blocks;
    let mut block = vec![0u8; BLOB_BLOCK_SIZE as usize];
    while remaining > 0 {
        let n = file.read(&mut block)?;
        if n == 0 {
            return Err(ReplicationError::storage(format!(
                "blob {} shrank while streaming",
                path.display()
            )));
        }
        remaining -= 1;
        send(md5, tx, block[..n].to_vec())?;
    }
    Ok(true)
}
