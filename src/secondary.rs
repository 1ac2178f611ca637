//! Secondary side of the replication service
//!
//! A `Secondary` dials the primary, performs the handshake (protocol tag,
//! then the local store's last transaction), and applies the inbound stream
//! to its local store, one transaction at a time. Connection loss aborts any
//! in-progress transaction and schedules a reconnect; because the local
//! `last_transaction` is unchanged, the primary re-sends the interrupted
//! transaction and delivery stays at-least-once.
//!
//! The secondary presents a read-only facade to the outside; only the
//! inbound automaton commits through the wrapped store.
//!
//! The connector loop is shared with the checkpoint-log recorder through
//! the `StreamConsumer` seam: a consumer supplies the handshake values and
//! absorbs the framed messages of one connection.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::errors::{ReplicationError, ReplicationResult};
use crate::framing::{marshal, FrameStream};
use crate::primary::{PROTO_CURRENT, PROTO_LEGACY};
use crate::store::{ReadOnlyStore, Storage};
use crate::tracing_context::TracingContext;
use crate::types::{Message, Oid, Tid, TransactionMeta};

#[derive(Debug, Clone)]
pub struct SecondaryOptions {
    /// Delay before reconnecting after a failed or lost connection
    pub reconnect_delay: Duration,
    /// Verify the primary's digest at each `C` message
    pub check_checksums: bool,
    /// Send an empty keepalive frame this often; zero disables
    pub keep_alive_delay: Duration,
}

impl Default for SecondaryOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(60),
            check_checksums: true,
            keep_alive_delay: Duration::ZERO,
        }
    }
}

/// One connection's worth of inbound stream handling.
///
/// Created per connection attempt; `protocol` and `start` feed the
/// handshake, every complete framed message goes through `process`, and
/// `abort` runs on teardown whatever ended the session.
pub(crate) trait StreamConsumer: Send {
    fn protocol(&self) -> &'static [u8];
    fn start(&self) -> Tid;
    fn process(&mut self, message: Vec<u8>) -> ReplicationResult<()>;
    fn abort(&mut self);
}

/// Reconnecting client shared by `Secondary` and the checkpoint recorder.
pub(crate) struct ClientHandle {
    closed: watch::Sender<bool>,
    connector: Mutex<Option<JoinHandle<()>>>,
}

impl ClientHandle {
    pub(crate) fn spawn<F, C>(addr: String, options: SecondaryOptions, factory: F) -> Self
    where
        F: Fn() -> ReplicationResult<C> + Send + Sync + 'static,
        C: StreamConsumer + 'static,
    {
        let (closed, _) = watch::channel(false);
        let handle = Self {
            closed: closed.clone(),
            connector: Mutex::new(None),
        };
        let connector = tokio::spawn(async move {
            connect_loop(addr, options, factory, closed.subscribe()).await;
        });
        *handle.connector.lock().unwrap_or_else(|e| e.into_inner()) = Some(connector);
        handle
    }

    /// Disconnect and cancel the reconnect schedule.
    pub(crate) async fn shutdown(&self) {
        let _ = self.closed.send(true);
        let connector = self
            .connector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = connector {
            let _ = task.await;
        }
    }
}

async fn connect_loop<F, C>(
    addr: String,
    options: SecondaryOptions,
    factory: F,
    mut closed: watch::Receiver<bool>,
) where
    F: Fn() -> ReplicationResult<C> + Send + Sync + 'static,
    C: StreamConsumer + 'static,
{
    loop {
        if *closed.borrow() {
            return;
        }
        match TcpStream::connect(&addr).await {
            Ok(socket) => {
                let ctx = TracingContext::for_peer("secondary", &addr);
                info!(correlation_id = %ctx.correlation_id, "{addr}: Connected");
                match factory() {
                    Ok(mut consumer) => {
                        let result =
                            session(socket, &mut consumer, &options, &mut closed).await;
                        // Whatever ended the session, never leave a
                        // transaction half applied before reconnecting.
                        consumer.abort();
                        match result {
                            Ok(()) => info!("{addr}: Disconnected"),
                            Err(e) => {
                                error!(correlation_id = %ctx.correlation_id, "{addr}: {e}")
                            }
                        }
                    }
                    Err(e) => error!("{addr}: {e}"),
                }
            }
            Err(e) => {
                info!("{addr}: Connection failed: {e}");
            }
        }
        if *closed.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(options.reconnect_delay) => {}
            _ = closed.changed() => return,
        }
    }
}

async fn session<C: StreamConsumer>(
    socket: TcpStream,
    consumer: &mut C,
    options: &SecondaryOptions,
    closed: &mut watch::Receiver<bool>,
) -> ReplicationResult<()> {
    let (mut reader, mut writer) = socket.into_split();

    writer.write_all(&marshal(consumer.protocol())).await?;
    writer
        .write_all(&marshal(consumer.start().as_bytes()))
        .await?;

    let mut stream = FrameStream::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut keepalive = if options.keep_alive_delay > Duration::ZERO {
        Some(tokio::time::interval_at(
            tokio::time::Instant::now() + options.keep_alive_delay,
            options.keep_alive_delay,
        ))
    } else {
        None
    };

    loop {
        tokio::select! {
            _ = closed.changed() => return Ok(()),
            _ = tick(&mut keepalive) => {
                debug!("keep-alive");
                writer.write_all(&0u32.to_be_bytes()).await?;
            }
            n = reader.read(&mut buf) => {
                let n = n?;
                if n == 0 {
                    return Ok(());
                }
                for message in stream.push(&buf[..n])? {
                    consumer.process(message)?;
                }
            }
        }
    }
}

async fn tick(keepalive: &mut Option<tokio::time::Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub struct Secondary {
    storage: Arc<dyn Storage>,
    addr: String,
    client: ClientHandle,
}

impl Secondary {
    /// Wrap `storage` and start replicating from the primary at `addr`.
    pub fn open(
        storage: Arc<dyn Storage>,
        addr: impl Into<String>,
        options: SecondaryOptions,
    ) -> Arc<Self> {
        let addr = addr.into();
        info!("Opening {} {}", storage.name(), addr);

        let client = {
            let storage = storage.clone();
            let check_checksums = options.check_checksums;
            ClientHandle::spawn(addr.clone(), options, move || {
                Ok(Automaton::new(storage.clone(), check_checksums))
            })
        };

        Arc::new(Self {
            storage,
            addr,
            client,
        })
    }

    /// The read-only facade over the replicated store.
    pub fn storage(&self) -> ReadOnlyStore {
        ReadOnlyStore::new(self.storage.clone())
    }

    pub fn last_transaction(&self) -> Tid {
        self.storage.last_transaction()
    }

    /// Disconnect, cancel the reconnect schedule and close the wrapped
    /// store. Any in-progress transaction is aborted by the session
    /// teardown before the store closes.
    pub async fn close(&self) -> ReplicationResult<()> {
        info!("Closing {} {}", self.storage.name(), self.addr);
        self.client.shutdown().await;
        self.storage.close()?;
        Ok(())
    }
}

/// A record awaiting its raw data payload.
struct PendingRecord {
    oid: Oid,
    serial: Tid,
    prev_txn: Option<Tid>,
}

/// A blob record collecting its block stream into a spool file.
struct PendingBlob {
    oid: Oid,
    serial: Tid,
    data: Option<Vec<u8>>,
    prev_txn: Option<Tid>,
    file: File,
    path: PathBuf,
    remaining: u64,
}

/// State machine that rebuilds transactions from the inbound wire stream.
///
/// Control messages (`T|S|B|C`) and raw messages (data payloads, blob
/// blocks) alternate in a disciplined way: after `S` or `B` exactly one raw
/// data message follows; after a `B` announcing N blocks, N raw block
/// messages follow. Everything received is folded into the running MD5.
struct Automaton {
    storage: Arc<dyn Storage>,
    check_checksums: bool,
    md5: md5::Context,
    txn: Option<TransactionMeta>,
    record: Option<PendingRecord>,
    blob_blocks: u64,
    blob: Option<PendingBlob>,
    /// Re-receipt of an already-applied transaction: consume its messages
    /// (keeping the digest in step) without touching the store
    skipping: bool,
    skip_raw: bool,
    skip_blocks: u64,
}

impl Automaton {
    fn new(storage: Arc<dyn Storage>, check_checksums: bool) -> Self {
        let start = storage.last_transaction();
        let mut md5 = md5::Context::new();
        md5.consume(start.as_bytes());
        Self {
            storage,
            check_checksums,
            md5,
            txn: None,
            record: None,
            blob_blocks: 0,
            blob: None,
            skipping: false,
            skip_raw: false,
            skip_blocks: 0,
        }
    }

    fn skip(&mut self, message: &[u8]) -> ReplicationResult<()> {
        if self.skip_raw {
            self.skip_raw = false;
        } else if self.skip_blocks > 0 {
            self.skip_blocks -= 1;
        } else {
            match Message::decode(message)? {
                Message::Store { .. } => self.skip_raw = true,
                Message::Blob { blocks, .. } => {
                    self.skip_raw = true;
                    self.skip_blocks = blocks;
                }
                Message::Checksum { digest } => {
                    verify_checksum(&self.md5, self.check_checksums, digest)?;
                    self.skipping = false;
                }
                Message::Transaction { .. } => {
                    return Err(ReplicationError::protocol(
                        "transaction started inside a transaction",
                    ));
                }
            }
        }
        Ok(())
    }

    fn control(&mut self, message: &[u8]) -> ReplicationResult<()> {
        match Message::decode(message)? {
            Message::Transaction {
                tid,
                status,
                user,
                description,
                extension,
            } => {
                if self.txn.is_some() || self.record.is_some() {
                    return Err(ReplicationError::protocol(
                        "transaction started inside a transaction",
                    ));
                }
                if tid <= self.storage.last_transaction() {
                    // At-least-once delivery: the primary may retransmit a
                    // transaction we already hold; consume it quietly.
                    debug!("skipping already-applied transaction {tid}");
                    self.skipping = true;
                    return Ok(());
                }
                let meta = TransactionMeta {
                    tid,
                    status,
                    user,
                    description,
                    extension,
                };
                self.storage.tpc_begin(&meta)?;
                self.txn = Some(meta);
            }
            Message::Store {
                oid,
                tid,
                version: _,
                prev_txn,
            } => {
                self.expect_in_txn()?;
                self.record = Some(PendingRecord {
                    oid,
                    serial: tid,
                    prev_txn,
                });
            }
            Message::Blob {
                oid,
                tid,
                version: _,
                prev_txn,
                blocks,
            } => {
                self.expect_in_txn()?;
                self.record = Some(PendingRecord {
                    oid,
                    serial: tid,
                    prev_txn,
                });
                self.blob_blocks = blocks;
            }
            Message::Checksum { digest } => {
                verify_checksum(&self.md5, self.check_checksums, digest)?;
                let txn = self.txn.take().ok_or_else(|| {
                    ReplicationError::protocol("transaction finished outside a transaction")
                })?;
                self.storage.tpc_vote()?;
                let tid = self.storage.tpc_finish()?;
                debug!("applied transaction {tid}");
                debug_assert_eq!(tid, txn.tid);
            }
        }
        Ok(())
    }

    fn expect_in_txn(&self) -> ReplicationResult<()> {
        if self.txn.is_none() {
            return Err(ReplicationError::protocol(
                "data record outside a transaction",
            ));
        }
        Ok(())
    }
}

impl StreamConsumer for Automaton {
    fn protocol(&self) -> &'static [u8] {
        if self.storage.blobs().is_some() {
            PROTO_CURRENT
        } else {
            PROTO_LEGACY
        }
    }

    fn start(&self) -> Tid {
        self.storage.last_transaction()
    }

    fn process(&mut self, message: Vec<u8>) -> ReplicationResult<()> {
        if self.skipping {
            self.skip(&message)?;
            self.md5.consume(&message);
            return Ok(());
        }
        if let Some(record) = self.record.take() {
            // Raw data payload of the pending record
            let data = if message.is_empty() {
                None
            } else {
                Some(message.as_slice())
            };
            if self.blob_blocks > 0 {
                let blobs = self.storage.blobs().ok_or_else(|| {
                    ReplicationError::protocol("blob record on a blob-less store")
                })?;
                let path = blobs
                    .temporary_directory()
                    .join(format!("secondary-{}.blob", Uuid::new_v4()));
                let file = File::create(&path)?;
                self.blob = Some(PendingBlob {
                    oid: record.oid,
                    serial: record.serial,
                    data: data.map(|d| d.to_vec()),
                    prev_txn: record.prev_txn,
                    file,
                    path,
                    remaining: self.blob_blocks,
                });
                self.blob_blocks = 0;
            } else {
                self.storage
                    .restore(record.oid, record.serial, data, record.prev_txn)?;
            }
        } else if let Some(mut blob) = self.blob.take() {
            // One blob block
            blob.file.write_all(&message)?;
            blob.remaining -= 1;
            if blob.remaining > 0 {
                self.blob = Some(blob);
            } else {
                blob.file.sync_data()?;
                drop(blob.file);
                let blobs = self.storage.blobs().ok_or_else(|| {
                    ReplicationError::protocol("blob record on a blob-less store")
                })?;
                blobs.restore_blob(
                    blob.oid,
                    blob.serial,
                    blob.data.as_deref(),
                    &blob.path,
                    blob.prev_txn,
                )?;
            }
        } else {
            self.control(&message)?;
        }
        self.md5.consume(&message);
        Ok(())
    }

    /// Clear per-transaction state after a disconnect, aborting any
    /// in-progress local transaction and removing the blob spool file.
    fn abort(&mut self) {
        if let Some(blob) = self.blob.take() {
            drop(blob.file);
            let _ = fs::remove_file(&blob.path);
        }
        self.record = None;
        self.blob_blocks = 0;
        self.skipping = false;
        self.skip_raw = false;
        self.skip_blocks = 0;
        if self.txn.take().is_some() {
            if let Err(e) = self.storage.tpc_abort() {
                error!("abort after disconnect failed: {e}");
            }
        }
    }
}

pub(crate) fn verify_checksum(
    md5: &md5::Context,
    check_checksums: bool,
    claimed: [u8; 16],
) -> ReplicationResult<()> {
    if !check_checksums {
        return Ok(());
    }
    let actual = md5.clone().compute().0;
    if claimed != actual {
        return Err(ReplicationError::ChecksumMismatch {
            expected: hex(&claimed),
            actual: hex(&actual),
        });
    }
    Ok(())
}

fn hex(digest: &[u8; 16]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
