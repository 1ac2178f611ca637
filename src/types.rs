//! Core data types for the replication service
//!
//! This module contains the identifiers, transaction model and wire messages
//! used throughout logship:
//! - `Tid` / `Oid`: 8-byte totally ordered identifiers
//! - `TransactionMeta` / `DataRecord` / `TransactionRecord`: the unit of
//!   replication as read from the transaction log
//! - `Message`: the tagged control messages exchanged on the wire
//!
//! Control messages use an explicit big-endian binary encoding; the only
//! structured field is the transaction extension, a small key/value mapping
//! carried as JSON with deterministic (sorted) key order.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::buffer::{BufferReader, BufferWriter};
use crate::errors::{ReplicationError, ReplicationResult};

/// An 8-byte transaction identifier.
///
/// Lexicographic byte order equals commit order. The all-zero TID denotes
/// "before any transaction". TIDs generated by this crate embed the commit
/// wall-clock as `milliseconds << 16 | counter`; the embedded time is used
/// only to format log lines and to pick a scan direction when resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid([u8; 8]);

impl Tid {
    pub const ZERO: Tid = Tid([0; 8]);

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Tid(bytes)
    }

    pub fn from_u64(value: u64) -> Self {
        Tid(value.to_be_bytes())
    }

    /// Parse a TID from a wire message; the slice must be exactly 8 bytes.
    pub fn from_slice(bytes: &[u8]) -> ReplicationResult<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| ReplicationError::protocol("Invalid transaction id length"))?;
        Ok(Tid(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 8]
    }

    /// The wall-clock embedded in a TID allocated by this crate.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis((self.as_u64() >> 16) as i64)
    }

    /// Seconds since the epoch, for scan-direction distance comparisons.
    pub fn time_secs(&self) -> f64 {
        (self.as_u64() >> 16) as f64 / 1000.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

/// An 8-byte object identifier, unique per stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid([u8; 8]);

impl Oid {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Oid(bytes)
    }

    pub fn from_u64(value: u64) -> Self {
        Oid(value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.as_u64())
    }
}

/// Transaction status code as stored in the log and carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Ordinary committed transaction (space on disk)
    Normal,
    /// Transaction rewritten by a pack
    Packed,
    /// Undone transaction; skipped by iterators
    Undone,
    /// In-progress commit; never replicated
    Checkpoint,
}

impl TxnStatus {
    pub fn as_byte(&self) -> u8 {
        match self {
            TxnStatus::Normal => b' ',
            TxnStatus::Packed => b'p',
            TxnStatus::Undone => b'u',
            TxnStatus::Checkpoint => b'c',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b' ' => Some(TxnStatus::Normal),
            b'p' => Some(TxnStatus::Packed),
            b'u' => Some(TxnStatus::Undone),
            b'c' => Some(TxnStatus::Checkpoint),
            _ => None,
        }
    }
}

/// Extension mapping attached to a transaction (small key/value metadata).
pub type Extension = BTreeMap<String, String>;

/// Transaction attributes shared by the log, the wire and the commit
/// interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMeta {
    pub tid: Tid,
    pub status: TxnStatus,
    pub user: String,
    pub description: String,
    pub extension: Extension,
}

impl TransactionMeta {
    pub fn new(tid: Tid, status: TxnStatus) -> Self {
        Self {
            tid,
            status,
            user: String::new(),
            description: String::new(),
            extension: Extension::new(),
        }
    }
}

/// A single data record within a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    pub oid: Oid,
    /// Owning transaction
    pub tid: Tid,
    /// Legacy field; always empty in the current protocol
    pub version: String,
    /// Object payload; `None` when the record carries no data
    pub data: Option<Vec<u8>>,
    /// Back-pointer TID for delta storage
    pub prev_txn: Option<Tid>,
}

/// A fully committed transaction as yielded by the log iterator.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub meta: TransactionMeta,
    pub records: Vec<DataRecord>,
}

/// Tagged control messages of the replication wire protocol.
///
/// Raw messages (data payloads and blob blocks) are untagged and interpreted
/// positionally by the receiving automaton; they never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `T`: a transaction begins
    Transaction {
        tid: Tid,
        status: TxnStatus,
        user: String,
        description: String,
        extension: Extension,
    },
    /// `S`: a data record follows as one raw message
    Store {
        oid: Oid,
        tid: Tid,
        version: String,
        prev_txn: Option<Tid>,
    },
    /// `B`: a blob record follows as one raw message plus `blocks` raw blocks
    Blob {
        oid: Oid,
        tid: Tid,
        version: String,
        prev_txn: Option<Tid>,
        blocks: u64,
    },
    /// `C`: the transaction is complete; digest covers every payload sent
    /// on this connection so far
    Checksum { digest: [u8; 16] },
}

impl Message {
    /// Get the message tag for logging and dispatch
    pub fn tag(&self) -> u8 {
        match self {
            Message::Transaction { .. } => b'T',
            Message::Store { .. } => b'S',
            Message::Blob { .. } => b'B',
            Message::Checksum { .. } => b'C',
        }
    }

    /// Encode into a framed-message payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BufferWriter::with_capacity(64);
        writer.write_u8(self.tag());
        match self {
            Message::Transaction {
                tid,
                status,
                user,
                description,
                extension,
            } => {
                writer.write_bytes(tid.as_bytes());
                writer.write_u8(status.as_byte());
                writer.write_length_prefixed(user.as_bytes());
                writer.write_length_prefixed(description.as_bytes());
                if extension.is_empty() {
                    writer.write_u32(0);
                } else {
                    // BTreeMap keys are sorted, so the encoding is stable
                    let ext = serde_json::to_vec(extension).unwrap_or_default();
                    writer.write_length_prefixed(&ext);
                }
            }
            Message::Store {
                oid,
                tid,
                version,
                prev_txn,
            } => {
                encode_record_ref(&mut writer, oid, tid, version, prev_txn);
            }
            Message::Blob {
                oid,
                tid,
                version,
                prev_txn,
                blocks,
            } => {
                encode_record_ref(&mut writer, oid, tid, version, prev_txn);
                writer.write_u64(*blocks);
            }
            Message::Checksum { digest } => {
                writer.write_bytes(digest);
            }
        }
        writer.into_bytes()
    }

    /// Decode a framed-message payload. The payload must be consumed
    /// exactly; trailing bytes are a protocol violation.
    pub fn decode(payload: &[u8]) -> ReplicationResult<Message> {
        let mut reader = BufferReader::new(payload);
        let tag = reader.read_u8()?;
        let message = match tag {
            b'T' => {
                let tid = Tid::from_bytes(reader.read_8()?);
                let status_byte = reader.read_u8()?;
                let status = TxnStatus::from_byte(status_byte).ok_or_else(|| {
                    ReplicationError::protocol(format!(
                        "Invalid transaction status {:?}",
                        status_byte as char
                    ))
                })?;
                let user = read_string(&mut reader)?;
                let description = read_string(&mut reader)?;
                let ext = reader.read_length_prefixed()?;
                let extension = if ext.is_empty() {
                    Extension::new()
                } else {
                    serde_json::from_slice(&ext).map_err(|e| {
                        ReplicationError::protocol(format!("Bad extension mapping: {e}"))
                    })?
                };
                Message::Transaction {
                    tid,
                    status,
                    user,
                    description,
                    extension,
                }
            }
            b'S' => {
                let (oid, tid, version, prev_txn) = decode_record_ref(&mut reader)?;
                Message::Store {
                    oid,
                    tid,
                    version,
                    prev_txn,
                }
            }
            b'B' => {
                let (oid, tid, version, prev_txn) = decode_record_ref(&mut reader)?;
                let blocks = reader.read_u64()?;
                Message::Blob {
                    oid,
                    tid,
                    version,
                    prev_txn,
                    blocks,
                }
            }
            b'C' => {
                let digest: [u8; 16] = reader
                    .read_bytes(16)?
                    .try_into()
                    .map_err(|_| ReplicationError::protocol("Bad digest length"))?;
                Message::Checksum { digest }
            }
            other => {
                return Err(ReplicationError::protocol(format!(
                    "Invalid message type {:?}",
                    other as char
                )));
            }
        };
        if reader.remaining() != 0 {
            return Err(ReplicationError::protocol(format!(
                "{} trailing bytes after {:?} message",
                reader.remaining(),
                self_tag(&message)
            )));
        }
        Ok(message)
    }
}

fn self_tag(message: &Message) -> char {
    message.tag() as char
}

fn encode_record_ref(
    writer: &mut BufferWriter,
    oid: &Oid,
    tid: &Tid,
    version: &str,
    prev_txn: &Option<Tid>,
) {
    writer.write_bytes(oid.as_bytes());
    writer.write_bytes(tid.as_bytes());
    writer.write_length_prefixed(version.as_bytes());
    match prev_txn {
        Some(prev) => {
            writer.write_u8(1);
            writer.write_bytes(prev.as_bytes());
        }
        None => writer.write_u8(0),
    }
}

fn decode_record_ref(
    reader: &mut BufferReader<'_>,
) -> ReplicationResult<(Oid, Tid, String, Option<Tid>)> {
    let oid = Oid::from_bytes(reader.read_8()?);
    let tid = Tid::from_bytes(reader.read_8()?);
    let version = read_string(reader)?;
    let prev_txn = match reader.read_u8()? {
        0 => None,
        1 => Some(Tid::from_bytes(reader.read_8()?)),
        other => {
            return Err(ReplicationError::protocol(format!(
                "Bad back-pointer flag {other}"
            )));
        }
    };
    Ok((oid, tid, version, prev_txn))
}

fn read_string(reader: &mut BufferReader<'_>) -> ReplicationResult<String> {
    let bytes = reader.read_length_prefixed()?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
