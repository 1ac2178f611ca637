//! On-disk transaction-log record format
//!
//! A log file is a fixed 4-byte magic followed by self-delimited transaction
//! records:
//!
//! ```text
//! tid(8) tlen(8) status(1) ulen(2) dlen(2) elen(4)
//! user[ulen] description[dlen] extension-json[elen]
//! data records...
//! tlen(8)                  <- redundant trailer at pos + tlen
//! ```
//!
//! `tlen` covers everything from the start of the header up to (not
//! including) the trailer; the next transaction starts at `pos + tlen + 8`.
//! The redundant trailer is what lets a reader distinguish a fully committed
//! transaction from a truncated or in-flight append, and lets a backward
//! scan walk from EOF.
//!
//! Data record: `oid(8) dlen(4) prev_tid(8)` then `dlen` payload bytes. A
//! zero `prev_tid` means no back-pointer; a zero `dlen` means the record
//! carries no data.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::buffer::{BufferReader, BufferWriter};
use crate::errors::{ReplicationError, ReplicationResult};
use crate::types::{DataRecord, Extension, Oid, Tid, TransactionMeta, TxnStatus};

pub const MAGIC: &[u8; 4] = b"TLG1";
/// Offset of the first transaction record.
pub const DATA_START: u64 = 4;
/// Size of the fixed transaction header.
pub const TXN_HEADER_LEN: u64 = 25;
/// Size of a data record header.
pub const DATA_HEADER_LEN: u64 = 20;
/// Size of the redundant length trailer.
pub const TRAILER_LEN: u64 = 8;

/// Fixed part of a transaction header as read from the log.
#[derive(Debug, Clone, Copy)]
pub struct TxnHeader {
    pub tid: Tid,
    pub tlen: u64,
    pub status: u8,
    pub ulen: u16,
    pub dlen: u16,
    pub elen: u32,
}

impl TxnHeader {
    /// Length of the header including the variable user/description/extension
    /// parts; the first data record starts this far into the transaction.
    pub fn header_len(&self) -> u64 {
        TXN_HEADER_LEN + self.ulen as u64 + self.dlen as u64 + self.elen as u64
    }
}

fn read_exact_at(file: &mut File, pos: u64, buf: &mut [u8]) -> ReplicationResult<bool> {
    file.seek(SeekFrom::Start(pos))?;
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            return Ok(false);
        }
        read += n;
    }
    Ok(true)
}

/// Read the fixed transaction header at `pos`. A short read at EOF is not an
/// error: it yields `None` so the caller can wait for more data.
pub fn read_txn_header(file: &mut File, pos: u64) -> ReplicationResult<Option<TxnHeader>> {
    let mut buf = [0u8; TXN_HEADER_LEN as usize];
    if !read_exact_at(file, pos, &mut buf)? {
        return Ok(None);
    }
    let mut reader = BufferReader::new(&buf);
    let tid = Tid::from_bytes(reader.read_8().expect("fixed header"));
    let tlen = reader.read_u64().expect("fixed header");
    let status = reader.read_u8().expect("fixed header");
    let ulen = reader.read_u16().expect("fixed header");
    let dlen = reader.read_u16().expect("fixed header");
    let elen = reader.read_u32().expect("fixed header");
    Ok(Some(TxnHeader {
        tid,
        tlen,
        status,
        ulen,
        dlen,
        elen,
    }))
}

/// Read the redundant 8-byte length trailer at `pos`; `None` on short read.
pub fn read_trailer(file: &mut File, pos: u64) -> ReplicationResult<Option<u64>> {
    let mut buf = [0u8; TRAILER_LEN as usize];
    if !read_exact_at(file, pos, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(u64::from_be_bytes(buf)))
}

/// Read the variable header parts and build the transaction metadata.
pub fn read_txn_meta(
    file: &mut File,
    pos: u64,
    header: &TxnHeader,
    status: TxnStatus,
) -> ReplicationResult<TransactionMeta> {
    let vlen = header.ulen as usize + header.dlen as usize + header.elen as usize;
    let mut buf = vec![0u8; vlen];
    if !read_exact_at(file, pos + TXN_HEADER_LEN, &mut buf)? {
        return Err(ReplicationError::corrupted(pos, "truncated transaction header"));
    }
    let (user, rest) = buf.split_at(header.ulen as usize);
    let (description, ext) = rest.split_at(header.dlen as usize);
    let extension: Extension = if ext.is_empty() {
        Extension::new()
    } else {
        serde_json::from_slice(ext)
            .map_err(|e| ReplicationError::corrupted(pos, format!("bad extension mapping: {e}")))?
    };
    Ok(TransactionMeta {
        tid: header.tid,
        status,
        user: String::from_utf8_lossy(user).into_owned(),
        description: String::from_utf8_lossy(description).into_owned(),
        extension,
    })
}

/// Read the data records of a transaction between `pos` and `tend`, in log
/// order. `tpos` is the transaction's own offset, used for error reporting.
pub fn read_data_records(
    file: &mut File,
    tpos: u64,
    mut pos: u64,
    tend: u64,
    tid: Tid,
) -> ReplicationResult<Vec<DataRecord>> {
    let mut records = Vec::new();
    while pos < tend {
        let mut head = [0u8; DATA_HEADER_LEN as usize];
        if pos + DATA_HEADER_LEN > tend || !read_exact_at(file, pos, &mut head)? {
            return Err(ReplicationError::corrupted(
                tpos,
                format!("data record header exceeds transaction record at {pos}"),
            ));
        }
        let mut reader = BufferReader::new(&head);
        let oid = Oid::from_bytes(reader.read_8().expect("data header"));
        let dlen = reader.read_u32().expect("data header") as u64;
        let prev = Tid::from_bytes(reader.read_8().expect("data header"));
        if pos + DATA_HEADER_LEN + dlen > tend {
            return Err(ReplicationError::corrupted(
                tpos,
                format!("data record exceeds transaction record at {pos}"),
            ));
        }
        let data = if dlen == 0 {
            None
        } else {
            let mut payload = vec![0u8; dlen as usize];
            if !read_exact_at(file, pos + DATA_HEADER_LEN, &mut payload)? {
                return Err(ReplicationError::corrupted(tpos, "truncated data record"));
            }
            Some(payload)
        };
        records.push(DataRecord {
            oid,
            tid,
            version: String::new(),
            data,
            prev_txn: if prev.is_zero() { None } else { Some(prev) },
        });
        pos += DATA_HEADER_LEN + dlen;
    }
    Ok(records)
}

/// Serialize a complete transaction record, trailer included. The returned
/// offset is where the status byte sits inside the buffer, so a writer can
/// append with status `c` and patch it once the append is durable.
pub fn encode_transaction(meta: &TransactionMeta, records: &[DataRecord]) -> (Vec<u8>, usize) {
    let ext = if meta.extension.is_empty() {
        Vec::new()
    } else {
        serde_json::to_vec(&meta.extension).unwrap_or_default()
    };
    let user = meta.user.as_bytes();
    let description = meta.description.as_bytes();

    let records_len: u64 = records
        .iter()
        .map(|r| DATA_HEADER_LEN + r.data.as_ref().map_or(0, |d| d.len() as u64))
        .sum();
    let tlen =
        TXN_HEADER_LEN + user.len() as u64 + description.len() as u64 + ext.len() as u64 + records_len;

    let mut writer = BufferWriter::with_capacity(tlen as usize + TRAILER_LEN as usize);
    writer.write_bytes(meta.tid.as_bytes());
    writer.write_u64(tlen);
    let status_offset = writer.bytes_written();
    writer.write_u8(meta.status.as_byte());
    writer.write_u16(user.len() as u16);
    writer.write_u16(description.len() as u16);
    writer.write_u32(ext.len() as u32);
    writer.write_bytes(user);
    writer.write_bytes(description);
    writer.write_bytes(&ext);
    for record in records {
        writer.write_bytes(record.oid.as_bytes());
        writer.write_u32(record.data.as_ref().map_or(0, |d| d.len() as u32));
        writer.write_bytes(record.prev_txn.unwrap_or(Tid::ZERO).as_bytes());
        if let Some(data) = &record.data {
            writer.write_bytes(data);
        }
    }
    writer.write_u64(tlen);
    (writer.into_bytes(), status_offset)
}
