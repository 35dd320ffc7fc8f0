//! Versioned binary codecs for permission arrays and rank-name tables.
//!
//! Both formats are persisted in single blob columns/fields and are read
//! back by deployments of varying age, so decoding is deliberately
//! forgiving: a blob truncated at any record boundary (or mid-record)
//! yields the records parsed so far with a logged warning. Only a blob
//! that is unreadable from its very first field is a hard error.
//!
//! Wire formats:
//!
//! * Permission array: `[count:u8][count x value:u8]`. The count byte is
//!   read and discarded; the values run to the end of the blob.
//! * Rank-name table v2: `[version:u16 = 2]` followed by repeated
//!   `[rank:u8][len:u16][len bytes of UTF-8]` records until exhausted.
//! * Rank-name table v1 (read-only legacy): `[count:u8 = 12]` followed by
//!   twelve length-prefixed strings, the Nth naming rank N.
//!
//! Any future revision must keep the version tag in the leading bytes so
//! old readers can still dispatch.

use crate::error::CodecError;
use bytes::{BufMut, BytesMut};
use std::collections::BTreeMap;
use tracing::warn;

/// Version tag written on every newly encoded rank-name table.
pub const RANK_NAMES_VERSION: u16 = 2;

/// Entry count the legacy v1 format hard-codes. Not generalizable: a v1
/// blob with any other leading byte is malformed.
const LEGACY_NAME_COUNT: u8 = 12;

/// Encode a permission array.
pub fn encode_permissions(values: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() + 1);
    buf.push(values.len() as u8);
    buf.extend_from_slice(values);
    buf
}

/// Decode a permission array, tolerating a count byte that disagrees with
/// the data actually present.
pub fn decode_permissions(blob: &[u8]) -> Result<Vec<u8>, CodecError> {
    let Some((&declared, values)) = blob.split_first() else {
        return Err(CodecError::Empty);
    };
    if values.len() != declared as usize {
        warn!(
            declared,
            present = values.len(),
            "permission blob length mismatch, using values present"
        );
    }
    Ok(values.to_vec())
}

/// Encode a rank-name table in the current (v2) format.
pub fn encode_rank_names(names: &BTreeMap<u8, String>) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + names.len() * 16);
    buf.put_u16(RANK_NAMES_VERSION);
    for (rank, name) in names {
        buf.put_u8(*rank);
        put_utf(&mut buf, name);
    }
    buf.to_vec()
}

/// Decode a rank-name table, dispatching on the leading version tag.
///
/// A leading u16 of 2 selects the v2 decoder; anything else rewinds and
/// reads the blob as legacy v1.
pub fn decode_rank_names(blob: &[u8]) -> Result<BTreeMap<u8, String>, CodecError> {
    if blob.is_empty() {
        return Err(CodecError::Empty);
    }
    if blob.len() >= 2 && u16::from_be_bytes([blob[0], blob[1]]) == RANK_NAMES_VERSION {
        return Ok(decode_rank_names_v2(&blob[2..]));
    }
    decode_rank_names_v1(blob)
}

fn decode_rank_names_v2(mut buf: &[u8]) -> BTreeMap<u8, String> {
    let mut names = BTreeMap::new();
    while let Some((&rank, rest)) = buf.split_first() {
        buf = rest;
        match get_utf(&mut buf) {
            Some(name) => {
                names.insert(rank, name);
            }
            None => {
                warn!(rank, "rank-name table truncated mid-record, keeping names parsed so far");
                break;
            }
        }
    }
    names
}

fn decode_rank_names_v1(blob: &[u8]) -> Result<BTreeMap<u8, String>, CodecError> {
    let mut buf = blob;
    let count = buf[0];
    buf = &buf[1..];
    if count != LEGACY_NAME_COUNT {
        return Err(CodecError::BadLegacyCount(count));
    }
    let mut names = BTreeMap::new();
    for rank in 0..count {
        match get_utf(&mut buf) {
            Some(name) => {
                names.insert(rank, name);
            }
            None => {
                warn!(
                    rank,
                    "legacy rank-name table ended early, keeping names parsed so far"
                );
                break;
            }
        }
    }
    Ok(names)
}

fn put_utf(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Read one length-prefixed string, returning `None` if the buffer ends
/// before the record is complete.
fn get_utf(buf: &mut &[u8]) -> Option<String> {
    if buf.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return None;
    }
    let raw = &buf[2..2 + len];
    *buf = &buf[2 + len..];
    Some(String::from_utf8_lossy(raw).into_owned())
}
