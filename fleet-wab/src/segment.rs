//! On-disk record and segment-file naming conventions.
//!
//! Record layout (all integers little-endian):
//! `[1 byte kind][8 bytes seq][8 bytes enqueued_at_millis][4 bytes len][len bytes payload][4 bytes crc32]`
//! The CRC covers kind + seq + enqueued_at + len + payload, so a torn write
//! (the common crash case: process dies mid-`write`) is caught either by a
//! short read or a CRC mismatch — both are treated as "corrupted tail".

use std::io::{self, Read, Write};
use std::path::PathBuf;

pub const HEADER_LEN: usize = 1 + 8 + 8 + 4;
pub const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct RawEntry {
    pub seq: u64,
    pub kind: u8,
    pub enqueued_at_millis: i64,
    pub payload: Vec<u8>,
}

pub fn encode(entry: &RawEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + entry.payload.len() + TRAILER_LEN);
    buf.push(entry.kind);
    buf.extend_from_slice(&entry.seq.to_le_bytes());
    buf.extend_from_slice(&entry.enqueued_at_millis.to_le_bytes());
    buf.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&entry.payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf
}

pub enum DecodeOutcome {
    Entry(RawEntry),
    /// Clean end of file: no bytes to read.
    Eof,
    /// A short read or CRC mismatch — the tail is corrupt and must be truncated.
    Corrupt,
}

/// Decode a single record from `r`. Never reads past one record.
pub fn decode_one<R: Read>(r: &mut R) -> io::Result<DecodeOutcome> {
    let mut header = [0u8; HEADER_LEN];
    let n = read_fill(r, &mut header)?;
    if n == 0 {
        return Ok(DecodeOutcome::Eof);
    }
    if n < HEADER_LEN {
        return Ok(DecodeOutcome::Corrupt);
    }
    let kind = header[0];
    let seq = u64::from_le_bytes(header[1..9].try_into().unwrap());
    let enqueued_at_millis = i64::from_le_bytes(header[9..17].try_into().unwrap());
    let len = u32::from_le_bytes(header[17..21].try_into().unwrap()) as usize;

    // Sanity bound: refuse to allocate absurd lengths from a torn/corrupt header.
    if len > 64 * 1024 * 1024 {
        return Ok(DecodeOutcome::Corrupt);
    }

    let mut payload = vec![0u8; len];
    if read_fill(r, &mut payload)? < len {
        return Ok(DecodeOutcome::Corrupt);
    }

    let mut trailer = [0u8; TRAILER_LEN];
    if read_fill(r, &mut trailer)? < TRAILER_LEN {
        return Ok(DecodeOutcome::Corrupt);
    }
    let expected_crc = u32::from_le_bytes(trailer);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Ok(DecodeOutcome::Corrupt);
    }

    Ok(DecodeOutcome::Entry(RawEntry {
        seq,
        kind,
        enqueued_at_millis,
        payload,
    }))
}

fn read_fill<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

pub fn segment_path(dir: &std::path::Path, index: u64) -> PathBuf {
    dir.join(format!("{index:012}.seg"))
}

pub fn parse_segment_index(file_name: &str) -> Option<u64> {
    file_name.strip_suffix(".seg")?.parse().ok()
}

pub fn write_all_and_flush<W: Write>(w: &mut W, buf: &[u8]) -> io::Result<()> {
    w.write_all(buf)?;
    w.flush()
}
