//! Binary images of reader registers.
//!
//! The encoding is deterministic: the run map is written in ascending
//! segment order, so two images of equal logical state are byte-identical.
//! A trailing CRC32C guards the whole image.

use std::collections::BTreeMap;
use std::io;

use crate::register::Register;

pub(crate) const MAGIC: [u8; 6] = *b"binckp";
pub(crate) const FORMAT_VERSION: u8 = 1;

/// Length of the fixed prelude: magic, format version, one reserved byte.
const PRELUDE_LEN: usize = MAGIC.len() + 2;
/// Length of the trailing checksum.
const CRC_LEN: usize = 4;

/// Serialize `register` into its durable image.
pub(crate) fn encode(register: &Register) -> Vec<u8> {
    let runs: usize = register.acked.values().map(Vec::len).sum();
    let mut buf = Vec::with_capacity(PRELUDE_LEN + 20 + register.acked.len() * 12 + runs * 16 + CRC_LEN);
    buf.extend_from_slice(&MAGIC);
    buf.push(FORMAT_VERSION);
    buf.push(0);
    buf.extend_from_slice(&register.segment.to_le_bytes());
    buf.extend_from_slice(&register.entry.to_le_bytes());
    buf.extend_from_slice(&(register.acked.len() as u32).to_le_bytes());
    for (&segment, runs) in &register.acked {
        buf.extend_from_slice(&segment.to_le_bytes());
        buf.extend_from_slice(&(runs.len() as u32).to_le_bytes());
        for &(lo, hi) in runs {
            buf.extend_from_slice(&lo.to_le_bytes());
            buf.extend_from_slice(&hi.to_le_bytes());
        }
    }
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Reconstruct a register from its durable image.
///
/// # Errors
///
/// [`io::ErrorKind::InvalidData`] if the magic, format version, framing, or
/// checksum do not check out.
pub(crate) fn decode(image: &[u8]) -> io::Result<Register> {
    if image.len() < PRELUDE_LEN + CRC_LEN || !image.starts_with(&MAGIC) {
        return Err(invalid("checkpoint image does not start with magic"));
    }
    if image[MAGIC.len()] > FORMAT_VERSION {
        return Err(invalid("unsupported checkpoint format version"));
    }
    let (body, crc) = image.split_at(image.len() - CRC_LEN);
    let expected = u32::from_le_bytes(crc.try_into().expect("4 checksum bytes"));
    if crc32c::crc32c(body) != expected {
        return Err(invalid("checkpoint image checksum mismatch"));
    }

    let mut cursor = Cursor::new(&body[PRELUDE_LEN..]);
    let segment = cursor.u64()?;
    let entry = cursor.u64()?;
    let segments = cursor.u32()?;
    let mut acked = BTreeMap::new();
    let mut prev_segment = 0u64;
    for _ in 0..segments {
        let id = cursor.u64()?;
        if id <= prev_segment {
            return Err(invalid("checkpoint run map is not ascending"));
        }
        prev_segment = id;
        let count = cursor.u32()?;
        let mut runs = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let lo = cursor.u64()?;
            let hi = cursor.u64()?;
            if lo == 0 || hi < lo {
                return Err(invalid("checkpoint image holds a malformed run"));
            }
            runs.push((lo, hi));
        }
        acked.insert(id, runs);
    }
    if !cursor.is_empty() {
        return Err(invalid("checkpoint image has trailing bytes"));
    }
    Ok(Register {
        segment,
        entry,
        acked,
    })
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.0.len() < n {
            return Err(invalid("checkpoint image truncated"));
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> io::Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
