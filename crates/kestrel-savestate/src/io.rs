//! Little-endian field encoding shared by the archive header, the blob framing and section
//! payloads.
//!
//! Encoding appends to an in-memory buffer. Decoding walks a borrowed slice with [`Fields`], so
//! payload bytes are handed out without copying and running short is reported as corruption.

use crate::error::{Result, SaveStateError};

/// Appends fixed-width little-endian fields to a section or archive buffer.
pub trait PutLe {
    fn put_u8(&mut self, v: u8);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
    fn put_bytes(&mut self, bytes: &[u8]);

    /// `[len: u32][bytes]`.
    fn put_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        let len: u32 = bytes
            .len()
            .try_into()
            .map_err(|_| SaveStateError::Corrupt("length does not fit in u32"))?;
        self.put_u32(len);
        self.put_bytes(bytes);
        Ok(())
    }
}

impl PutLe for Vec<u8> {
    fn put_u8(&mut self, v: u8) {
        self.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Reads fields from the front of an encoded buffer.
///
/// Every read that runs past the end fails with `Corrupt(truncated)`, where `truncated` names
/// the structure being decoded.
#[derive(Debug, Clone, Copy)]
pub struct Fields<'a> {
    rest: &'a [u8],
    truncated: &'static str,
}

impl<'a> Fields<'a> {
    pub fn new(buf: &'a [u8], truncated: &'static str) -> Self {
        Self { rest: buf, truncated }
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.rest.len() {
            return Err(SaveStateError::Corrupt(self.truncated));
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// Reads a `[len: u32][bytes]` field written by [`PutLe::put_prefixed`].
    pub fn prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    /// Everything not yet read.
    pub fn rest(&self) -> &'a [u8] {
        self.rest
    }

    /// Fails with `Corrupt(trailing)` if any bytes are left.
    pub fn finish(self, trailing: &'static str) -> Result<()> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(SaveStateError::Corrupt(trailing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_fields_borrow_from_the_buffer() {
        let mut out = Vec::new();
        out.put_prefixed(b"ram").unwrap();
        out.put_prefixed(&[]).unwrap();
        out.put_u64(u64::MAX);

        let mut fields = Fields::new(&out, "truncated test record");
        assert_eq!(fields.prefixed().unwrap(), b"ram");
        assert_eq!(fields.prefixed().unwrap(), b"");
        assert_eq!(fields.u64().unwrap(), u64::MAX);
        fields.finish("trailing bytes").unwrap();
    }

    #[test]
    fn short_reads_name_the_structure() {
        let mut fields = Fields::new(&[1, 2], "truncated test record");
        let err = fields.u32().unwrap_err();
        assert!(matches!(err, SaveStateError::Corrupt("truncated test record")));
        // A failed read consumes nothing.
        assert_eq!(fields.remaining(), 2);
    }

    #[test]
    fn oversized_length_prefix_is_corrupt() {
        let mut out = Vec::new();
        out.put_u32(1024);
        out.put_bytes(&[0; 16]);
        let mut fields = Fields::new(&out, "truncated memory section");
        assert!(matches!(
            fields.prefixed(),
            Err(SaveStateError::Corrupt("truncated memory section"))
        ));
    }

    #[test]
    fn leftover_bytes_fail_finish() {
        let mut fields = Fields::new(&[0, 0, 0, 0, 9], "truncated");
        assert_eq!(fields.u32().unwrap(), 0);
        assert!(matches!(
            fields.finish("trailing bytes"),
            Err(SaveStateError::Corrupt("trailing bytes"))
        ));
    }
}
