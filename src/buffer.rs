//! Growable byte buffer with a separate read cursor.
//!
//! All wire codecs in this crate ([`crate::cbor`], the superframe framing)
//! append into a [`GrowBuf`] and consume from it through the cursor. A
//! buffer is either *owned* (it reallocates as needed) or *loaned* (it
//! wraps caller-provided storage of fixed capacity and refuses to grow
//! past it).

use std::io::SeekFrom;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("loaned buffer is full: capacity {capacity}, additional {additional}")]
    Full { capacity: usize, additional: usize },
    #[error("seek out of bounds: {position} (size {size})")]
    SeekOutOfBounds { position: i64, size: usize },
}

#[derive(Clone, Debug, Default)]
pub struct GrowBuf {
    data: Vec<u8>,
    read_pos: usize,
    /// capacity limit for loaned storage. `None` means owned and growable.
    limit: Option<usize>,
}

impl GrowBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            read_pos: 0,
            limit: None,
        }
    }

    /// Wrap caller-provided storage. The buffer starts empty and may not
    /// grow past the storage's capacity.
    pub fn loan(storage: Vec<u8>) -> Self {
        let limit = storage.capacity();
        let mut data = storage;
        data.clear();
        Self {
            data,
            read_pos: 0,
            limit: Some(limit),
        }
    }

    pub fn is_loaned(&self) -> bool {
        self.limit.is_some()
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if let Some(limit) = self.limit {
            if self.data.len() + bytes.len() > limit {
                return Err(Error::Full {
                    capacity: limit,
                    additional: bytes.len(),
                });
            }
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.append(&[byte])
    }

    /// Copy up to `out.len()` bytes at the cursor into `out`, advancing
    /// the cursor. Returns the number of bytes copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let got = out.len().min(self.avail());
        out[..got].copy_from_slice(&self.data[self.read_pos..self.read_pos + got]);
        self.read_pos += got;
        got
    }

    pub fn seek(&mut self, seek: SeekFrom) -> Result<usize, Error> {
        let position = match seek {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.read_pos as i64 + offset,
            SeekFrom::End(offset) => self.data.len() as i64 + offset,
        };

        if position < 0 || position > self.data.len() as i64 {
            return Err(Error::SeekOutOfBounds {
                position,
                size: self.data.len(),
            });
        }

        self.read_pos = position as usize;
        Ok(self.read_pos)
    }

    /// Current cursor position.
    pub fn ptr(&self) -> usize {
        self.read_pos
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes remaining between the cursor and the end of the buffer.
    pub fn avail(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Unread portion of the buffer.
    pub fn current_data(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer, returning the underlying storage.
    pub fn finalize(self) -> Vec<u8> {
        self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }
}

impl From<Vec<u8>> for GrowBuf {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data,
            read_pos: 0,
            limit: None,
        }
    }
}

impl AsRef<[u8]> for GrowBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_through_cursor() {
        let mut buf = GrowBuf::new();
        buf.append(b"hello ").unwrap();
        buf.append(b"world").unwrap();

        let mut out = [0u8; 6];
        assert_eq!(buf.read(&mut out), 6);
        assert_eq!(&out, b"hello ");
        assert_eq!(buf.avail(), 5);
        assert_eq!(buf.current_data(), b"world");
    }

    #[test]
    fn loaned_buffer_refuses_growth() {
        let mut buf = GrowBuf::loan(Vec::with_capacity(4));
        buf.append(b"abcd").unwrap();
        assert!(matches!(buf.append(b"e"), Err(Error::Full { .. })));
        assert_eq!(buf.size(), 4);
    }

    #[test]
    fn seek_clamps_to_bounds() {
        let mut buf = GrowBuf::from(b"0123456789".to_vec());
        assert_eq!(buf.seek(SeekFrom::End(-2)).unwrap(), 8);
        assert_eq!(buf.avail(), 2);
        assert!(buf.seek(SeekFrom::Current(3)).is_err());
        assert_eq!(buf.ptr(), 8);
    }
}
