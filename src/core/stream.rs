use bytes::Bytes;
use std::io::{self, Read, Seek, SeekFrom};

/// Read cursor over an immutable stream payload.
///
/// Cloning shares the bytes but never the position: each clone reads
/// independently, so two readers of the same database stream cannot
/// disturb each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    data: Bytes,
    pos: usize,
}

impl Stream {
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), pos: 0 }
    }

    /// A fresh cursor over the same bytes, rewound to the start.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self { data: self.data.clone(), pos: 0 }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos.min(self.data.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl Seek for Stream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream"));
        }
        self.pos = target as usize;
        Ok(target as u64)
    }
}
