use thiserror::Error;

/// Once a drained buffer has grown beyond this capacity it is
/// shrunk back down, so that a single large burst doesn't pin
/// memory for the rest of a long-lived connection.
const RETAIN_CAPACITY: usize = 256 * 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("line of at least {len} bytes exceeds the maximum of {max} bytes")]
pub struct LineTooLong {
    pub len: usize,
    pub max: usize,
}

/// A growable byte buffer with an offset based consumption model.
///
/// Bytes are appended at the end and consumed from `offset`.
/// `0 <= offset <= len` always holds, and the buffer is compacted
/// (both reset to zero) exactly when everything has been consumed.
#[derive(Debug, Default)]
pub struct ConnectionBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl ConnectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Copy out exactly `n` bytes, or return None if fewer than `n`
    /// bytes are currently buffered. Nothing is consumed in that case.
    pub fn consume(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.available() < n {
            return None;
        }
        let out = self.data[self.offset..self.offset + n].to_vec();
        self.advance(n);
        Some(out)
    }

    /// Extract the next `\n` terminated line, terminator included.
    ///
    /// Returns `Ok(None)` if no complete line is buffered yet.
    /// A line, or an unterminated run, that is longer than `max` is
    /// reported as an error and left in place; no partial line is
    /// ever returned.
    pub fn consume_line(&mut self, max: usize) -> Result<Option<Vec<u8>>, LineTooLong> {
        let pending = self.pending();
        match memchr::memchr(b'\n', pending) {
            Some(idx) if idx >= max => Err(LineTooLong { len: idx + 1, max }),
            Some(idx) => {
                let line = pending[..=idx].to_vec();
                self.advance(idx + 1);
                Ok(Some(line))
            }
            None if pending.len() >= max => Err(LineTooLong {
                len: pending.len(),
                max,
            }),
            None => Ok(None),
        }
    }

    /// The bytes that have been appended but not yet consumed
    pub fn pending(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub fn available(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_drained(&self) -> bool {
        self.offset == self.data.len()
    }

    /// Mark `n` pending bytes as consumed.
    /// `n` is clamped to the number of pending bytes.
    pub fn advance(&mut self, n: usize) {
        self.offset += n.min(self.available());
        self.compact_if_drained();
    }

    pub fn compact_if_drained(&mut self) {
        if self.offset == self.data.len() {
            self.data.clear();
            self.offset = 0;
            if self.data.capacity() > RETAIN_CAPACITY {
                self.data.shrink_to(RETAIN_CAPACITY / 4);
            }
        }
    }

    /// Extend the buffer by `n` zeroed bytes and return them so that
    /// a reader can fill them in place. Must be followed by
    /// `commit_tail` with the number of bytes actually filled.
    pub fn reserve_tail(&mut self, n: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + n, 0);
        &mut self.data[start..]
    }

    /// Keep the first `filled` bytes of the region returned by
    /// the preceding `reserve_tail(n)` call and discard the rest.
    pub fn commit_tail(&mut self, n: usize, filled: usize) {
        let len = self.data.len() - n + filled.min(n);
        self.data.truncate(len);
        self.compact_if_drained();
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}
