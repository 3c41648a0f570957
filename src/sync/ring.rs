//! Byte ring buffer over caller-supplied storage
//!
//! Shared by the pipe (arbitrary byte counts) and the message queue
//! (whole messages, so a message never straddles the wrap point unless the
//! buffer is not a multiple of the message size). Not synchronized; the
//! owning primitive guards it with its lock.

/// Ring buffer over a borrowed byte slice
pub struct ByteRing<'a> {
    buffer: &'a mut [u8],
    read: usize,
    write: usize,
    used: usize,
}

impl<'a> ByteRing<'a> {
    /// Empty ring using all of `buffer`
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            read: 0,
            write: 0,
            used: 0,
        }
    }

    /// Total storage in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Unread bytes
    pub fn len(&self) -> usize {
        self.used
    }

    /// Free bytes
    pub fn free(&self) -> usize {
        self.capacity() - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity()
    }

    /// Copy as much of `data` as fits; returns the number of bytes taken
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let cap = self.capacity();
        let first = n.min(cap - self.write);
        self.buffer[self.write..self.write + first].copy_from_slice(&data[..first]);
        self.buffer[..n - first].copy_from_slice(&data[first..n]);
        if n > 0 {
            self.write = (self.write + n) % cap;
        }
        self.used += n;
        n
    }

    /// Copy up to `out.len()` unread bytes starting `offset` bytes past the
    /// read cursor, without consuming them
    pub fn peek_at(&self, offset: usize, out: &mut [u8]) -> usize {
        if offset >= self.used {
            return 0;
        }
        let n = out.len().min(self.used - offset);
        let cap = self.capacity();
        let start = (self.read + offset) % cap;
        let first = n.min(cap - start);
        out[..first].copy_from_slice(&self.buffer[start..start + first]);
        out[first..n].copy_from_slice(&self.buffer[..n - first]);
        n
    }

    /// Copy out and consume up to `out.len()` bytes
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek_at(0, out);
        if n > 0 {
            self.read = (self.read + n) % self.capacity();
        }
        self.used -= n;
        n
    }

    /// Drop every unread byte and rewind both cursors
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.used = 0;
    }
}
