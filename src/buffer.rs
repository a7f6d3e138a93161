use std::io::{self, Read};

/// End-of-header marker for an HTTP request.
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// A fixed-capacity receive buffer with a write cursor.
///
/// Unlike a growable buffer, capacity is a hard limit: once the cursor
/// reaches it, no further bytes are accepted and the caller decides what a
/// full buffer means. Request bytes accumulate here until the header
/// terminator shows up.
pub struct RecvBuffer {
    data: Box<[u8]>,
    filled: usize,
}

impl RecvBuffer {
    /// Create a new buffer with the specified fixed capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Read from a reader into the free region at the write cursor.
    ///
    /// Returns the number of bytes read. Callers must check `is_full` first;
    /// reading into a full buffer would be indistinguishable from EOF.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let bytes_read = reader.read(&mut self.data[self.filled..])?;
        self.filled += bytes_read;
        Ok(bytes_read)
    }

    /// Get the bytes accumulated so far
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    /// Check whether the write cursor has reached capacity
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    /// Get the remaining free capacity
    pub fn remaining(&self) -> usize {
        self.data.len() - self.filled
    }

    /// Get the total capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Check whether the accumulated bytes contain the header terminator
    pub fn has_terminator(&self) -> bool {
        self.filled >= TERMINATOR.len()
            && self.data[..self.filled]
                .windows(TERMINATOR.len())
                .any(|w| w == TERMINATOR)
    }

    /// Reset the write cursor, discarding all accumulated bytes
    pub fn clear(&mut self) {
        self.filled = 0;
    }
}
