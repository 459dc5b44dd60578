use std::fmt::Debug;
use std::io::{Error, ErrorKind, Result};

/// A bounded byte queue backing the per-connection send and receive buffers.
///
/// Storage starts empty and grows by doubling, up to `max_size`. Data is
/// addressed by a logical offset from the read position; the physical layout
/// may wrap around the end of the allocation. Out-of-order reassembly writes
/// through [`RingBuffer::put_at`], which may leave unwritten gaps below
/// `used`.
pub(crate) struct RingBuffer {
    data: Vec<u8>,
    off: usize,
    used: usize,
    max: usize,
}

const INITIAL_SIZE: usize = 4096;

impl RingBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            data: Vec::new(),
            off: 0,
            used: 0,
            max,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn set_max_size(&mut self, max: usize) {
        self.max = max;
    }

    /// Free space left before `max_size` is hit.
    pub fn free(&self) -> usize {
        self.max.saturating_sub(self.used)
    }

    /// Grows the physical storage to `newsize`, keeping the live region
    /// addressable from the (possibly shifted) read offset.
    fn resize(&mut self, newsize: usize) -> Result<()> {
        let oldsize = self.data.len();
        // Whether the data wraps must be judged against the old physical
        // end, before the allocation grows.
        let wrapped = oldsize - self.off < self.used;

        self.data
            .try_reserve_exact(newsize - oldsize)
            .map_err(|_| Error::new(ErrorKind::OutOfMemory, "buffer allocation failed"))?;
        self.data.resize(newsize, 0);

        if wrapped {
            // The tail segment sat against the old physical end. Shift it so
            // the buffer stays contiguous from the new offset:
            // [345......012] -> [345.........|........012]
            let tail = oldsize - self.off;
            let newoff = newsize - tail;
            self.data.copy_within(self.off..oldsize, newoff);
            self.off = newoff;
        }

        Ok(())
    }

    /// Writes `data` at logical `offset`, growing storage as needed. Bytes
    /// past `max_size` are silently not stored; the count actually stored is
    /// returned. An offset at or past `max_size` stores nothing.
    pub fn put_at(&mut self, offset: usize, data: &[u8]) -> Result<usize> {
        let mut len = data.len();
        let mut required = offset + len;

        if required > self.max {
            if offset >= self.max {
                return Ok(0);
            }

            len = self.max - offset;
            required = self.max;
        }

        if required > self.data.len() {
            let mut newsize = self.data.len();

            if newsize == 0 {
                newsize = INITIAL_SIZE;
            }

            while newsize < required {
                newsize *= 2;
            }

            self.resize(newsize.min(self.max))?;
        }

        let size = self.data.len();
        let mut real = self.off + offset;

        if size - self.off <= offset {
            real -= size;
        }

        if size - real < len {
            let head = size - real;
            self.data[real..].copy_from_slice(&data[..head]);
            self.data[..len - head].copy_from_slice(&data[head..len]);
        } else {
            self.data[real..real + len].copy_from_slice(&data[..len]);
        }

        if required > self.used {
            self.used = required;
        }

        Ok(len)
    }

    /// Appends `data` after the last used byte.
    pub fn put(&mut self, data: &[u8]) -> Result<usize> {
        self.put_at(self.used, data)
    }

    /// Non-destructive copy-out of up to `dst.len()` bytes starting at
    /// logical `offset`. Returns the count copied.
    pub fn copy_to(&self, dst: &mut [u8], offset: usize) -> usize {
        if offset >= self.used {
            return 0;
        }

        let len = dst.len().min(self.used - offset);
        let size = self.data.len();
        let mut real = self.off + offset;

        if size - self.off <= offset {
            real -= size;
        }

        if size - real < len {
            let head = size - real;
            dst[..head].copy_from_slice(&self.data[real..]);
            dst[head..len].copy_from_slice(&self.data[..len - head]);
        } else {
            dst[..len].copy_from_slice(&self.data[real..real + len]);
        }

        len
    }

    /// The stored range `[offset, offset + len)` as at most two physical
    /// slices. The second slice is empty unless the range wraps.
    pub fn slices(&self, offset: usize, len: usize) -> (&[u8], &[u8]) {
        if offset >= self.used {
            return (&[], &[]);
        }

        let len = len.min(self.used - offset);
        let size = self.data.len();
        let mut real = self.off + offset;

        if size - self.off <= offset {
            real -= size;
        }

        if size - real < len {
            let head = size - real;
            (&self.data[real..], &self.data[..len - head])
        } else {
            (&self.data[real..real + len], &[])
        }
    }

    /// Drops `len` bytes from the front, advancing the read offset.
    pub fn discard(&mut self, len: usize) -> usize {
        let len = len.min(self.used);

        if self.used == len {
            self.off = 0;
        } else {
            self.off = (self.off + len) % self.data.len();
        }

        self.used -= len;
        len
    }

    pub fn clear(&mut self) {
        self.off = 0;
        self.used = 0;
    }
}

impl Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RingBuffer [used {} / size {} / max {}]",
            self.used,
            self.data.len(),
            self.max
        )
    }
}
