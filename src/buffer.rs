//! Growable byte buffer with an explicit fill/drain cycle.

/// Minimum amount a buffer grows by when it runs out of space.
pub const MIN_GROWTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Appending at `lim`, unread content is `buf[0..lim]`.
    Fill,
    /// Reading from `pos`, unread content is `buf[pos..lim]`.
    Drain,
}

/// Byte accumulator with a write cursor and a flip/compact discipline.
///
/// Data is appended in fill mode, [`flip`](Self::flip)ped to drain mode to be read
/// out, then [`compact`](Self::compact)ed back to fill mode retaining the unread
/// remainder at the front. Capacity only ever grows.
#[derive(Debug)]
pub struct BufferWindow {
    buf: Vec<u8>,
    pos: usize,
    lim: usize,
    mode: Mode,
}

impl BufferWindow {
    /// Create a buffer with an initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        BufferWindow {
            buf: vec![0; capacity],
            pos: 0,
            lim: 0,
            mode: Mode::Fill,
        }
    }

    /// Total allocated bytes.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unread bytes held.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.lim - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes that can be appended without growing (after compaction).
    pub fn free(&self) -> usize {
        self.buf.len() - self.len()
    }

    /// Guarantee at least `n` free bytes at the write cursor.
    ///
    /// When the current free space is insufficient, the buffer is reallocated to
    /// `len() + max(n, MIN_GROWTH)` with the unread content copied to the front.
    pub fn ensure_capacity(&mut self, n: usize) {
        self.compact();

        if self.buf.len() - self.lim >= n {
            return;
        }

        let remaining = self.len();
        let mut grown = vec![0; remaining + n.max(MIN_GROWTH)];
        grown[..remaining].copy_from_slice(&self.buf[..remaining]);

        trace!("BufferWindow grow {} -> {}", self.buf.len(), grown.len());

        self.buf = grown;
    }

    /// Append bytes in fill mode, growing if needed.
    pub fn append(&mut self, src: &[u8]) {
        if src.is_empty() {
            return;
        }
        self.ensure_capacity(src.len());

        let end = self.lim + src.len();
        self.buf[self.lim..end].copy_from_slice(src);
        self.lim = end;
    }

    /// Free space at the write cursor, at least `min` bytes. Follow up with
    /// [`advance`](Self::advance) for the bytes actually written.
    pub fn spare_mut(&mut self, min: usize) -> &mut [u8] {
        self.ensure_capacity(min);
        &mut self.buf[self.lim..]
    }

    /// Mark `amount` bytes of the spare space as filled.
    pub fn advance(&mut self, amount: usize) {
        assert!(self.lim + amount <= self.buf.len(), "BufferWindow::advance past capacity");
        self.lim += amount;
    }

    /// Switch to drain mode.
    pub fn flip(&mut self) {
        self.mode = Mode::Drain;
    }

    /// Move unread content to the front and go back to fill mode.
    pub fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.lim, 0);
            self.lim -= self.pos;
            self.pos = 0;
        }
        self.mode = Mode::Fill;
    }

    /// Unread content.
    pub fn chunk(&self) -> &[u8] {
        &self.buf[self.pos..self.lim]
    }

    /// Mark `amount` bytes of the unread content as read.
    pub fn consume(&mut self, amount: usize) {
        assert!(amount <= self.len(), "BufferWindow::consume past end");
        if self.mode == Mode::Fill {
            self.flip();
        }
        self.pos += amount;
        if self.pos == self.lim {
            self.pos = 0;
            self.lim = 0;
            self.mode = Mode::Fill;
        }
    }

    /// Drain into a sink that accepts as much as it can.
    ///
    /// The sink returns how many bytes it took, `0` meaning it can take no more right
    /// now. Leftovers are compacted to the front. Returns the total bytes drained.
    pub fn drain<F, E>(&mut self, mut sink: F) -> Result<usize, E>
    where
        F: FnMut(&[u8]) -> Result<usize, E>,
    {
        self.flip();

        let mut total = 0;

        let result = loop {
            if self.pos == self.lim {
                break Ok(());
            }

            match sink(&self.buf[self.pos..self.lim]) {
                Ok(0) => break Ok(()),
                Ok(amount) => {
                    // invariant: a sink can't take more than offered.
                    assert!(amount <= self.lim - self.pos);
                    self.pos += amount;
                    total += amount;
                }
                Err(e) => break Err(e),
            }
        };

        self.compact();

        result.map(|_| total)
    }

    /// Copy out as much as fits in `dst`.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut offset = 0;
        let res: Result<usize, ()> = self.drain(|src| {
            let max = src.len().min(dst.len() - offset);
            dst[offset..offset + max].copy_from_slice(&src[..max]);
            offset += max;
            Ok(max)
        });
        res.unwrap_or(0)
    }

    /// Drop all unread content, keeping the allocation.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.lim = 0;
        self.mode = Mode::Fill;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_grows_only_when_full() {
        let mut b = BufferWindow::with_capacity(8);
        b.append(b"12345678");
        assert_eq!(b.capacity(), 8);
        assert_eq!(b.free(), 0);

        b.append(b"9");
        assert_eq!(b.capacity(), 8 + MIN_GROWTH);
        assert_eq!(b.chunk(), b"123456789");
    }

    #[test]
    fn ensure_capacity_counts_unread_only() {
        let mut b = BufferWindow::with_capacity(16);
        b.append(b"0123456789");
        b.consume(8);

        // 14 free after compaction, no growth needed.
        b.ensure_capacity(14);
        assert_eq!(b.capacity(), 16);
        assert_eq!(b.chunk(), b"89");

        b.ensure_capacity(2000);
        assert_eq!(b.capacity(), 2 + 2000);
        assert_eq!(b.chunk(), b"89");
    }

    #[test]
    fn drain_partial_sink_keeps_remainder() {
        let mut b = BufferWindow::with_capacity(4);
        b.append(b"hello world");

        let mut out = vec![];
        let n: Result<usize, ()> = b.drain(|src| {
            let take = src.len().min(3);
            if out.len() >= 6 {
                return Ok(0);
            }
            out.extend_from_slice(&src[..take]);
            Ok(take)
        });

        assert_eq!(n, Ok(6));
        assert_eq!(out, b"hello ");
        assert_eq!(b.chunk(), b"world");
    }

    #[test]
    fn drain_error_compacts() {
        let mut b = BufferWindow::with_capacity(4);
        b.append(b"abcdef");

        let mut first = true;
        let res: Result<usize, &str> = b.drain(|_| {
            if first {
                first = false;
                Ok(2)
            } else {
                Err("boom")
            }
        });

        assert_eq!(res, Err("boom"));
        assert_eq!(b.chunk(), b"cdef");
        b.append(b"g");
        assert_eq!(b.chunk(), b"cdefg");
    }

    #[test]
    fn interleaved_ops_preserve_order() {
        let mut rng = fastrand::Rng::with_seed(42);
        let mut b = BufferWindow::with_capacity(7);

        let mut appended = vec![];
        let mut drained = vec![];
        let mut next = 0_u8;

        for _ in 0..2000 {
            match rng.u8(0..4) {
                0 => {
                    let n = rng.usize(0..50);
                    let chunk: Vec<u8> = (0..n)
                        .map(|_| {
                            next = next.wrapping_add(1);
                            next
                        })
                        .collect();
                    appended.extend_from_slice(&chunk);
                    b.append(&chunk);
                }
                1 => b.ensure_capacity(rng.usize(0..100)),
                2 => {
                    // sink that accepts a single write of up to `max` bytes.
                    let mut max = rng.usize(1..40);
                    let _: Result<usize, ()> = b.drain(|src| {
                        let take = src.len().min(max);
                        drained.extend_from_slice(&src[..take]);
                        max = 0;
                        Ok(take)
                    });
                }
                _ => {
                    b.flip();
                    b.compact();
                }
            }
        }

        let mut rest = vec![0; b.len()];
        b.read(&mut rest);
        drained.extend_from_slice(&rest);

        assert_eq!(appended, drained);
        assert!(b.is_empty());
    }
}
