//! A power-of-two circular byte buffer, grounded on `buffer.c` from the
//! original implementation. The original builds a two-segment `iovec` pair
//! and hands it to `readv`/`writev`/`recvmsg`/`sendmsg` so a single syscall
//! can fill or drain the ring even when the live region straddles the wrap
//! point; `tokio`'s `AsyncRead`/`AsyncWrite` traits don't expose vectored
//! I/O access the same way, so this port keeps the two-segment addressing
//! internally (`segments`/`segments_mut`) and drives plain `poll_read`/
//! `poll_write` against each segment in turn instead of a single `readv`.

#[cfg(test)]
use std::collections::VecDeque;
use std::time::Instant;

/// Default and minimum buffer size, per spec §3 ("default 4096; may double").
pub const DEFAULT_SIZE: usize = 4096;

/// A power-of-two ring buffer with scatter-gather segment access.
///
/// Invariants (spec §3): `len <= size`, `head < size`, `size` is a power of
/// two.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    len: usize,
    max_size: usize,
    tx_bytes: u64,
    rx_bytes: u64,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        let size = DEFAULT_SIZE.min(max_size.next_power_of_two());
        Buffer {
            data: vec![0u8; size],
            head: 0,
            len: 0,
            max_size: max_size.next_power_of_two(),
            tx_bytes: 0,
            rx_bytes: 0,
            last_send: None,
            last_recv: None,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of free room available without growing.
    pub fn room(&self) -> usize {
        self.data.len() - self.len
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn last_recv(&self) -> Option<Instant> {
        self.last_recv
    }

    pub fn note_send(&mut self, n: usize, now: Instant) {
        self.tx_bytes += n as u64;
        self.last_send = Some(now);
    }

    pub fn note_recv(&mut self, n: usize, now: Instant) {
        self.rx_bytes += n as u64;
        self.last_recv = Some(now);
    }

    /// Grow the ring to the next power of two `>= requested`, up to
    /// `max_size`. Fails (returns `false`, no-op) if `requested < len` or the
    /// cap would be exceeded, matching `buffer_resize`'s refusal to shrink
    /// below the live region.
    pub fn resize(&mut self, requested: usize) -> bool {
        if requested < self.len {
            return false;
        }
        let new_size = requested.next_power_of_two().max(DEFAULT_SIZE);
        if new_size > self.max_size {
            return false;
        }
        if new_size <= self.data.len() {
            return true;
        }
        let mut new_data = vec![0u8; new_size];
        let coalesced = self.coalesce();
        new_data[..coalesced.len()].copy_from_slice(coalesced);
        self.data = new_data;
        self.head = 0;
        true
    }

    fn grow_to_fit(&mut self, additional: usize) {
        let needed = self.len + additional;
        if needed > self.data.len() {
            self.resize(needed);
        }
    }

    /// Append `src` to the buffer. Fails outright (no partial write) if there
    /// isn't room and growing doesn't make room, matching `buffer_push`'s "no
    /// room" return rather than a short write.
    pub fn push(&mut self, src: &[u8]) -> bool {
        if src.len() > self.room() {
            self.grow_to_fit(src.len());
        }
        if src.len() > self.room() {
            return false;
        }
        let start = (self.head + self.len) & (self.data.len() - 1);
        let end = (start + src.len()) & (self.data.len() - 1);
        if end > start || src.is_empty() {
            self.data[start..start + src.len()].copy_from_slice(src);
        } else {
            let first = self.data.len() - start;
            self.data[start..].copy_from_slice(&src[..first]);
            self.data[..src.len() - first].copy_from_slice(&src[first..]);
        }
        self.len += src.len();
        true
    }

    /// Copy up to `dst.len()` bytes without consuming them. Idempotent:
    /// calling twice in a row returns the same bytes.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len);
        let mut copied = 0;
        for (i, seg) in self.segments(n).into_iter().enumerate() {
            let _ = i;
            dst[copied..copied + seg.len()].copy_from_slice(seg);
            copied += seg.len();
        }
        copied
    }

    /// Consume up to `dst.len()` bytes in FIFO order.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.advance_read(n);
        n
    }

    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.head = (self.head + n) & (self.data.len() - 1);
        self.len -= n;
    }

    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(n <= self.room());
        self.len += n;
    }

    /// The up-to-two contiguous slices that make up the first `len_hint`
    /// (or all, if 0) readable bytes, oldest first. Mirrors
    /// `setup_read_iov`.
    pub fn segments(&self, len_hint: usize) -> Vec<&[u8]> {
        if self.len == 0 {
            return vec![];
        }
        let want = if len_hint == 0 {
            self.len
        } else {
            len_hint.min(self.len)
        };
        let end = (self.head + want) & (self.data.len() - 1);
        if end > self.head || want == 0 {
            vec![&self.data[self.head..self.head + want]]
        } else {
            vec![&self.data[self.head..], &self.data[..end]]
        }
    }

    /// The up-to-two writable slices that make up the first `len_hint` (or
    /// all remaining room, if 0) bytes of free space. Mirrors
    /// `setup_write_iov`. Does not grow the buffer.
    pub fn write_segments(&mut self, len_hint: usize) -> Vec<&mut [u8]> {
        let room = self.room();
        if room == 0 {
            return vec![];
        }
        let want = if len_hint == 0 { room } else { len_hint.min(room) };
        let start = (self.head + self.len) & (self.data.len() - 1);
        let end = (start + want) & (self.data.len() - 1);
        if end > start || want == 0 {
            vec![&mut self.data[start..start + want]]
        } else {
            let (a, b) = self.data.split_at_mut(start);
            vec![b, &mut a[..end]]
        }
    }

    /// Return a contiguous view of the live region, rotating the backing
    /// storage in place if the data currently straddles the wrap boundary.
    pub fn coalesce(&mut self) -> &[u8] {
        if self.head != 0 && self.len > 0 {
            self.data.rotate_left(self.head);
            self.head = 0;
        } else if self.len == 0 {
            self.head = 0;
        }
        &self.data[..self.len]
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A simple FIFO byte queue used by tests to generate reference behavior
/// independent of the ring's wraparound bookkeeping (see `buffer::tests`).
#[cfg(test)]
pub(crate) struct ReferenceQueue(VecDeque<u8>);

#[cfg(test)]
impl ReferenceQueue {
    fn new() -> Self {
        ReferenceQueue(VecDeque::new())
    }

    fn push(&mut self, data: &[u8]) {
        self.0.extend(data.iter().copied());
    }

    fn pop(&mut self, n: usize) -> Vec<u8> {
        (0..n).filter_map(|_| self.0.pop_front()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_fifo_order() {
        let mut buf = Buffer::new();
        assert!(buf.push(b"hello "));
        assert!(buf.push(b"world"));
        let mut out = [0u8; 11];
        let n = buf.pop(&mut out);
        assert_eq!(n, 11);
        assert_eq!(&out, b"hello world");
    }

    #[test]
    fn len_plus_room_equals_size() {
        let mut buf = Buffer::new();
        let mut reference = ReferenceQueue::new();
        let ops: &[(&[u8], usize)] = &[
            (b"abcdefgh", 3),
            (b"ijklmnopqrstuvwxyz", 5),
            (b"0123456789", 30),
            (b"", 0),
        ];
        for (push, pop_n) in ops {
            buf.push(push);
            reference.push(push);
            assert_eq!(buf.len() + buf.room(), buf.size());

            let mut scratch = vec![0u8; *pop_n];
            let popped = buf.pop(&mut scratch);
            let expected = reference.pop(popped);
            assert_eq!(&scratch[..popped], &expected[..]);
            assert_eq!(buf.len() + buf.room(), buf.size());
        }
    }

    #[test]
    fn peek_is_idempotent() {
        let mut buf = Buffer::new();
        buf.push(b"idempotent");
        let mut a = [0u8; 5];
        let mut b = [0u8; 5];
        buf.peek(&mut a);
        buf.peek(&mut b);
        assert_eq!(a, b);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn wraps_across_boundary() {
        let mut buf = Buffer::with_max_size(16);
        // fill to capacity, drain most of it, then push again so the next
        // push straddles the physical end of the ring.
        assert!(buf.push(&[1u8; 8]));
        let mut sink = [0u8; 6];
        buf.pop(&mut sink);
        assert!(buf.push(&[2u8; 6]));
        let coalesced = buf.coalesce().to_vec();
        assert_eq!(coalesced.len(), 8);
        assert_eq!(&coalesced[..2], &[1u8; 2]);
        assert_eq!(&coalesced[2..], &[2u8; 6]);
    }

    #[test]
    fn push_fails_without_partial_write() {
        let mut buf = Buffer::with_max_size(8);
        assert!(buf.push(&[0u8; 8]));
        assert!(!buf.push(&[1u8; 1]));
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn resize_refuses_to_shrink_below_len() {
        let mut buf = Buffer::with_max_size(4096);
        buf.push(&[0u8; 100]);
        assert!(!buf.resize(32));
        assert_eq!(buf.size(), DEFAULT_SIZE);
    }

    #[test]
    fn grows_on_demand_up_to_max() {
        let mut buf = Buffer::with_max_size(8192);
        assert_eq!(buf.size(), DEFAULT_SIZE);
        assert!(buf.push(&vec![7u8; 4097]));
        assert_eq!(buf.size(), 8192);
        assert!(!buf.push(&vec![7u8; 8192]));
    }
}
