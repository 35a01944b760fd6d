//! Per-connection bump+shrink memory pool.
//!
//! A single fixed-size buffer split into a head region, which grows forward
//! from byte 0, and a tail region, which grows backward from the end. Both
//! regions only ever resize their *most recent* allocation in place; anything
//! older is immutable until the whole pool is reset. This mirrors how the
//! connection actually uses memory: a read buffer that grows as more of the
//! request arrives (head) and a write buffer that grows as the response is
//! assembled (tail), with nothing else competing for space in between.
//!
//! Allocations are handed out as `(offset, len)` pairs into the pool's own
//! buffer rather than as raw pointers or borrowed slices, so the pool never
//! has more than one mutable borrow of its backing storage outstanding and
//! stays entirely safe code.

use std::fmt;

/// A handle into a [`Pool`]'s backing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    offset: usize,
    len: usize,
}

impl Handle {
    pub const EMPTY: Handle = Handle { offset: 0, len: 0 };

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// From which end of the pool an allocation should be carved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    Head,
    Tail,
}

/// Error returned when an allocation or resize cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSpace {
    /// How many additional free bytes would have been needed.
    pub shortfall: usize,
}

impl fmt::Display for OutOfSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool exhausted, {} more bytes needed", self.shortfall)
    }
}

impl std::error::Error for OutOfSpace {}

/// A contiguous byte region bump-allocated from both ends.
pub struct Pool {
    buffer: Box<[u8]>,
    head_len: usize,
    tail_len: usize,
    last_head: Option<Handle>,
    last_tail: Option<Handle>,
}

impl Pool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            head_len: 0,
            tail_len: 0,
            last_head: None,
            last_tail: None,
        }
    }

    /// Resets both cursors to empty, zeroing the buffer. Called between
    /// keep-alive turns once the request/response for the previous turn is
    /// fully drained.
    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.head_len = 0;
        self.tail_len = 0;
        self.last_head = None;
        self.last_tail = None;
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub fn get_free(&self) -> usize {
        self.buffer.len() - self.head_len - self.tail_len
    }

    /// Allocates `n` bytes from the requested end. Fails without side
    /// effects if there isn't room.
    pub fn allocate(&mut self, n: usize, from: End) -> Result<Handle, OutOfSpace> {
        let free = self.get_free();
        if n > free {
            return Err(OutOfSpace { shortfall: n - free });
        }

        let handle = match from {
            End::Head => {
                let offset = self.head_len;
                self.head_len += n;
                Handle { offset, len: n }
            }
            End::Tail => {
                self.tail_len += n;
                let offset = self.buffer.len() - self.tail_len;
                Handle { offset, len: n }
            }
        };

        match from {
            End::Head => self.last_head = Some(handle),
            End::Tail => self.last_tail = Some(handle),
        }
        Ok(handle)
    }

    /// Same as [`Self::allocate`] but named for readability at call sites
    /// that want to make the fallible attempt explicit before giving up.
    #[inline(always)]
    pub fn try_allocate(&mut self, n: usize, from: End) -> Result<Handle, OutOfSpace> {
        self.allocate(n, from)
    }

    /// True iff `handle` is the most recent allocation from its own end,
    /// and therefore eligible for in-place resize.
    pub fn is_resizable_inplace(&self, handle: Handle, from: End) -> bool {
        match from {
            End::Head => self.last_head == Some(handle),
            End::Tail => self.last_tail == Some(handle),
        }
    }

    /// Resizes the last allocation from the given end in place. Shrinking
    /// always succeeds; growing fails if there isn't enough free space.
    pub fn reallocate(
        &mut self,
        handle: Handle,
        new_len: usize,
        from: End,
    ) -> Result<Handle, OutOfSpace> {
        if !self.is_resizable_inplace(handle, from) {
            return Err(OutOfSpace { shortfall: 0 });
        }

        if new_len <= handle.len {
            let shrunk = Handle { offset: handle.offset, len: new_len };
            match from {
                End::Head => {
                    self.head_len -= handle.len - new_len;
                    self.last_head = Some(shrunk);
                }
                End::Tail => {
                    // Tail grows toward offset 0, so shrinking moves the
                    // start forward but the logical content (bytes appended
                    // from the end) keeps the same trailing offset.
                    self.tail_len -= handle.len - new_len;
                    self.last_tail = Some(Handle {
                        offset: self.buffer.len() - self.tail_len,
                        len: new_len,
                    });
                }
            }
            return Ok(*match from {
                End::Head => self.last_head.as_ref().unwrap(),
                End::Tail => self.last_tail.as_ref().unwrap(),
            });
        }

        let grow_by = new_len - handle.len;
        let free = self.get_free();
        if grow_by > free {
            return Err(OutOfSpace { shortfall: grow_by - free });
        }

        match from {
            End::Head => {
                self.head_len += grow_by;
                let grown = Handle { offset: handle.offset, len: new_len };
                self.last_head = Some(grown);
                Ok(grown)
            }
            End::Tail => {
                self.tail_len += grow_by;
                let grown = Handle { offset: self.buffer.len() - self.tail_len, len: new_len };
                self.last_tail = Some(grown);
                Ok(grown)
            }
        }
    }

    /// Releases a trailing allocation from the given end. Only valid for
    /// the most recent allocation from that end.
    pub fn deallocate(&mut self, handle: Handle, from: End) {
        if !self.is_resizable_inplace(handle, from) {
            return;
        }
        match from {
            End::Head => {
                self.head_len -= handle.len;
                self.last_head = None;
            }
            End::Tail => {
                self.tail_len -= handle.len;
                self.last_tail = None;
            }
        }
    }

    #[inline(always)]
    pub fn get(&self, handle: Handle) -> &[u8] {
        &self.buffer[handle.offset..handle.offset + handle.len]
    }

    #[inline(always)]
    pub fn get_mut(&mut self, handle: Handle) -> &mut [u8] {
        &mut self.buffer[handle.offset..handle.offset + handle.len]
    }

    /// Shifts the still-unconsumed tail of the head allocation back to
    /// offset 0, reclaiming everything in front of it. Used after headers
    /// are fully parsed and only a small read-ahead remains.
    pub fn shift_head_left(&mut self, handle: Handle, keep_from: usize) -> Handle {
        debug_assert!(self.is_resizable_inplace(handle, End::Head));
        let keep_len = handle.len - keep_from;
        self.buffer.copy_within(handle.offset + keep_from..handle.offset + handle.len, 0);
        self.head_len = keep_len;
        let shifted = Handle { offset: 0, len: keep_len };
        self.last_head = Some(shifted);
        shifted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_and_tail_independent() {
        let mut pool = Pool::new(16);
        let h = pool.allocate(4, End::Head).unwrap();
        let t = pool.allocate(4, End::Tail).unwrap();
        assert_eq!(pool.get_free(), 8);
        assert_ne!(h, t);
    }

    #[test]
    fn exhausts_and_reports_shortfall() {
        let mut pool = Pool::new(8);
        pool.allocate(6, End::Head).unwrap();
        let err = pool.allocate(4, End::Tail).unwrap_err();
        assert_eq!(err.shortfall, 2);
    }

    #[test]
    fn reallocate_last_head_grows_in_place() {
        let mut pool = Pool::new(16);
        let h = pool.allocate(4, End::Head).unwrap();
        let grown = pool.reallocate(h, 10, End::Head).unwrap();
        assert_eq!(grown.len(), 10);
        assert_eq!(pool.get_free(), 6);
    }

    #[test]
    fn reallocate_non_last_fails() {
        let mut pool = Pool::new(16);
        let first = pool.allocate(4, End::Head).unwrap();
        pool.allocate(4, End::Head).unwrap();
        assert!(pool.reallocate(first, 8, End::Head).is_err());
    }

    #[test]
    fn reallocate_shrinks_always() {
        let mut pool = Pool::new(16);
        let h = pool.allocate(10, End::Head).unwrap();
        let shrunk = pool.reallocate(h, 2, End::Head).unwrap();
        assert_eq!(shrunk.len(), 2);
        assert_eq!(pool.get_free(), 14);
    }

    #[test]
    fn deallocate_trailing_head() {
        let mut pool = Pool::new(16);
        let h = pool.allocate(6, End::Head).unwrap();
        pool.deallocate(h, End::Head);
        assert_eq!(pool.get_free(), 16);
    }

    #[test]
    fn reset_clears_everything() {
        let mut pool = Pool::new(16);
        pool.allocate(6, End::Head).unwrap();
        pool.allocate(4, End::Tail).unwrap();
        pool.reset();
        assert_eq!(pool.get_free(), 16);
    }

    #[test]
    fn shift_head_left_reclaims_consumed_prefix() {
        let mut pool = Pool::new(16);
        let h = pool.allocate(10, End::Head).unwrap();
        pool.get_mut(h).copy_from_slice(b"0123456789");
        let shifted = pool.shift_head_left(h, 7);
        assert_eq!(pool.get(shifted), b"789");
        assert_eq!(pool.get_free(), 13);
    }
}
