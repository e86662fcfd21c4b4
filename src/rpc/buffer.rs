//! Connection buffers.
//!
//! [`ReadBuffer`] accumulates inbound bytes until whole frames are available.
//! It doubles when full and halves again once a burst has drained, so a
//! single large message does not pin its memory for the connection's life.
//!
//! [`WriteQueue`] holds encoded frames waiting for the socket to become
//! writable, tracking how much of the front frame has been flushed.

use std::collections::VecDeque;

use crate::error::{DistbuildError, Result};

pub const INITIAL_BUFFER_SIZE: usize = 1024;
pub const MINIMUM_BUFFER_SIZE: usize = 128;
const GROWTH_FACTOR: usize = 2;

#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    /// Start of unconsumed data.
    start: usize,
    /// End of received data.
    end: usize,
    max: usize,
}

impl ReadBuffer {
    pub fn new(max: usize) -> Self {
        Self::with_capacity(INITIAL_BUFFER_SIZE.min(max), max)
    }

    pub fn with_capacity(capacity: usize, max: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
            start: 0,
            end: 0,
            max,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    /// Received bytes not yet consumed.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Free space to read into. Compacts, then grows, when the tail is full.
    ///
    /// Fails with [`DistbuildError::ReadBufferOverflow`] once the buffer is
    /// full of unconsumed data at its maximum size.
    pub fn spare_mut(&mut self) -> Result<&mut [u8]> {
        if self.end == self.buf.len() {
            self.compact();
        }
        if self.end == self.buf.len() {
            let capacity = self.buf.len();
            if capacity >= self.max {
                return Err(DistbuildError::ReadBufferOverflow {
                    needed: capacity + 1,
                    capacity,
                    max: self.max,
                });
            }
            let grown = (capacity * GROWTH_FACTOR).min(self.max);
            self.buf.resize(grown, 0);
            tracing::trace!(from = capacity, to = grown, "Read buffer grown");
        }
        Ok(&mut self.buf[self.end..])
    }

    /// Marks `n` bytes of the slice returned by [`spare_mut`](Self::spare_mut)
    /// as received.
    pub fn did_read(&mut self, n: usize) {
        self.end = (self.end + n).min(self.buf.len());
    }

    /// Drops `n` bytes from the front of the unconsumed data, shrinking the
    /// buffer by half when what remains uses less than a quarter of it.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }

        let capacity = self.buf.len();
        if capacity > MINIMUM_BUFFER_SIZE && self.len() < capacity / 4 {
            self.compact();
            let shrunk = (capacity / GROWTH_FACTOR).max(MINIMUM_BUFFER_SIZE);
            self.buf.truncate(shrunk);
            self.buf.shrink_to_fit();
            tracing::trace!(from = capacity, to = shrunk, "Read buffer shrunk");
        }
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }
}

/// FIFO of outbound frames with a flushed-offset into the front frame.
#[derive(Debug)]
pub struct WriteQueue {
    frames: VecDeque<Vec<u8>>,
    offset: usize,
    queued: usize,
    max: usize,
}

impl WriteQueue {
    pub fn new(max: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            offset: 0,
            queued: 0,
            max,
        }
    }

    pub fn push(&mut self, frame: Vec<u8>) -> Result<()> {
        if self.queued + frame.len() > self.max {
            return Err(DistbuildError::WriteQueueOverflow {
                queued: self.queued + frame.len(),
                max: self.max,
            });
        }
        if frame.is_empty() {
            return Ok(());
        }
        self.queued += frame.len();
        self.frames.push_back(frame);
        Ok(())
    }

    /// The unflushed remainder of the front frame.
    pub fn front_chunk(&self) -> Option<&[u8]> {
        self.frames.front().map(|frame| &frame[self.offset..])
    }

    /// Records that `n` bytes of the front chunk reached the socket.
    pub fn advance(&mut self, n: usize) {
        let Some(front) = self.frames.front() else {
            return;
        };
        let n = n.min(front.len() - self.offset);
        self.offset += n;
        self.queued -= n;
        if self.offset == front.len() {
            self.frames.pop_front();
            self.offset = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(buffer: &mut ReadBuffer, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let spare = buffer.spare_mut()?;
            let n = spare.len().min(bytes.len());
            spare[..n].copy_from_slice(&bytes[..n]);
            buffer.did_read(n);
            bytes = &bytes[n..];
        }
        Ok(())
    }

    #[test]
    fn read_buffer_grows_geometrically() {
        let mut buffer = ReadBuffer::new(1024 * 1024);
        assert_eq!(buffer.capacity(), INITIAL_BUFFER_SIZE);

        fill(&mut buffer, &vec![7u8; 5 * 1024]).unwrap();
        assert_eq!(buffer.len(), 5 * 1024);
        assert_eq!(buffer.capacity(), 8 * 1024);
    }

    #[test]
    fn read_buffer_overflow_at_max() {
        let mut buffer = ReadBuffer::new(4096);
        fill(&mut buffer, &vec![1u8; 4096]).unwrap();
        let err = fill(&mut buffer, &[1u8]).unwrap_err();
        assert!(matches!(
            err,
            DistbuildError::ReadBufferOverflow { max: 4096, .. }
        ));
    }

    #[test]
    fn read_buffer_compacts_before_growing() {
        let mut buffer = ReadBuffer::new(1024 * 1024);
        fill(&mut buffer, &[1u8; 1000]).unwrap();
        buffer.consume(1000 - 24);
        fill(&mut buffer, &[2u8; 1000]).unwrap();
        assert_eq!(buffer.len(), 1024);
        assert_eq!(&buffer.data()[..24], &[1u8; 24]);
    }

    #[test]
    fn read_buffer_shrinks_after_drain() {
        let mut buffer = ReadBuffer::new(1024 * 1024);
        fill(&mut buffer, &vec![0u8; 5 * 1024]).unwrap();
        buffer.consume(5 * 1024);
        assert_eq!(buffer.capacity(), 4 * 1024);

        for _ in 0..8 {
            fill(&mut buffer, &[0u8; 16]).unwrap();
            buffer.consume(16);
        }
        assert_eq!(buffer.capacity(), MINIMUM_BUFFER_SIZE);
    }

    #[test]
    fn write_queue_partial_flush() {
        let mut queue = WriteQueue::new(1024);
        queue.push(b"hello".to_vec()).unwrap();
        queue.push(b"world".to_vec()).unwrap();
        assert_eq!(queue.queued_bytes(), 10);

        queue.advance(3);
        assert_eq!(queue.front_chunk(), Some(&b"lo"[..]));
        queue.advance(2);
        assert_eq!(queue.front_chunk(), Some(&b"world"[..]));
        queue.advance(5);
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn write_queue_rejects_past_max() {
        let mut queue = WriteQueue::new(8);
        queue.push(vec![0; 6]).unwrap();
        assert!(matches!(
            queue.push(vec![0; 3]),
            Err(DistbuildError::WriteQueueOverflow { queued: 9, max: 8 })
        ));
    }
}
