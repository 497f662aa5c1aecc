//! Fixed-capacity circular buffers for the audio thread
//!
//! Storage is allocated once in [`RingBuffer::prepare`]; every other method is
//! allocation-free and O(1) per element, so the buffers can be used freely
//! inside `process()`.
//!
//! Overflow policy is overwrite-oldest: pushing into a full buffer drops the
//! oldest element and the push reports how many were dropped. The MIDI queue
//! does not use these buffers (it must reject on full, see `midi`).
//!
//! [`PlanarRingBuffer`] keeps one ring per channel with a shared fill level,
//! which is the layout the FFT-based processor wants.

/// Single-channel ring buffer of `Copy` elements
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buffer: Vec<T>,
    read_pos: usize,
    len: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create an empty buffer with zero capacity (call `prepare` before use)
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            read_pos: 0,
            len: 0,
        }
    }

    /// Create a buffer with the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let mut ring = Self::new();
        ring.prepare(capacity);
        ring
    }

    /// (Re)allocate storage. Not real-time safe.
    pub fn prepare(&mut self, capacity: usize) {
        self.buffer = vec![T::default(); capacity];
        self.read_pos = 0;
        self.len = 0;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free slots before a push starts overwriting
    #[inline]
    pub fn space(&self) -> usize {
        self.buffer.len() - self.len
    }

    /// Drop all contents (keeps storage)
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.len = 0;
    }

    /// Append one element; returns true if the oldest element was overwritten
    #[inline]
    pub fn push(&mut self, value: T) -> bool {
        let cap = self.buffer.len();
        if cap == 0 {
            return true;
        }
        let write_pos = (self.read_pos + self.len) % cap;
        self.buffer[write_pos] = value;
        if self.len == cap {
            self.read_pos = (self.read_pos + 1) % cap;
            true
        } else {
            self.len += 1;
            false
        }
    }

    /// Append a slice; returns the number of old elements overwritten
    pub fn push_slice(&mut self, values: &[T]) -> usize {
        values.iter().filter(|&&v| self.push(v)).count()
    }

    /// Remove and return the oldest element
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.buffer[self.read_pos];
        self.read_pos = (self.read_pos + 1) % self.buffer.len();
        self.len -= 1;
        Some(value)
    }

    /// Pop up to `out.len()` elements into `out`, returning how many were written
    pub fn pop_into(&mut self, out: &mut [T]) -> usize {
        let count = out.len().min(self.len);
        for (i, slot) in out.iter_mut().take(count).enumerate() {
            *slot = self.buffer[(self.read_pos + i) % self.buffer.len()];
        }
        self.discard(count);
        count
    }

    /// Look at the element `offset` positions after the read position
    /// without consuming anything
    #[inline]
    pub fn peek(&self, offset: usize) -> Option<T> {
        if offset < self.len {
            Some(self.buffer[(self.read_pos + offset) % self.buffer.len()])
        } else {
            None
        }
    }

    /// Like `peek`, but positions past the end read as `T::default()`
    #[inline]
    pub fn peek_or_default(&self, offset: usize) -> T {
        self.peek(offset).unwrap_or_default()
    }

    /// Drop up to `count` of the oldest elements, returning how many were dropped
    #[inline]
    pub fn discard(&mut self, count: usize) -> usize {
        let count = count.min(self.len);
        if count > 0 {
            self.read_pos = (self.read_pos + count) % self.buffer.len();
            self.len -= count;
        }
        count
    }
}

impl<T: Copy + Default> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Multi-channel ring buffer with one plane per channel
///
/// All planes always hold the same number of frames.
#[derive(Debug, Clone, Default)]
pub struct PlanarRingBuffer {
    planes: Vec<RingBuffer<f32>>,
}

impl PlanarRingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)allocate `channels` planes of `capacity` frames. Not real-time safe.
    pub fn prepare(&mut self, channels: usize, capacity: usize) {
        self.planes = (0..channels)
            .map(|_| RingBuffer::with_capacity(capacity))
            .collect();
    }

    /// Frames currently stored
    #[inline]
    pub fn len(&self) -> usize {
        self.planes.first().map_or(0, RingBuffer::len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for plane in &mut self.planes {
            plane.clear();
        }
    }

    /// Append one frame; missing channels in `frame` are written as silence.
    /// Returns true if the oldest frame was overwritten.
    #[inline]
    pub fn push_frame(&mut self, frame: &[f32]) -> bool {
        let mut overwritten = false;
        for (ch, plane) in self.planes.iter_mut().enumerate() {
            overwritten |= plane.push(frame.get(ch).copied().unwrap_or(0.0));
        }
        overwritten
    }

    /// Borrow one channel plane
    #[inline]
    pub fn plane(&self, channel: usize) -> Option<&RingBuffer<f32>> {
        self.planes.get(channel)
    }

    /// Drop `count` frames from every plane
    pub fn discard(&mut self, count: usize) -> usize {
        let mut dropped = 0;
        for plane in &mut self.planes {
            dropped = plane.discard(count);
        }
        dropped
    }
}
