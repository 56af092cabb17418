//! Fixed-capacity I/O buffers.
//!
//! Both directions of the protocol stream run through one buffer each. They
//! never grow past [`CAPACITY`]: an input frame that cannot fit is a framing
//! failure, and output that the controller refuses to read fast enough ends
//! the session. Consumed prefixes are compacted away so the free region
//! stays contiguous.

pub const CAPACITY: usize = 8192;

/// Handlers flush the output buffer opportunistically once it holds more
/// than a quarter of its capacity, so a burst of small frames cannot starve
/// the stream while the loop is busy.
pub const DRAIN_WATERMARK: usize = CAPACITY / 4;

pub struct InBuf {
    data: Box<[u8]>,
    off: usize,
    used: usize,
}

impl InBuf {
    pub fn new() -> InBuf {
        InBuf {
            data: vec![0u8; CAPACITY].into_boxed_slice(),
            off: 0,
            used: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.used
    }

    pub fn avail(&self) -> usize {
        self.data.len() - self.off - self.used
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.off..self.off + self.used]
    }

    pub fn free_mut(&mut self) -> &mut [u8] {
        let start = self.off + self.used;
        &mut self.data[start..]
    }

    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.avail());
        self.used += n;
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.used);
        self.off += n;
        self.used -= n;
    }

    pub fn compact(&mut self) {
        if self.off > 0 {
            self.data.copy_within(self.off..self.off + self.used, 0);
            self.off = 0;
        }
    }
}

pub struct OutBuf {
    data: Vec<u8>,
    off: usize,
}

impl OutBuf {
    pub fn new() -> OutBuf {
        OutBuf {
            data: Vec::with_capacity(CAPACITY),
            off: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.off
    }

    pub fn pending(&self) -> &[u8] {
        &self.data[self.off..]
    }

    /// Append target for the codec. The caller checks [`Self::over_capacity`]
    /// after encoding a frame.
    pub fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.off += n;
        if self.off == self.data.len() {
            self.data.clear();
            self.off = 0;
        }
    }

    pub fn compact(&mut self) {
        if self.off > 0 {
            self.data.drain(..self.off);
            self.off = 0;
        }
    }

    pub fn over_capacity(&self) -> bool {
        self.len() > CAPACITY
    }
}
