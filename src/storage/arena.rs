//! Chunk Arena
//!
//! A fixed-size byte region allocated once per segment and carved into
//! equal chunks. An entry occupies a contiguous run of chunks, found
//! first-fit in a free bitmap. The region never grows: when no run is
//! long enough the caller gets `None` and reports capacity exhaustion.
//!
//! Positions handed out are chunk indices; nothing outside this module
//! sees byte offsets.

/// A run of chunks owned by one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRun {
    pub start: u32,
    pub count: u32,
}

pub struct Arena {
    buf: Box<[u8]>,
    chunk_size: usize,
    chunk_count: usize,
    /// One bit per chunk, set = in use
    used: Box<[u64]>,
    used_chunks: usize,
}

impl Arena {
    /// Allocate `chunk_count` chunks of `chunk_size` bytes
    pub fn new(chunk_count: usize, chunk_size: usize) -> Self {
        debug_assert!(chunk_size > 0, "Precondition: chunk_size must be positive");
        debug_assert!(
            chunk_count < u32::MAX as usize,
            "Precondition: chunk positions must fit in u32"
        );

        let words = chunk_count.div_ceil(64);
        Arena {
            buf: vec![0u8; chunk_count * chunk_size].into_boxed_slice(),
            chunk_size,
            chunk_count,
            used: vec![0u64; words].into_boxed_slice(),
            used_chunks: 0,
        }
    }

    /// Chunks needed to hold `len` bytes
    pub fn chunks_for(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size).max(1)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn used_chunks(&self) -> usize {
        self.used_chunks
    }

    pub fn capacity_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Reserve a run long enough for `len` bytes
    pub fn allocate(&mut self, len: usize) -> Option<ChunkRun> {
        let needed = self.chunks_for(len);
        if needed > self.chunk_count - self.used_chunks {
            return None;
        }

        let start = self.find_free_run(needed)?;
        for chunk in start..start + needed {
            self.set_used(chunk, true);
        }
        self.used_chunks += needed;

        debug_assert!(
            self.used_chunks <= self.chunk_count,
            "Invariant: used chunks cannot exceed arena size"
        );

        Some(ChunkRun {
            start: start as u32,
            count: needed as u32,
        })
    }

    /// Return a run to the free bitmap
    pub fn free(&mut self, run: ChunkRun) {
        let start = run.start as usize;
        let end = start + run.count as usize;
        debug_assert!(end <= self.chunk_count, "Precondition: run out of bounds");

        for chunk in start..end {
            debug_assert!(self.is_used(chunk), "Precondition: double free of chunk {}", chunk);
            self.set_used(chunk, false);
        }
        self.used_chunks -= run.count as usize;
    }

    pub fn bytes(&self, run: ChunkRun) -> &[u8] {
        let (start, end) = self.byte_range(run);
        &self.buf[start..end]
    }

    pub fn bytes_mut(&mut self, run: ChunkRun) -> &mut [u8] {
        let (start, end) = self.byte_range(run);
        &mut self.buf[start..end]
    }

    /// Bytes from the start of chunk `start` to the end of the arena.
    /// Used to read an entry header before its run length is known.
    pub fn tail(&self, start: u32) -> &[u8] {
        &self.buf[start as usize * self.chunk_size..]
    }

    /// Drop the backing buffer. The arena is unusable afterwards.
    pub fn release(&mut self) {
        self.buf = Box::new([]);
        self.used = Box::new([]);
        self.chunk_count = 0;
        self.used_chunks = 0;
    }

    fn byte_range(&self, run: ChunkRun) -> (usize, usize) {
        let start = run.start as usize * self.chunk_size;
        let end = start + run.count as usize * self.chunk_size;
        debug_assert!(end <= self.buf.len(), "Precondition: run out of bounds");
        (start, end)
    }

    fn find_free_run(&self, needed: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        let mut chunk = 0;

        while chunk < self.chunk_count {
            // Skip fully used words quickly
            if chunk % 64 == 0 && chunk + 64 <= self.chunk_count && self.used[chunk / 64] == u64::MAX
            {
                run_len = 0;
                chunk += 64;
                continue;
            }

            if self.is_used(chunk) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = chunk;
                }
                run_len += 1;
                if run_len == needed {
                    return Some(run_start);
                }
            }
            chunk += 1;
        }

        None
    }

    fn is_used(&self, chunk: usize) -> bool {
        self.used[chunk / 64] & (1u64 << (chunk % 64)) != 0
    }

    fn set_used(&mut self, chunk: usize, used: bool) {
        let mask = 1u64 << (chunk % 64);
        if used {
            self.used[chunk / 64] |= mask;
        } else {
            self.used[chunk / 64] &= !mask;
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("chunk_size", &self.chunk_size)
            .field("chunk_count", &self.chunk_count)
            .field("used_chunks", &self.used_chunks)
            .finish()
    }
}
