use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;

/// Capacity of every pooled block; matches the copy chunk the forwarder uses
pub const BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOL_SIZE: usize = 256;

/// Pool of fixed-capacity byte blocks used to stream response bodies.
///
/// Chunks handed downstream are frozen slices of a block. Once every such
/// chunk is dropped the block's allocation can be reclaimed in place.
#[derive(Debug)]
pub struct BufferPool {
    blocks: Mutex<Vec<BytesMut>>,
    size: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool handing out `BUFFER_SIZE` blocks
    pub fn new() -> Self {
        Self::with_size(BUFFER_SIZE, MAX_POOL_SIZE)
    }

    pub fn with_size(size: usize, max_idle: usize) -> Self {
        Self {
            blocks: Mutex::new(Vec::with_capacity(max_idle)),
            size,
            max_idle,
        }
    }

    pub fn block_size(&self) -> usize {
        self.size
    }

    /// Get an empty block from the pool or allocate a new one
    pub fn get_buffer(&self) -> BytesMut {
        let pooled = self.blocks.lock().pop();
        pooled.unwrap_or_else(|| BytesMut::with_capacity(self.size))
    }

    /// Return a block for reuse.
    ///
    /// Blocks whose allocation is still shared with live chunks, or whose
    /// capacity is off size, are dropped instead.
    pub fn return_buffer(&self, mut block: BytesMut) {
        block.clear();
        if !block.try_reclaim(self.size) || block.capacity() > self.size * 2 {
            return;
        }

        let mut pool = self.blocks.lock();
        if pool.len() < self.max_idle {
            pool.push(block);
        }
    }

    /// Number of idle blocks currently held
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII lease that returns its block to the pool on drop
#[derive(Debug)]
pub struct BufferLease {
    block: BytesMut,
    pool: Arc<BufferPool>,
}

impl BufferLease {
    /// Create a new lease by pulling a block from `pool`
    pub fn new(pool: Arc<BufferPool>) -> Self {
        let block = pool.get_buffer();
        Self { block, pool }
    }

    /// The leased block, to be filled and then emptied with `split()`.
    ///
    /// Capacity is reclaimed in place once earlier chunks are gone; a new
    /// allocation happens only when the block is exhausted while they live.
    pub fn block_mut(&mut self) -> &mut BytesMut {
        let size = self.pool.block_size();
        if !self.block.try_reclaim(size) && self.block.capacity() == self.block.len() {
            self.block.reserve(size);
        }
        &mut self.block
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.return_buffer(std::mem::take(&mut self.block));
    }
}
