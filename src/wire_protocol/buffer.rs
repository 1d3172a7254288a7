//! Recycled byte buffers for frame assembly.
use std::sync::Mutex;

// Buffers that grew past this are dropped instead of pooled, so one
// outsized insert batch does not pin its allocation forever.
const MAX_POOLED_CAPACITY: usize = 1 << 20;
const MAX_POOLED_BUFFERS: usize = 16;

/// A small free-list of `Vec<u8>` scratch buffers.
///
/// Frames are assembled fully in memory before they are written to a socket,
/// both to measure their length prefix and to keep socket writes to a single
/// syscall; this pool keeps those allocations out of the per-request path.
#[derive(Debug, Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> BufferPool {
        BufferPool::default()
    }

    /// Takes an empty buffer from the pool, or allocates one.
    pub fn take(&self) -> Vec<u8> {
        match self.buffers.lock() {
            Ok(mut buffers) => buffers.pop().unwrap_or_else(Vec::new),
            Err(_) => Vec::new(),
        }
    }

    /// Returns a buffer for reuse.
    pub fn give(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buffer.clear();
        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < MAX_POOLED_BUFFERS {
                buffers.push(buffer);
            }
        }
    }
}
