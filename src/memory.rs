//! Shared memory blocks handed between the pipeline and its consumer
//!
//! A [`MemoryBlock`] is `count` slots of `buffer_size` bytes. Blocks are
//! cheap to clone; the backing memory is returned to its allocator when the
//! last handle drops.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::worker::lock;

pub type SharedRegion = Arc<Mutex<Vec<u8>>>;

type ReleaseHook = Box<dyn FnOnce() + Send>;

struct BlockInner {
    region: SharedRegion,
    buffer_size: usize,
    count: usize,
    release: Mutex<Option<ReleaseHook>>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        let hook = match self.release.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[derive(Clone)]
pub struct MemoryBlock {
    inner: Arc<BlockInner>,
}

impl MemoryBlock {
    /// Wraps `region`, which must hold at least `buffer_size * count` bytes.
    pub fn new(region: SharedRegion, buffer_size: usize, count: usize) -> Self {
        {
            let mut data = lock(&region);
            if data.len() < buffer_size * count {
                data.resize(buffer_size * count, 0);
            }
        }
        Self {
            inner: Arc::new(BlockInner {
                region,
                buffer_size,
                count,
                release: Mutex::new(None),
            }),
        }
    }

    /// Anonymous zero-filled block.
    pub fn zeroed(buffer_size: usize, count: usize) -> Self {
        Self::new(Arc::new(Mutex::new(vec![0; buffer_size * count])), buffer_size, count)
    }

    /// Runs `hook` once the last handle to this block is dropped.
    pub fn on_release(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *lock(&self.inner.release) = Some(Box::new(hook));
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn count(&self) -> usize {
        self.inner.count
    }

    pub fn len(&self) -> usize {
        self.inner.buffer_size * self.inner.count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of slot `index`, or `None` when out of range.
    pub fn slot(&self, index: usize) -> Option<Vec<u8>> {
        if index >= self.inner.count {
            return None;
        }
        let start = index * self.inner.buffer_size;
        let data = lock(&self.inner.region);
        data.get(start..start + self.inner.buffer_size).map(<[u8]>::to_vec)
    }

    /// Copy of `len` bytes starting at absolute byte `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if offset.checked_add(len)? > self.len() {
            return None;
        }
        let data = lock(&self.inner.region);
        data.get(offset..offset + len).map(<[u8]>::to_vec)
    }

    /// Writes `bytes` at absolute byte `offset`. Returns false when the write
    /// would run past the end of the block.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> bool {
        let end = match offset.checked_add(bytes.len()) {
            Some(end) if end <= self.len() => end,
            _ => return false,
        };
        let mut data = lock(&self.inner.region);
        match data.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let data = lock(&self.inner.region);
        data[..self.len().min(data.len())].to_vec()
    }

    pub fn shares_region(&self, region: &SharedRegion) -> bool {
        Arc::ptr_eq(&self.inner.region, region)
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("buffer_size", &self.inner.buffer_size)
            .field("count", &self.inner.count)
            .finish()
    }
}

/// Runtime memory provider.
///
/// `fd` names a device node whose buffers should be mapped; `None` asks for
/// anonymous memory. Returning `None` signals exhaustion.
pub trait MemoryAllocator: Send + Sync {
    fn request_memory(&self, fd: Option<i32>, buffer_size: usize, count: usize) -> Option<MemoryBlock>;
}

/// Anonymous heap allocator that tracks how many blocks are still alive.
#[derive(Debug, Clone, Default)]
pub struct HeapAllocator {
    outstanding: Arc<AtomicUsize>,
    /// Largest single request honoured, in bytes.
    limit: Option<usize>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            outstanding: Arc::new(AtomicUsize::new(0)),
            limit: Some(limit),
        }
    }

    /// Blocks handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl MemoryAllocator for HeapAllocator {
    fn request_memory(&self, _fd: Option<i32>, buffer_size: usize, count: usize) -> Option<MemoryBlock> {
        let total = buffer_size.checked_mul(count)?;
        if self.limit.is_some_and(|limit| total > limit) {
            return None;
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let outstanding = Arc::clone(&self.outstanding);
        Some(MemoryBlock::zeroed(buffer_size, count).on_release(move || {
            outstanding.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_and_bounds() {
        let block = MemoryBlock::zeroed(4, 3);
        assert_eq!(block.len(), 12);
        assert!(block.write(4, &[1, 2, 3, 4]));
        assert_eq!(block.slot(1), Some(vec![1, 2, 3, 4]));
        assert_eq!(block.slot(3), None);
        assert!(!block.write(10, &[0; 4]));
        assert_eq!(block.read(5, 2), Some(vec![2, 3]));
        assert_eq!(block.read(11, 2), None);
    }

    #[test]
    fn test_release_on_last_drop() {
        let allocator = HeapAllocator::new();
        let block = allocator.request_memory(None, 16, 2).unwrap();
        let clone = block.clone();
        assert_eq!(allocator.outstanding(), 1);

        drop(block);
        assert_eq!(allocator.outstanding(), 1);
        drop(clone);
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn test_limit_reports_exhaustion() {
        let allocator = HeapAllocator::with_limit(64);
        assert!(allocator.request_memory(None, 64, 2).is_none());
        assert!(allocator.request_memory(None, 32, 2).is_some());
        assert_eq!(allocator.outstanding(), 0);
    }
}
