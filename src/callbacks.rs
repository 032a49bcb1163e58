//! Framework-facing callback plumbing
//!
//! ## Sections
//! - Message types: the bit mask gating notify/data callbacks
//! - Callbacks: the closure set registered by the framework
//! - Preview window: the display-surface provider
//! - Recording records: per-frame physical address metadata

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use crate::error::Result;
use crate::memory::{MemoryAllocator, MemoryBlock};

// ============================================================================
// Message types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageType(pub u32);

impl MessageType {
    pub const ERROR: MessageType = MessageType(0x0001);
    pub const SHUTTER: MessageType = MessageType(0x0002);
    pub const FOCUS: MessageType = MessageType(0x0004);
    pub const ZOOM: MessageType = MessageType(0x0008);
    pub const PREVIEW_FRAME: MessageType = MessageType(0x0010);
    pub const VIDEO_FRAME: MessageType = MessageType(0x0020);
    pub const POSTVIEW_FRAME: MessageType = MessageType(0x0040);
    pub const RAW_IMAGE: MessageType = MessageType(0x0080);
    pub const COMPRESSED_IMAGE: MessageType = MessageType(0x0100);
    pub const RAW_IMAGE_NOTIFY: MessageType = MessageType(0x0200);
    pub const PREVIEW_METADATA: MessageType = MessageType(0x0400);
    pub const ALL: MessageType = MessageType(0xffff);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: MessageType) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for MessageType {
    type Output = MessageType;

    fn bitor(self, rhs: Self) -> Self::Output {
        MessageType(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// ============================================================================
// Callbacks
// ============================================================================

/// `(message, ext1, ext2)`
pub type NotifyCallback = Arc<dyn Fn(MessageType, i32, i32) + Send + Sync>;
/// `(message, block, slot index)`
pub type DataCallback = Arc<dyn Fn(MessageType, &MemoryBlock, usize) + Send + Sync>;
/// `(timestamp ns, message, block, slot index)`
pub type DataTimestampCallback = Arc<dyn Fn(i64, MessageType, &MemoryBlock, usize) + Send + Sync>;

/// Callback set registered by the framework. Any user context is captured
/// by the closures themselves.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub notify: Option<NotifyCallback>,
    pub data: Option<DataCallback>,
    pub data_timestamp: Option<DataTimestampCallback>,
    pub allocator: Option<Arc<dyn MemoryAllocator>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notify(mut self, f: impl Fn(MessageType, i32, i32) + Send + Sync + 'static) -> Self {
        self.notify = Some(Arc::new(f));
        self
    }

    pub fn with_data(mut self, f: impl Fn(MessageType, &MemoryBlock, usize) + Send + Sync + 'static) -> Self {
        self.data = Some(Arc::new(f));
        self
    }

    pub fn with_data_timestamp(
        mut self,
        f: impl Fn(i64, MessageType, &MemoryBlock, usize) + Send + Sync + 'static,
    ) -> Self {
        self.data_timestamp = Some(Arc::new(f));
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn MemoryAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("notify", &self.notify.is_some())
            .field("data", &self.data.is_some())
            .field("data_timestamp", &self.data_timestamp.is_some())
            .field("allocator", &self.allocator.is_some())
            .finish()
    }
}

// ============================================================================
// Preview window
// ============================================================================

/// A locked display buffer ready for CPU writes.
#[derive(Debug)]
pub struct WindowBuffer {
    /// Provider-defined handle, returned on enqueue/cancel.
    pub id: usize,
    pub data: Vec<u8>,
}

/// Display-surface provider (the framework's preview window).
pub trait PreviewWindow: Send {
    fn set_buffer_count(&mut self, count: usize) -> Result<()>;
    fn set_usage(&mut self, usage: u32) -> Result<()>;
    fn set_buffers_geometry(&mut self, width: u32, height: u32, hal_format: u32) -> Result<()>;
    fn dequeue_buffer(&mut self) -> Result<WindowBuffer>;
    fn enqueue_buffer(&mut self, buffer: WindowBuffer) -> Result<()>;
    fn cancel_buffer(&mut self, buffer: WindowBuffer) -> Result<()>;
}

// ============================================================================
// Recording records
// ============================================================================

/// Metadata record delivered for each recording frame in place of pixels.
/// Its `index` is the token handed back on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraAddrs {
    pub kind: u32,
    pub y: u32,
    pub cbcr: u32,
    pub index: u32,
    pub reserved: u32,
}

impl CameraAddrs {
    pub const SIZE: usize = 20;

    pub fn new(y: u32, cbcr: u32, index: u32) -> Self {
        Self {
            kind: 0,
            y,
            cbcr,
            index,
            reserved: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (chunk, value) in out
            .chunks_exact_mut(4)
            .zip([self.kind, self.y, self.cbcr, self.index, self.reserved])
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Some(Self {
            kind: word(0),
            y: word(4),
            cbcr: word(8),
            index: word(12),
            reserved: word(16),
        })
    }

    /// Reads the record stored in slot `index` of a recording block.
    pub fn from_block(block: &MemoryBlock, index: usize) -> Option<Self> {
        block.slot(index).and_then(|bytes| Self::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_mask() {
        let mask = MessageType::SHUTTER | MessageType::COMPRESSED_IMAGE;
        assert!(mask.contains(MessageType::SHUTTER));
        assert!(!mask.contains(MessageType::RAW_IMAGE));
        assert!(!mask.contains(MessageType(0)));
        assert_eq!(mask.bits(), 0x102);
    }

    #[test]
    fn test_addrs_layout() {
        let addrs = CameraAddrs::new(0x4000_0000, 0x4004_b000, 3);
        let bytes = addrs.to_bytes();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &3u32.to_le_bytes());
        assert_eq!(CameraAddrs::from_bytes(&bytes), Some(addrs));
        assert_eq!(CameraAddrs::from_bytes(&bytes[..10]), None);

        let block = MemoryBlock::zeroed(CameraAddrs::SIZE, 4);
        assert!(block.write(2 * CameraAddrs::SIZE, &bytes));
        assert_eq!(CameraAddrs::from_block(&block, 2), Some(addrs));
    }
}
