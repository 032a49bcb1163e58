//! In-process simulated capture hardware
//!
//! [`VirtualDevice`] implements [`DeviceGateway`] over per-node buffer
//! queues, synthesizing frames on dequeue the way the sensor would fill the
//! mapped buffers. It records every call in order and can be told to fail
//! individual operations or controls, which makes it the test double for the
//! pipeline and the backend of the command-line simulator.
//!
//! Its [`allocator`](VirtualDevice::allocator) maps a node's buffers when
//! asked for memory by descriptor, so blocks handed to callbacks see the
//! frames the device wrote.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tracing::trace;

use crate::error::{CameraError, Result};
use crate::memory::{HeapAllocator, MemoryAllocator, MemoryBlock, SharedRegion};
use crate::v4l2::{
    af_status, cid, DeviceGateway, FormatMode, NodeId, PixelFormat, PollStatus, AUTO_FOCUS_ON,
};
use crate::worker::lock;

const FD_BASE: i32 = 100;
const PHYS_BASE: u32 = 0x4000_0000;
const PHYS_NODE_STRIDE: u32 = 0x0400_0000;
/// Extra room the JPEG capture buffer carries beyond the raw frame.
const JPEG_SLACK: usize = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub mode: FormatMode,
}

#[derive(Default)]
struct NodeState {
    path: String,
    input: Option<u32>,
    geometry: Option<Geometry>,
    buffer_count: u32,
    buffer_len: usize,
    region: SharedRegion,
    queued: VecDeque<u32>,
    streaming: bool,
    fps: u32,
    frames: u32,
}

struct FocusScript {
    progress_polls: u32,
    outcome: i32,
    remaining: u32,
}

struct State {
    nodes: HashMap<NodeId, NodeState>,
    controls: HashMap<u32, i32>,
    failing_controls: HashSet<u32>,
    failing_ops: HashSet<String>,
    max_buffers: u32,
    focus: FocusScript,
    thumbnail: (u32, u32),
    break_soi: bool,
    firmware: String,
}

pub struct VirtualDevice {
    state: Mutex<State>,
    calls: Mutex<Vec<String>>,
    frame_interval: Duration,
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                nodes: HashMap::new(),
                controls: HashMap::new(),
                failing_controls: HashSet::new(),
                failing_ops: HashSet::new(),
                max_buffers: 8,
                focus: FocusScript {
                    progress_polls: 2,
                    outcome: af_status::SUCCESS,
                    remaining: 0,
                },
                thumbnail: (320, 240),
                break_soi: false,
                firmware: "SIM0100".to_string(),
            }),
            calls: Mutex::new(Vec::new()),
            frame_interval: Duration::from_millis(2),
        }
    }

    /// Delay each ready poll by `interval`, pacing the preview loop.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Refuse buffer requests larger than `max`.
    pub fn with_max_buffers(self, max: u32) -> Self {
        lock(&self.state).max_buffers = max;
        self
    }

    /// Size of the thumbnail the sensor embeds in JPEG captures.
    pub fn with_thumbnail(self, width: u32, height: u32) -> Self {
        lock(&self.state).thumbnail = (width, height);
        self
    }

    /// After autofocus is switched on, report in-progress for
    /// `progress_polls` reads and then `outcome`.
    pub fn script_focus(&self, progress_polls: u32, outcome: i32) {
        let mut state = lock(&self.state);
        state.focus.progress_polls = progress_polls;
        state.focus.outcome = outcome;
    }

    /// Make every read and write of control `id` fail.
    pub fn fail_control(&self, id: u32) {
        lock(&self.state).failing_controls.insert(id);
    }

    /// Make every call named `op` (e.g. `"stream_on"`) fail.
    pub fn fail_op(&self, op: &str) {
        lock(&self.state).failing_ops.insert(op.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = lock(&self.state);
        state.failing_controls.clear();
        state.failing_ops.clear();
    }

    /// Emit the next JPEG capture without its SOI marker.
    pub fn break_next_jpeg(&self) {
        lock(&self.state).break_soi = true;
    }

    pub fn set_sensor_value(&self, id: u32, value: i32) {
        lock(&self.state).controls.insert(id, value);
    }

    /// Last value written to control `id`.
    pub fn control(&self, id: u32) -> Option<i32> {
        lock(&self.state).controls.get(&id).copied()
    }

    /// Calls in order, as `"node0:set_format:capture"` style entries.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn is_streaming(&self, node: NodeId) -> bool {
        lock(&self.state).nodes.get(&node).is_some_and(|n| n.streaming)
    }

    pub fn is_open(&self, node: NodeId) -> bool {
        lock(&self.state).nodes.contains_key(&node)
    }

    /// Buffers currently queued to the device on `node`.
    pub fn queued(&self, node: NodeId) -> usize {
        lock(&self.state).nodes.get(&node).map_or(0, |n| n.queued.len())
    }

    pub fn buffer_count(&self, node: NodeId) -> u32 {
        lock(&self.state).nodes.get(&node).map_or(0, |n| n.buffer_count)
    }

    pub fn geometry(&self, node: NodeId) -> Option<Geometry> {
        lock(&self.state).nodes.get(&node).and_then(|n| n.geometry)
    }

    /// Input selected on `node`.
    pub fn input(&self, node: NodeId) -> Option<u32> {
        lock(&self.state).nodes.get(&node).and_then(|n| n.input)
    }

    pub fn fps(&self, node: NodeId) -> u32 {
        lock(&self.state).nodes.get(&node).map_or(0, |n| n.fps)
    }

    /// Allocator that maps node buffers by descriptor and falls back to the
    /// heap for anonymous requests.
    pub fn allocator(self: &Arc<Self>) -> Arc<dyn MemoryAllocator> {
        Arc::new(MappedAllocator {
            device: Arc::clone(self),
            heap: HeapAllocator::new(),
        })
    }

    fn region_for_fd(&self, fd: i32) -> Option<SharedRegion> {
        let node = NodeId(usize::try_from(fd - FD_BASE).ok()?);
        lock(&self.state).nodes.get(&node).map(|n| Arc::clone(&n.region))
    }

    fn record(&self, node: NodeId, op: &str) {
        lock(&self.calls).push(format!("{}:{}", node, op));
    }

    /// Logs the call as `label`, then applies injected failures and the
    /// open check.
    fn enter(&self, node: NodeId, op: &'static str, label: &str) -> Result<()> {
        self.record(node, label);
        let state = lock(&self.state);
        if state.failing_ops.contains(op) {
            return Err(CameraError::device(node, op, "injected failure"));
        }
        if !state.nodes.contains_key(&node) {
            return Err(CameraError::device(node, op, "node not open"));
        }
        Ok(())
    }

    fn with_node<T>(
        &self,
        node: NodeId,
        op: &'static str,
        f: impl FnOnce(&mut NodeState) -> Result<T>,
    ) -> Result<T> {
        self.with_node_as(node, op, op, f)
    }

    fn with_node_as<T>(
        &self,
        node: NodeId,
        op: &'static str,
        label: &str,
        f: impl FnOnce(&mut NodeState) -> Result<T>,
    ) -> Result<T> {
        self.enter(node, op, label)?;
        let mut state = lock(&self.state);
        let n = state
            .nodes
            .get_mut(&node)
            .ok_or_else(|| CameraError::device(node, op, "node not open"))?;
        f(n)
    }
}

// ============================================================================
// Frame synthesis
// ============================================================================

fn fill_pattern(region: &SharedRegion, offset: usize, len: usize, seed: u32) {
    let mut data = lock(region);
    if let Some(frame) = data.get_mut(offset..offset + len) {
        for (i, byte) in frame.iter_mut().enumerate() {
            *byte = (i as u32).wrapping_add(seed.wrapping_mul(7)) as u8;
        }
    }
}

fn synth_jpeg(width: u32, height: u32, quality: u8, seed: u32) -> Result<Vec<u8>> {
    let (width, height) = (width.max(1), height.max(1));
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
    for y in 0..height {
        for x in 0..width {
            pixels.extend_from_slice(&[
                (x * 255 / width) as u8,
                (y * 255 / height) as u8,
                (seed.wrapping_mul(40)) as u8,
            ]);
        }
    }

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, quality)
        .write_image(&pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| CameraError::Encoder(format!("sensor JPEG synthesis: {}", e)))?;
    Ok(out.into_inner())
}

impl VirtualDevice {
    /// Writes the sensor's main and thumbnail JPEGs into the capture buffer
    /// and publishes their sizes and offsets through the JPEG controls.
    fn fill_jpeg_capture(&self, node: NodeId, index: u32) -> Result<()> {
        let (geometry, region, buffer_len, quality, thumb, seed) = {
            let state = lock(&self.state);
            let n = state
                .nodes
                .get(&node)
                .ok_or_else(|| CameraError::device(node, "dequeue_buffer", "node not open"))?;
            let geometry = n
                .geometry
                .ok_or_else(|| CameraError::device(node, "dequeue_buffer", "format not set"))?;
            let quality = state.controls.get(&cid::CAM_JPEG_QUALITY).copied().unwrap_or(90);
            (
                geometry,
                Arc::clone(&n.region),
                n.buffer_len,
                quality.clamp(1, 100) as u8,
                state.thumbnail,
                n.frames,
            )
        };

        let mut main = synth_jpeg(geometry.width, geometry.height, quality, seed)?;
        let thumbnail = synth_jpeg(thumb.0, thumb.1, 90, seed)?;

        let base = index as usize * buffer_len;
        let thumb_offset = (main.len() + 15) & !15;
        if thumb_offset + thumbnail.len() > buffer_len {
            return Err(CameraError::device(node, "dequeue_buffer", "capture buffer too small"));
        }

        let mut state = lock(&self.state);
        if std::mem::take(&mut state.break_soi) {
            main[0] = 0;
        }
        {
            let mut data = lock(&region);
            data[base..base + main.len()].copy_from_slice(&main);
            data[base + thumb_offset..base + thumb_offset + thumbnail.len()]
                .copy_from_slice(&thumbnail);
        }
        state.controls.insert(cid::CAM_JPEG_MAIN_SIZE, main.len() as i32);
        state.controls.insert(cid::CAM_JPEG_MAIN_OFFSET, base as i32);
        state.controls.insert(cid::CAM_JPEG_THUMB_SIZE, thumbnail.len() as i32);
        state
            .controls
            .insert(cid::CAM_JPEG_THUMB_OFFSET, (base + thumb_offset) as i32);
        Ok(())
    }
}

// ============================================================================
// Gateway
// ============================================================================

impl DeviceGateway for VirtualDevice {
    fn open(&self, node: NodeId, path: &str) -> Result<()> {
        self.record(node, "open");
        let mut state = lock(&self.state);
        if state.failing_ops.contains("open") {
            return Err(CameraError::device(node, "open", "injected failure"));
        }
        state.nodes.insert(
            node,
            NodeState {
                path: path.to_string(),
                ..NodeState::default()
            },
        );
        Ok(())
    }

    fn close(&self, node: NodeId) {
        self.record(node, "close");
        lock(&self.state).nodes.remove(&node);
    }

    fn fd(&self, node: NodeId) -> Option<i32> {
        let state = lock(&self.state);
        state.nodes.contains_key(&node).then(|| FD_BASE + node.0 as i32)
    }

    fn query_capabilities(&self, node: NodeId) -> Result<()> {
        self.with_node(node, "query_capabilities", |n| {
            trace!("{} capabilities queried on {}", node, n.path);
            Ok(())
        })
    }

    fn enum_input(&self, node: NodeId, input: u32) -> Result<()> {
        self.with_node(node, "enum_input", |_| {
            if input > 1 {
                return Err(CameraError::device(node, "enum_input", format!("no input {}", input)));
            }
            Ok(())
        })
    }

    fn set_input(&self, node: NodeId, input: u32) -> Result<()> {
        self.with_node(node, "set_input", |n| {
            n.input = Some(input);
            Ok(())
        })
    }

    fn enum_format(&self, node: NodeId, _format: PixelFormat) -> Result<()> {
        self.enter(node, "enum_format", "enum_format")
    }

    fn set_format(
        &self,
        node: NodeId,
        width: u32,
        height: u32,
        format: PixelFormat,
        mode: FormatMode,
    ) -> Result<()> {
        let label = match mode {
            FormatMode::Preview => "set_format:preview",
            FormatMode::Capture => "set_format:capture",
        };
        self.with_node_as(node, "set_format", label, |n| {
            if n.streaming {
                return Err(CameraError::device(node, "set_format", "busy while streaming"));
            }
            if width == 0 || height == 0 {
                return Err(CameraError::device(node, "set_format", "empty geometry"));
            }
            n.geometry = Some(Geometry { width, height, format, mode });
            Ok(())
        })
    }

    fn request_buffers(&self, node: NodeId, count: u32) -> Result<u32> {
        let max = lock(&self.state).max_buffers;
        self.with_node(node, "request_buffers", |n| {
            if n.streaming {
                return Err(CameraError::device(node, "request_buffers", "busy while streaming"));
            }
            if count > max {
                return Err(CameraError::device(
                    node,
                    "request_buffers",
                    format!("{} buffers requested, {} available", count, max),
                ));
            }
            let geometry = n
                .geometry
                .ok_or_else(|| CameraError::device(node, "request_buffers", "format not set"))?;
            n.buffer_len = match geometry.format {
                PixelFormat::Jpeg => geometry.width as usize * geometry.height as usize * 2 + JPEG_SLACK,
                format => format.frame_size(geometry.width, geometry.height),
            };
            n.buffer_count = count;
            n.queued.clear();
            let mut data = lock(&n.region);
            data.clear();
            data.resize(n.buffer_len * count as usize, 0);
            Ok(count)
        })
    }

    fn query_buffer(&self, node: NodeId, index: u32) -> Result<usize> {
        self.with_node(node, "query_buffer", |n| {
            if index >= n.buffer_count {
                return Err(CameraError::device(node, "query_buffer", format!("no buffer {}", index)));
            }
            Ok(n.buffer_len)
        })
    }

    fn queue_buffer(&self, node: NodeId, index: u32) -> Result<()> {
        self.with_node(node, "queue_buffer", |n| {
            if index >= n.buffer_count {
                return Err(CameraError::device(node, "queue_buffer", format!("no buffer {}", index)));
            }
            if n.queued.contains(&index) {
                return Err(CameraError::device(
                    node,
                    "queue_buffer",
                    format!("buffer {} already queued", index),
                ));
            }
            n.queued.push_back(index);
            Ok(())
        })
    }

    fn dequeue_buffer(&self, node: NodeId) -> Result<u32> {
        let (index, geometry, len, region, seed) = self.with_node(node, "dequeue_buffer", |n| {
            if !n.streaming {
                return Err(CameraError::device(node, "dequeue_buffer", "not streaming"));
            }
            let index = n
                .queued
                .pop_front()
                .ok_or_else(|| CameraError::device(node, "dequeue_buffer", "no buffer queued"))?;
            n.frames = n.frames.wrapping_add(1);
            Ok((index, n.geometry, n.buffer_len, Arc::clone(&n.region), n.frames))
        })?;

        match geometry.map(|g| g.format) {
            Some(PixelFormat::Jpeg) => self.fill_jpeg_capture(node, index)?,
            _ => fill_pattern(&region, index as usize * len, len, seed),
        }
        Ok(index)
    }

    fn stream_on(&self, node: NodeId) -> Result<()> {
        self.with_node(node, "stream_on", |n| {
            n.streaming = true;
            Ok(())
        })
    }

    fn stream_off(&self, node: NodeId) -> Result<()> {
        self.with_node(node, "stream_off", |n| {
            n.streaming = false;
            n.queued.clear();
            Ok(())
        })
    }

    fn poll(&self, node: NodeId) -> Result<PollStatus> {
        let ready = {
            let state = lock(&self.state);
            if state.failing_ops.contains("poll") {
                return Err(CameraError::device(node, "poll", "injected failure"));
            }
            let n = state
                .nodes
                .get(&node)
                .ok_or_else(|| CameraError::device(node, "poll", "node not open"))?;
            n.streaming && !n.queued.is_empty()
        };
        thread::sleep(self.frame_interval);
        Ok(if ready { PollStatus::Ready } else { PollStatus::Timeout })
    }

    fn get_control(&self, node: NodeId, id: u32) -> Result<i32> {
        let mut state = lock(&self.state);
        if state.failing_controls.contains(&id) || state.failing_ops.contains("get_control") {
            return Err(CameraError::device(node, "get_control", format!("control {:#x}", id)));
        }
        if id == cid::CAMERA_AUTO_FOCUS_RESULT {
            let focus = &mut state.focus;
            if focus.remaining > 0 {
                focus.remaining -= 1;
                return Ok(af_status::IN_PROGRESS);
            }
            return Ok(focus.outcome);
        }
        Ok(state.controls.get(&id).copied().unwrap_or(0))
    }

    fn set_control(&self, node: NodeId, id: u32, value: i32) -> Result<i32> {
        let mut state = lock(&self.state);
        if state.failing_controls.contains(&id) || state.failing_ops.contains("set_control") {
            return Err(CameraError::device(node, "set_control", format!("control {:#x}", id)));
        }

        if id == cid::PADDR_Y || id == cid::PADDR_CBCR {
            let n = state
                .nodes
                .get(&node)
                .ok_or_else(|| CameraError::device(node, "set_control", "node not open"))?;
            if value < 0 || value as u32 >= n.buffer_count {
                return Ok(crate::v4l2::INVALID_PHYS_ADDR as i32);
            }
            let mut addr = PHYS_BASE
                + node.0 as u32 * PHYS_NODE_STRIDE
                + value as u32 * n.buffer_len as u32;
            if id == cid::PADDR_CBCR {
                if let Some(g) = n.geometry {
                    addr += g.width * g.height;
                }
            }
            return Ok(addr as i32);
        }

        if id == cid::CAMERA_SET_AUTO_FOCUS && value == AUTO_FOCUS_ON {
            state.focus.remaining = state.focus.progress_polls;
        }
        let previous = state.controls.insert(id, value).unwrap_or(0);
        drop(state);
        self.record(node, &format!("set_control:{:#x}={}", id, value));
        Ok(previous)
    }

    fn get_ext_control_string(&self, node: NodeId, id: u32) -> Result<String> {
        let state = lock(&self.state);
        if id != cid::CAM_SENSOR_FW_VER || state.failing_controls.contains(&id) {
            return Err(CameraError::device(node, "get_ext_controls", format!("control {:#x}", id)));
        }
        Ok(state.firmware.clone())
    }

    fn set_stream_parameters(&self, node: NodeId, fps: u32) -> Result<()> {
        self.with_node(node, "set_stream_parameters", |n| {
            n.fps = fps;
            Ok(())
        })
    }
}

// ============================================================================
// Allocator
// ============================================================================

struct MappedAllocator {
    device: Arc<VirtualDevice>,
    heap: HeapAllocator,
}

impl MemoryAllocator for MappedAllocator {
    fn request_memory(&self, fd: Option<i32>, buffer_size: usize, count: usize) -> Option<MemoryBlock> {
        match fd.and_then(|fd| self.device.region_for_fd(fd)) {
            Some(region) => Some(MemoryBlock::new(region, buffer_size, count)),
            None => self.heap.request_memory(None, buffer_size, count),
        }
    }
}
