//! Preview and recording pipelines
//!
//! Preview streams from the FIMC1 node into the framework's window; while
//! recording is on, every preview iteration also drains one frame from the
//! FIMC2 node and hands its physical addresses to the recording consumer.
//! Both streams share one worker thread, so `frame_lock` serializes an
//! iteration against recording start and stop.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::callbacks::{CameraAddrs, MessageType, PreviewWindow};
use crate::camera::Core;
use crate::error::{CameraError, Result};
use crate::memory::MemoryBlock;
use crate::metrics::PipelineMetrics;
use crate::settings::SessionSettings;
use crate::v4l2::{cid, hal, DeviceGateway, FormatMode, NodeId, PollStatus, INVALID_PHYS_ADDR};
use crate::worker::{lock, Worker, STOP_TIMEOUT};

/// Buffer counts are negotiated downward from `MAX_BUFFERS`.
pub const MAX_BUFFERS: u32 = 8;
pub const MIN_BUFFERS: u32 = 3;

const WINDOW_WAIT: Duration = Duration::from_millis(20);

/// What one preview activation streams with.
#[derive(Debug, Clone)]
struct PreviewStream {
    buffers: u32,
    frame_size: usize,
    memory: MemoryBlock,
}

#[derive(Debug, Default)]
struct RecordingState {
    memory: Option<MemoryBlock>,
    buffers: u32,
    /// Indices delivered to the consumer and not yet released.
    outstanding: BTreeSet<u32>,
}

pub(crate) struct PreviewPipeline {
    worker: Arc<Worker>,
    /// Present from a successful start until the matching stop.
    stream: Mutex<Option<PreviewStream>>,
    frame_lock: Mutex<()>,
    window: Mutex<Option<Box<dyn PreviewWindow>>>,
    window_changed: Condvar,
    /// Last negotiated preview buffer count, 0 before the first start.
    negotiated: AtomicU32,
    recording: Mutex<RecordingState>,
}

impl PreviewPipeline {
    pub fn new() -> Self {
        Self {
            worker: Arc::new(Worker::new("preview")),
            stream: Mutex::new(None),
            frame_lock: Mutex::new(()),
            window: Mutex::new(None),
            window_changed: Condvar::new(),
            negotiated: AtomicU32::new(0),
            recording: Mutex::new(RecordingState::default()),
        }
    }

    /// False once the worker exits, even before the stream is torn down.
    pub fn is_enabled(&self) -> bool {
        self.worker.is_enabled()
    }

    pub fn recording_enabled(&self) -> bool {
        lock(&self.recording).memory.is_some()
    }

    pub fn outstanding_recording_frames(&self) -> usize {
        lock(&self.recording).outstanding.len()
    }

    /// Blocks until a window is attached. False once the worker is stopped.
    fn wait_for_window(&self, worker: &Worker) -> bool {
        let mut window = lock(&self.window);
        while window.is_none() {
            if !worker.is_enabled() {
                return false;
            }
            window = self
                .window_changed
                .wait_timeout(window, WINDOW_WAIT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        worker.is_enabled()
    }
}

/// Turns a node's stream off on drop unless kept.
pub(crate) struct StreamGuard<'a> {
    gateway: &'a dyn DeviceGateway,
    node: NodeId,
    armed: bool,
}

impl<'a> StreamGuard<'a> {
    pub fn on(gateway: &'a dyn DeviceGateway, node: NodeId) -> Result<Self> {
        gateway.stream_on(node)?;
        Ok(Self {
            gateway,
            node,
            armed: true,
        })
    }

    /// Takes over a node that a previous `keep()` left streaming.
    pub fn adopt(gateway: &'a dyn DeviceGateway, node: NodeId) -> Self {
        Self {
            gateway,
            node,
            armed: true,
        }
    }

    pub fn keep(mut self) {
        self.armed = false;
    }

    /// Stops the stream now, reporting the failure instead of logging it.
    pub fn off(mut self) -> Result<()> {
        self.armed = false;
        self.gateway.stream_off(self.node)
    }
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.gateway.stream_off(self.node) {
                warn!("{} stream off during unwind failed: {}", self.node, e);
            }
        }
    }
}

/// Requests `MAX_BUFFERS` and retries with fewer down to `MIN_BUFFERS`.
pub(crate) fn request_buffer_pool(gateway: &dyn DeviceGateway, node: NodeId) -> Result<u32> {
    let mut last_error = None;
    for count in (MIN_BUFFERS..=MAX_BUFFERS).rev() {
        match gateway.request_buffers(node, count) {
            Ok(0) => continue,
            Ok(granted) => {
                debug!("{} granted {} buffers", node, granted);
                return Ok(granted);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        CameraError::device(node, "request_buffers", "no buffer count accepted")
    }))
}

pub(crate) fn apply_orientation(
    gateway: &dyn DeviceGateway,
    node: NodeId,
    settings: &SessionSettings,
) -> Result<()> {
    gateway.set_control(node, cid::ROTATION, settings.rotation)?;
    gateway.set_control(node, cid::HFLIP, settings.hflip as i32)?;
    gateway.set_control(node, cid::VFLIP, settings.vflip as i32)?;
    Ok(())
}

// ============================================================================
// Window
// ============================================================================

/// Attaches (or with `None` detaches) the preview window.
pub(crate) fn set_window(core: &Core, window: Option<Box<dyn PreviewWindow>>) -> Result<()> {
    let pipeline = &core.preview;
    let Some(mut window) = window else {
        *lock(&pipeline.window) = None;
        debug!("preview window detached");
        return Ok(());
    };

    let settings = core.settings();
    let count = match pipeline.negotiated.load(Ordering::SeqCst) {
        0 => MAX_BUFFERS,
        n => n,
    };
    window.set_buffer_count(count as usize)?;
    window.set_usage(hal::USAGE_SW_WRITE_OFTEN)?;
    window.set_buffers_geometry(
        settings.preview_width,
        settings.preview_height,
        settings.preview_format.hal_format(),
    )?;

    *lock(&pipeline.window) = Some(window);
    pipeline.window_changed.notify_all();
    debug!(
        "preview window attached: {}x{} {}, {} buffers",
        settings.preview_width, settings.preview_height, settings.preview_format, count
    );
    Ok(())
}

// ============================================================================
// Preview
// ============================================================================

pub(crate) fn start_preview(core: &Arc<Core>) -> Result<()> {
    if core.picture.worker.is_busy() {
        return Err(CameraError::Busy("a picture is being taken on the preview node".into()));
    }
    let pipeline = &core.preview;
    let mut stream = lock(&pipeline.stream);
    if stream.is_some() {
        if pipeline.worker.is_enabled() {
            info!("preview already started");
            return Ok(());
        }
        // The worker died on an error; clear what it left streaming.
        drop(stream);
        stop_preview(core);
        stream = lock(&pipeline.stream);
        if stream.is_some() {
            return Ok(());
        }
    }

    let settings = core.activation_settings();
    let gateway = core.gateway.as_ref();
    let node = NodeId::PREVIEW;
    let format = settings.preview_format;

    gateway.enum_format(node, format)?;
    gateway.set_format(
        node,
        settings.preview_width,
        settings.preview_height,
        format,
        FormatMode::Preview,
    )?;
    gateway.set_control(node, cid::CACHEABLE, 1)?;

    let buffers = request_buffer_pool(gateway, node)?;
    pipeline.negotiated.store(buffers, Ordering::SeqCst);
    gateway.set_stream_parameters(node, settings.preview_fps)?;

    let frame_size = settings.preview_frame_size();
    for index in 0..buffers {
        let length = gateway.query_buffer(node, index)?;
        if length != frame_size {
            warn!(
                "{} buffer {} is {} bytes, expected {}",
                node, index, length, frame_size
            );
        }
    }

    let fd = gateway
        .fd(node)
        .ok_or_else(|| CameraError::device(node, "fd", "node not open"))?;
    let memory = core
        .allocator()?
        .request_memory(Some(fd), frame_size, buffers as usize)
        .ok_or_else(|| {
            CameraError::OutOfMemory(format!("{} preview buffers of {} bytes", buffers, frame_size))
        })?;

    for index in 0..buffers {
        gateway.queue_buffer(node, index)?;
    }
    apply_orientation(gateway, node, &settings)?;

    let guard = StreamGuard::on(gateway, node)?;
    let active = PreviewStream {
        buffers,
        frame_size,
        memory,
    };
    let worker_core = Arc::clone(core);
    let worker_stream = active.clone();
    pipeline
        .worker
        .launch(move |worker| preview_loop(&worker_core, &worker_stream, worker))?;
    guard.keep();

    *stream = Some(active);
    info!(
        "preview started: {}x{} {} at {} fps, {} buffers",
        settings.preview_width, settings.preview_height, format, settings.preview_fps, buffers
    );
    Ok(())
}

pub(crate) fn stop_preview(core: &Core) {
    let pipeline = &core.preview;
    let mut stream = lock(&pipeline.stream);
    let Some(active) = stream.take() else {
        debug!("preview already stopped");
        return;
    };

    pipeline.worker.request_stop();
    pipeline.window_changed.notify_all();
    if !pipeline.worker.stop(STOP_TIMEOUT) {
        warn!("tearing down preview without a confirmed thread exit");
    }

    if let Err(e) = core.gateway.stream_off(NodeId::PREVIEW) {
        warn!("preview stream off failed: {}", e);
    }
    lock(&core.session).settings.params_applied = false;
    drop(active);
    *lock(&pipeline.window) = None;
    info!("preview stopped");
}

fn preview_loop(core: &Core, stream: &PreviewStream, worker: &Worker) {
    while worker.is_enabled() {
        if !core.preview.wait_for_window(worker) {
            break;
        }

        let result = {
            let _frame = lock(&core.preview.frame_lock);
            if !worker.is_enabled() {
                break;
            }
            preview_frame(core, stream)
        };

        if let Err(e) = result {
            error!("preview iteration failed, stopping: {}", e);
            PipelineMetrics::incr(&core.metrics.preview_failures);
            break;
        }
    }
}

fn preview_frame(core: &Core, stream: &PreviewStream) -> Result<()> {
    let gateway = core.gateway.as_ref();
    let node = NodeId::PREVIEW;
    let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    if gateway.poll(node)? == PollStatus::Timeout {
        return Err(CameraError::Timeout(format!("{} frame poll", node)));
    }
    let index = gateway.dequeue_buffer(node)?;
    if index >= stream.buffers {
        return Err(CameraError::device(
            node,
            "dequeue_buffer",
            format!("index {} beyond {} buffers", index, stream.buffers),
        ));
    }
    gateway.queue_buffer(node, index)?;

    let offset = index as usize * stream.frame_size;
    {
        let mut window = lock(&core.preview.window);
        if let Some(window) = window.as_mut() {
            let frame = stream.memory.read(offset, stream.frame_size).ok_or_else(|| {
                CameraError::Malformed(format!("preview frame {} outside mapped memory", index))
            })?;
            let mut buffer = window.dequeue_buffer()?;
            let len = frame.len().min(buffer.data.len());
            buffer.data[..len].copy_from_slice(&frame[..len]);
            window.enqueue_buffer(buffer)?;
        }
    }

    PipelineMetrics::incr(&core.metrics.preview_frames);
    core.deliver(MessageType::PREVIEW_FRAME, &stream.memory, index as usize);

    record_frame(core, timestamp)
}

// ============================================================================
// Recording
// ============================================================================

/// Drains one recording frame, if recording is on.
fn record_frame(core: &Core, timestamp: i64) -> Result<()> {
    let gateway = core.gateway.as_ref();
    let node = NodeId::RECORDING;

    let mut recording = lock(&core.preview.recording);
    let Some(memory) = recording.memory.clone() else {
        return Ok(());
    };

    if gateway.poll(node)? == PollStatus::Timeout {
        return Err(CameraError::Timeout(format!("{} frame poll", node)));
    }
    let index = gateway.dequeue_buffer(node)?;
    if index >= recording.buffers {
        return Err(CameraError::device(
            node,
            "dequeue_buffer",
            format!("index {} beyond {} buffers", index, recording.buffers),
        ));
    }

    let y = gateway.set_control(node, cid::PADDR_Y, index as i32)? as u32;
    let cbcr = gateway.set_control(node, cid::PADDR_CBCR, index as i32)? as u32;
    if y == INVALID_PHYS_ADDR || cbcr == INVALID_PHYS_ADDR {
        return Err(CameraError::device(
            node,
            "set_control",
            format!("no physical address for buffer {}", index),
        ));
    }

    let addrs = CameraAddrs::new(y, cbcr, index);
    if !memory.write(index as usize * CameraAddrs::SIZE, &addrs.to_bytes()) {
        return Err(CameraError::Malformed(format!(
            "recording slot {} outside mapped memory",
            index
        )));
    }

    match core.video_consumer() {
        Some(consumer) => {
            recording.outstanding.insert(index);
            drop(recording);
            PipelineMetrics::incr(&core.metrics.recording_delivered);
            consumer(timestamp, MessageType::VIDEO_FRAME, &memory, index as usize);
        }
        None => {
            gateway.queue_buffer(node, index)?;
            PipelineMetrics::incr(&core.metrics.recording_requeued);
        }
    }
    Ok(())
}

pub(crate) fn start_recording(core: &Core) -> Result<()> {
    let pipeline = &core.preview;
    let _frame = lock(&pipeline.frame_lock);
    let mut recording = lock(&pipeline.recording);
    if recording.memory.is_some() {
        info!("recording already started");
        return Ok(());
    }

    let settings = core.settings();
    let gateway = core.gateway.as_ref();
    let node = NodeId::RECORDING;
    let format = settings.recording_format;

    gateway.enum_format(node, format)?;
    gateway.set_format(
        node,
        settings.recording_width,
        settings.recording_height,
        format,
        FormatMode::Capture,
    )?;

    let buffers = request_buffer_pool(gateway, node)?;
    for index in 0..buffers {
        gateway.query_buffer(node, index)?;
    }

    let memory = core
        .allocator()?
        .request_memory(None, CameraAddrs::SIZE, buffers as usize)
        .ok_or_else(|| CameraError::OutOfMemory(format!("{} recording slots", buffers)))?;

    for index in 0..buffers {
        gateway.queue_buffer(node, index)?;
    }
    apply_orientation(gateway, node, &settings)?;
    StreamGuard::on(gateway, node)?.keep();

    *recording = RecordingState {
        memory: Some(memory),
        buffers,
        outstanding: BTreeSet::new(),
    };
    info!(
        "recording started: {}x{} {}, {} buffers",
        settings.recording_width, settings.recording_height, format, buffers
    );
    Ok(())
}

pub(crate) fn stop_recording(core: &Core) {
    let pipeline = &core.preview;
    let _frame = lock(&pipeline.frame_lock);
    let mut recording = lock(&pipeline.recording);
    if recording.memory.is_none() {
        debug!("recording already stopped");
        return;
    }

    if let Err(e) = core.gateway.stream_off(NodeId::RECORDING) {
        warn!("recording stream off failed: {}", e);
    }
    *recording = RecordingState::default();
    info!("recording stopped");
}

pub(crate) fn release_recording_frame(core: &Core, addrs: &CameraAddrs) {
    let mut recording = lock(&core.preview.recording);
    if recording.memory.is_none() {
        warn!("recording frame {} released after recording stopped", addrs.index);
        return;
    }
    if addrs.index >= recording.buffers || !recording.outstanding.remove(&addrs.index) {
        warn!("recording frame {} is not held by the consumer", addrs.index);
        return;
    }

    match core.gateway.queue_buffer(NodeId::RECORDING, addrs.index) {
        Ok(()) => PipelineMetrics::incr(&core.metrics.recording_released),
        Err(e) => warn!("requeue of recording frame {} failed: {}", addrs.index, e),
    }
}
