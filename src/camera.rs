//! Camera facade
//!
//! `ExynosCamera` is the single entry point the host framework talks to. It
//! owns the shared `Core` that the preview, picture and autofocus workers
//! borrow through an `Arc`, and forwards every framework request to the
//! pipeline that implements it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use exynos_camera::{CameraConfig, ExynosCamera, VirtualDevice};
//!
//! let device = Arc::new(VirtualDevice::new());
//! let camera = ExynosCamera::open(Arc::new(CameraConfig::galaxys2()), 0, device.clone())?;
//! camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
//! camera.enable_msg_type(MessageType::COMPRESSED_IMAGE);
//! camera.take_picture()?;
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::autofocus;
use crate::callbacks::{CameraAddrs, Callbacks, DataTimestampCallback, MessageType, PreviewWindow};
use crate::encoder::{ImageJpegCodec, JpegCodec};
use crate::error::{CameraError, Result};
use crate::memory::{MemoryAllocator, MemoryBlock};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::params::ParamStore;
use crate::picture::{self, PicturePipeline};
use crate::preset::{CameraConfig, Facing, Preset};
use crate::preview::{self, PreviewPipeline};
use crate::settings::{apply_parameters, populate_defaults, SessionSettings};
use crate::v4l2::{cid, DeviceGateway, NodeId};
use crate::worker::{lock, Worker};

/// Wall clock used for EXIF timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Facing and mounting orientation of one camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub facing: Facing,
    pub orientation: i32,
}

pub fn number_of_cameras(config: &CameraConfig) -> usize {
    config.presets.len()
}

pub fn camera_info(config: &CameraConfig, id: usize) -> Result<CameraInfo> {
    let preset = config.preset(id)?;
    Ok(CameraInfo {
        facing: preset.facing,
        orientation: preset.orientation,
    })
}

/// Optional collaborators for `ExynosCamera::open_with`.
#[derive(Clone)]
pub struct CameraOptions {
    pub codec: Arc<dyn JpegCodec>,
    pub clock: Clock,
}

impl Default for CameraOptions {
    fn default() -> Self {
        Self {
            codec: Arc::new(ImageJpegCodec),
            clock: Arc::new(Local::now),
        }
    }
}

pub(crate) struct Session {
    pub settings: SessionSettings,
    pub params: ParamStore,
}

/// State shared between the facade and its worker threads.
pub(crate) struct Core {
    pub id: usize,
    pub config: Arc<CameraConfig>,
    pub preset: Preset,
    pub gateway: Arc<dyn DeviceGateway>,
    pub codec: Arc<dyn JpegCodec>,
    pub clock: Clock,

    pub session: Mutex<Session>,
    callbacks: Mutex<Callbacks>,
    messages: AtomicU32,

    pub preview: PreviewPipeline,
    pub picture: PicturePipeline,
    pub autofocus: Arc<Worker>,

    pub metrics: PipelineMetrics,
}

impl Core {
    pub fn msg_enabled(&self, msg: MessageType) -> bool {
        MessageType(self.messages.load(Ordering::SeqCst)).contains(msg)
    }

    /// Fires the notify callback when `msg` is enabled.
    pub fn notify(&self, msg: MessageType, ext1: i32, ext2: i32) {
        if !self.msg_enabled(msg) {
            return;
        }
        let callback = lock(&self.callbacks).notify.clone();
        if let Some(callback) = callback {
            callback(msg, ext1, ext2);
        }
    }

    /// Fires the data callback when `msg` is enabled.
    pub fn deliver(&self, msg: MessageType, block: &MemoryBlock, index: usize) {
        if !self.msg_enabled(msg) {
            return;
        }
        let callback = lock(&self.callbacks).data.clone();
        if let Some(callback) = callback {
            callback(msg, block, index);
        }
    }

    /// The recording consumer, if video frames are enabled and one is set.
    pub fn video_consumer(&self) -> Option<DataTimestampCallback> {
        if !self.msg_enabled(MessageType::VIDEO_FRAME) {
            return None;
        }
        lock(&self.callbacks).data_timestamp.clone()
    }

    pub fn allocator(&self) -> Result<Arc<dyn MemoryAllocator>> {
        lock(&self.callbacks)
            .allocator
            .clone()
            .ok_or_else(|| CameraError::InvalidArgument("no memory allocator registered".into()))
    }

    pub fn settings(&self) -> SessionSettings {
        lock(&self.session).settings.clone()
    }

    /// Settings for a new activation, reapplying every parameter first if
    /// the last teardown invalidated them.
    pub fn activation_settings(&self) -> SessionSettings {
        let mut session = lock(&self.session);
        let Session { settings, params } = &mut *session;
        if !settings.params_applied {
            let summary = apply_parameters(settings, params, self.gateway.as_ref());
            debug!(
                "reapplied parameters: {} controls written, {} failed",
                summary.written.len(),
                summary.failed
            );
        }
        settings.clone()
    }
}

// ============================================================================
// Facade
// ============================================================================

pub struct ExynosCamera {
    core: Arc<Core>,
    released: bool,
}

impl ExynosCamera {
    pub fn open(config: Arc<CameraConfig>, id: usize, gateway: Arc<dyn DeviceGateway>) -> Result<Self> {
        Self::open_with(config, id, gateway, CameraOptions::default())
    }

    /// Opens camera `id`, bringing up both capture nodes and publishing the
    /// preset's default parameters.
    pub fn open_with(
        config: Arc<CameraConfig>,
        id: usize,
        gateway: Arc<dyn DeviceGateway>,
        options: CameraOptions,
    ) -> Result<Self> {
        config.validate()?;
        let preset = config.preset(id)?.clone();
        info!("opening camera {} ({})", id, preset.name);

        let core = Arc::new(Core {
            id,
            session: Mutex::new(Session {
                settings: SessionSettings::from_preset(&preset),
                params: ParamStore::new(),
            }),
            config,
            preset,
            gateway,
            codec: options.codec,
            clock: options.clock,
            callbacks: Mutex::new(Callbacks::default()),
            messages: AtomicU32::new(0),
            preview: PreviewPipeline::new(),
            picture: PicturePipeline::new(),
            autofocus: Arc::new(Worker::new("autofocus")),
            metrics: PipelineMetrics::new(),
        });

        // From here on a failure closes whatever was opened through Drop.
        let camera = Self { core, released: false };
        camera.init()?;
        Ok(camera)
    }

    fn init(&self) -> Result<()> {
        let core = &self.core;
        let gateway = core.gateway.as_ref();
        let input = core.id as u32;

        for node in [NodeId::PREVIEW, NodeId::RECORDING] {
            let path = core
                .config
                .node_path(node)
                .ok_or_else(|| CameraError::InvalidArgument(format!("no device path for {}", node)))?;
            gateway.open(node, path)?;
            gateway.query_capabilities(node)?;
            gateway.enum_input(node, input)?;
            gateway.set_input(node, input)?;
            debug!("{} opened at {} on input {}", node, path, input);
        }

        match gateway.get_ext_control_string(NodeId::PREVIEW, cid::CAM_SENSOR_FW_VER) {
            Ok(version) => info!("sensor firmware version: {}", version),
            Err(e) => warn!("unable to read sensor firmware version: {}", e),
        }

        let mut session = lock(&core.session);
        let Session { settings, params } = &mut *session;
        populate_defaults(params, &core.preset);
        let summary = apply_parameters(settings, params, gateway);
        info!(
            "camera {} initialized, {} controls written",
            core.id,
            summary.written.len()
        );
        Ok(())
    }

    pub fn id(&self) -> usize {
        self.core.id
    }

    pub fn preset(&self) -> &Preset {
        &self.core.preset
    }

    pub fn info(&self) -> CameraInfo {
        CameraInfo {
            facing: self.core.preset.facing,
            orientation: self.core.preset.orientation,
        }
    }

    // ------------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------------

    /// Merges a flattened `key=value;...` string and applies the result.
    pub fn set_parameters(&self, text: &str) -> Result<()> {
        let core = &self.core;
        let mut session = lock(&core.session);
        let Session { settings, params } = &mut *session;
        params.unflatten(text);
        let summary = apply_parameters(settings, params, core.gateway.as_ref());
        debug!(
            "parameters applied (forced: {}): {} written, {} failed",
            summary.forced,
            summary.written.len(),
            summary.failed
        );
        Ok(())
    }

    pub fn get_parameters(&self) -> String {
        lock(&self.core.session).params.flatten()
    }

    /// Returns a string obtained from `get_parameters`.
    pub fn put_parameters(&self, text: String) {
        drop(text);
    }

    /// Current value of one parameter, rendered as text.
    pub fn parameter(&self, key: &str) -> Option<String> {
        lock(&self.core.session).params.get_string(key)
    }

    // ------------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------------

    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *lock(&self.core.callbacks) = callbacks;
    }

    pub fn enable_msg_type(&self, msg: MessageType) {
        self.core.messages.fetch_or(msg.bits(), Ordering::SeqCst);
    }

    pub fn disable_msg_type(&self, msg: MessageType) {
        self.core.messages.fetch_and(!msg.bits(), Ordering::SeqCst);
    }

    pub fn msg_type_enabled(&self, msg: MessageType) -> bool {
        self.core.msg_enabled(msg)
    }

    // ------------------------------------------------------------------------
    // Preview and recording
    // ------------------------------------------------------------------------

    pub fn set_preview_window(&self, window: Option<Box<dyn PreviewWindow>>) -> Result<()> {
        preview::set_window(&self.core, window)
    }

    /// `Busy` while a picture is being taken.
    pub fn start_preview(&self) -> Result<()> {
        preview::start_preview(&self.core)
    }

    pub fn stop_preview(&self) {
        preview::stop_preview(&self.core)
    }

    pub fn preview_enabled(&self) -> bool {
        self.core.preview.is_enabled()
    }

    /// Only metadata buffers are supported.
    pub fn store_meta_data_in_buffers(&self, enable: bool) -> Result<()> {
        if enable {
            Ok(())
        } else {
            Err(CameraError::InvalidArgument(
                "recording buffers must carry metadata".into(),
            ))
        }
    }

    pub fn start_recording(&self) -> Result<()> {
        preview::start_recording(&self.core)
    }

    pub fn stop_recording(&self) {
        preview::stop_recording(&self.core)
    }

    pub fn recording_enabled(&self) -> bool {
        self.core.preview.recording_enabled()
    }

    /// Hands a recording frame back to the driver.
    pub fn release_recording_frame(&self, addrs: &CameraAddrs) {
        preview::release_recording_frame(&self.core, addrs)
    }

    /// Recording frames currently held by the consumer.
    pub fn outstanding_recording_frames(&self) -> usize {
        self.core.preview.outstanding_recording_frames()
    }

    // ------------------------------------------------------------------------
    // Focus and capture
    // ------------------------------------------------------------------------

    pub fn auto_focus(&self) -> Result<()> {
        autofocus::start_autofocus(&self.core)
    }

    pub fn cancel_auto_focus(&self) {
        autofocus::stop_autofocus(&self.core)
    }

    pub fn take_picture(&self) -> Result<()> {
        picture::start_picture(&self.core)
    }

    pub fn cancel_picture(&self) {
        picture::stop_picture(&self.core)
    }

    pub fn picture_in_progress(&self) -> bool {
        self.core.picture.worker.is_busy()
    }

    // ------------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------------

    pub fn send_command(&self, command: i32, arg1: i32, arg2: i32) -> Result<()> {
        debug!("ignoring command {} ({}, {})", command, arg1, arg2);
        Ok(())
    }

    pub fn dump(&self) -> Result<()> {
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Stops every activity and closes the capture nodes. Safe to call more
    /// than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let core = &self.core;
        autofocus::stop_autofocus(core);
        picture::stop_picture(core);
        preview::stop_recording(core);
        preview::stop_preview(core);

        for node in [NodeId::PREVIEW, NodeId::RECORDING] {
            core.gateway.close(node);
        }
        info!("camera {} released", core.id);
    }
}

impl Drop for ExynosCamera {
    fn drop(&mut self) {
        self.release();
    }
}
