//! Still capture
//!
//! `start_picture` stops preview, reconfigures the preview node for a single
//! capture buffer and hands the rest to a detached worker. The worker
//! extracts (JPEG sensors) or encodes (raw sensors) the main image and
//! thumbnail, wraps them in an EXIF container and delivers the result in
//! order: SHUTTER, RAW_IMAGE, COMPRESSED_IMAGE. Every buffer is produced
//! before the first callback, so a failed capture delivers nothing.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::callbacks::MessageType;
use crate::camera::Core;
use crate::encoder::{encode, EncodeParams, InputFormat, JpegCodec};
use crate::error::{CameraError, Result};
use crate::exif_writer::{assemble_jpeg, build_exif, ExifAttributes};
use crate::memory::{MemoryAllocator, MemoryBlock};
use crate::metrics::Timer;
use crate::params::ParamStore;
use crate::preview::{stop_preview, StreamGuard};
use crate::settings::SessionSettings;
use crate::v4l2::{cid, DeviceGateway, FormatMode, NodeId, PixelFormat, PollStatus};
use crate::worker::{lock, Worker, STOP_TIMEOUT};

pub(crate) struct PicturePipeline {
    pub worker: Arc<Worker>,
}

impl PicturePipeline {
    pub fn new() -> Self {
        Self {
            worker: Arc::new(Worker::new("picture")),
        }
    }
}

/// Everything a capture needs, frozen when it starts.
struct CaptureJob {
    settings: SessionSettings,
    params: ParamStore,
    memory: MemoryBlock,
    timer: Timer,
}

/// Encoded main image plus the optional thumbnail.
#[derive(Debug)]
struct CapturedImages {
    main: Vec<u8>,
    thumbnail: Option<Vec<u8>>,
}

pub(crate) fn start_picture(core: &Arc<Core>) -> Result<()> {
    let pipeline = &core.picture;
    if pipeline.worker.is_busy() {
        return Err(CameraError::Busy("a picture is already being taken".into()));
    }

    stop_preview(core);

    let (settings, params) = {
        let session = lock(&core.session);
        (session.settings.clone(), session.params.clone())
    };
    let gateway = core.gateway.as_ref();
    let node = NodeId::PREVIEW;
    let format = settings.camera_picture_format;
    let (width, height) = (settings.picture_width, settings.picture_height);

    gateway.enum_format(node, format)?;
    gateway.set_format(node, width, height, format, FormatMode::Capture)?;
    let granted = gateway.request_buffers(node, 1)?;
    if granted == 0 {
        return Err(CameraError::device(node, "request_buffers", "no capture buffer granted"));
    }
    let length = gateway.query_buffer(node, 0)?;

    let fd = gateway
        .fd(node)
        .ok_or_else(|| CameraError::device(node, "fd", "node not open"))?;
    let memory = core
        .allocator()?
        .request_memory(Some(fd), length, 1)
        .ok_or_else(|| CameraError::OutOfMemory(format!("{}-byte capture buffer", length)))?;

    gateway.queue_buffer(node, 0)?;
    let guard = StreamGuard::on(gateway, node)?;
    gateway.set_control(node, cid::CAMERA_CAPTURE, 0)?;

    let job = CaptureJob {
        settings,
        params,
        memory,
        timer: Timer::new(),
    };
    let worker_core = Arc::clone(core);
    pipeline
        .worker
        .launch(move |worker| capture_worker(&worker_core, job, worker))?;
    guard.keep();

    info!("capture started: {}x{} {}", width, height, format);
    Ok(())
}

/// Cancels an in-flight capture. No callbacks fire after this returns.
pub(crate) fn stop_picture(core: &Core) {
    let worker = &core.picture.worker;
    if !worker.is_busy() {
        debug!("no picture in progress");
        return;
    }
    worker.stop(STOP_TIMEOUT);
}

fn capture_worker(core: &Core, job: CaptureJob, worker: &Worker) {
    match capture(core, &job, worker) {
        Ok(()) => {
            let elapsed = job.timer.elapsed_ms();
            core.metrics.record_picture(true, elapsed);
            info!("picture delivered in {} ms", elapsed);
        }
        Err(e) => {
            core.metrics.record_picture(false, 0);
            error!("picture failed: {}", e);
        }
    }
    // Dropping the job releases the capture buffer.
}

fn capture(core: &Core, job: &CaptureJob, worker: &Worker) -> Result<()> {
    let gateway = core.gateway.as_ref();
    let node = NodeId::PREVIEW;
    let stream = StreamGuard::adopt(gateway, node);

    if gateway.poll(node)? == PollStatus::Timeout {
        return Err(CameraError::Timeout(format!("{} capture poll", node)));
    }
    stream.off()?;
    let index = gateway.dequeue_buffer(node)?;
    if index != 0 {
        return Err(CameraError::device(
            node,
            "dequeue_buffer",
            format!("unexpected capture buffer {}", index),
        ));
    }

    let images = if job.settings.camera_picture_format == PixelFormat::Jpeg {
        extract_jpeg(gateway, &job.memory, &job.settings)?
    } else {
        encode_raw(core.codec.as_ref(), &job.memory, &job.settings)?
    };

    let attrs = ExifAttributes::gather(
        &core.config.identity,
        &job.settings,
        &job.params,
        gateway,
        (core.clock)(),
    );
    let exif = build_exif(&attrs, images.thumbnail.as_deref())?;
    let container = assemble_jpeg(&images.main, &exif)?;

    let allocator = core.allocator()?;
    let thumbnail = images
        .thumbnail
        .as_deref()
        .map(|bytes| copy_to_block(allocator.as_ref(), bytes))
        .transpose()?;
    let compressed = copy_to_block(allocator.as_ref(), &container)?;

    if !worker.is_enabled() {
        return Err(CameraError::Cancelled("capture stopped before delivery".into()));
    }

    core.notify(MessageType::SHUTTER, 0, 0);
    if let Some(thumbnail) = &thumbnail {
        core.deliver(MessageType::RAW_IMAGE, thumbnail, 0);
    }
    core.deliver(MessageType::COMPRESSED_IMAGE, &compressed, 0);
    Ok(())
}

/// Copies the sensor's main and thumbnail JPEGs out of the capture buffer
/// at the offsets the driver publishes.
fn extract_jpeg(
    gateway: &dyn DeviceGateway,
    memory: &MemoryBlock,
    settings: &SessionSettings,
) -> Result<CapturedImages> {
    let node = NodeId::PREVIEW;
    let main_size = gateway.get_control(node, cid::CAM_JPEG_MAIN_SIZE)?;
    let main_offset = gateway.get_control(node, cid::CAM_JPEG_MAIN_OFFSET)?;
    let main = read_region(memory, main_offset, main_size, "main image")?;

    let thumbnail = if settings.thumbnail_width == 0 || settings.thumbnail_height == 0 {
        None
    } else {
        let size = gateway.get_control(node, cid::CAM_JPEG_THUMB_SIZE)?;
        let offset = gateway.get_control(node, cid::CAM_JPEG_THUMB_OFFSET)?;
        if size == 0 {
            warn!("sensor produced no thumbnail");
            None
        } else {
            Some(read_region(memory, offset, size, "thumbnail")?)
        }
    };

    debug!(
        "sensor JPEG: main {} bytes, thumbnail {} bytes",
        main.len(),
        thumbnail.as_ref().map_or(0, Vec::len)
    );
    Ok(CapturedImages { main, thumbnail })
}

fn read_region(memory: &MemoryBlock, offset: i32, size: i32, what: &str) -> Result<Vec<u8>> {
    let (Ok(offset), Ok(size)) = (usize::try_from(offset), usize::try_from(size)) else {
        return Err(CameraError::Malformed(format!(
            "{} reported at offset {} size {}",
            what, offset, size
        )));
    };
    memory.read(offset, size).ok_or_else(|| {
        CameraError::Malformed(format!(
            "{} at {}+{} exceeds the {}-byte capture buffer",
            what,
            offset,
            size,
            memory.len()
        ))
    })
}

/// Encodes the main image and thumbnail from raw sensor output.
fn encode_raw(
    codec: &dyn JpegCodec,
    memory: &MemoryBlock,
    settings: &SessionSettings,
) -> Result<CapturedImages> {
    let input = InputFormat::from_pixel_format(settings.camera_picture_format).unwrap_or_else(|| {
        warn!(
            "no encoder input for {}, assuming 4:2:2",
            settings.camera_picture_format
        );
        InputFormat::Yuyv
    });
    let source = (settings.picture_width, settings.picture_height);
    let pixels = memory.to_vec();

    let main = encode(
        codec,
        EncodeParams::new(input, source, source, settings.jpeg_quality),
        &pixels,
    )?;

    let thumbnail = if settings.thumbnail_width == 0 || settings.thumbnail_height == 0 {
        None
    } else {
        Some(encode(
            codec,
            EncodeParams::new(
                input,
                source,
                (settings.thumbnail_width, settings.thumbnail_height),
                settings.thumbnail_quality,
            ),
            &pixels,
        )?)
    };

    Ok(CapturedImages { main, thumbnail })
}

fn copy_to_block(allocator: &dyn MemoryAllocator, bytes: &[u8]) -> Result<MemoryBlock> {
    let block = allocator
        .request_memory(None, bytes.len(), 1)
        .ok_or_else(|| CameraError::OutOfMemory(format!("{}-byte delivery buffer", bytes.len())))?;
    if !block.write(0, bytes) {
        return Err(CameraError::OutOfMemory(format!(
            "delivery buffer shorter than {} bytes",
            bytes.len()
        )));
    }
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::CameraConfig;
    use crate::encoder::ImageJpegCodec;
    use crate::virtual_device::VirtualDevice;

    fn front_settings() -> SessionSettings {
        let config = CameraConfig::galaxys2();
        let mut settings = SessionSettings::from_preset(&config.presets[1]);
        settings.picture_width = 64;
        settings.picture_height = 48;
        settings.thumbnail_width = 16;
        settings.thumbnail_height = 12;
        settings
    }

    #[test]
    fn test_raw_capture_encodes_main_and_thumbnail() {
        let settings = front_settings();
        let memory = MemoryBlock::zeroed(64 * 48 * 2, 1);
        let images = encode_raw(&ImageJpegCodec, &memory, &settings).unwrap();
        assert_eq!(&images.main[..2], &[0xFF, 0xD8]);
        let thumb = images.thumbnail.unwrap();
        let decoded = image::load_from_memory(&thumb).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 12));
    }

    #[test]
    fn test_zero_thumbnail_is_skipped() {
        let mut settings = front_settings();
        settings.thumbnail_width = 0;
        let memory = MemoryBlock::zeroed(64 * 48 * 2, 1);
        let images = encode_raw(&ImageJpegCodec, &memory, &settings).unwrap();
        assert!(images.thumbnail.is_none());
    }

    #[test]
    fn test_out_of_range_jpeg_offsets_are_malformed() {
        let device = VirtualDevice::new();
        device.set_sensor_value(cid::CAM_JPEG_MAIN_SIZE, 4096);
        device.set_sensor_value(cid::CAM_JPEG_MAIN_OFFSET, 0);
        let memory = MemoryBlock::zeroed(1024, 1);
        let err = extract_jpeg(&device, &memory, &front_settings()).unwrap_err();
        assert!(matches!(err, CameraError::Malformed(_)));
    }

    #[test]
    fn test_negative_jpeg_size_is_malformed() {
        let memory = MemoryBlock::zeroed(16, 1);
        assert!(matches!(
            read_region(&memory, 0, -1, "main image"),
            Err(CameraError::Malformed(_))
        ));
        assert_eq!(read_region(&memory, 4, 4, "main image").unwrap().len(), 4);
    }
}
