//! Integration tests for the camera pipelines on the virtual device

use exynos_camera::v4l2::{af_status, cid, AUTO_FOCUS_OFF};
use exynos_camera::{
    summarize_jpeg, CameraAddrs, CameraConfig, CameraError, Callbacks, ExynosCamera, MessageType,
    NodeId, PreviewWindow, VirtualDevice, WindowBuffer,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

/// Helper to open a camera on a fresh virtual device
fn open_camera(id: usize, device: VirtualDevice) -> (Arc<VirtualDevice>, ExynosCamera) {
    let device = Arc::new(device);
    let camera = ExynosCamera::open(Arc::new(CameraConfig::galaxys2()), id, device.clone()).unwrap();
    (device, camera)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Debug, Default)]
struct WindowLog {
    buffer_count: usize,
    usage: u32,
    geometry: Option<(u32, u32, u32)>,
    frames: usize,
    last_frame: Vec<u8>,
}

struct TestWindow {
    log: Arc<Mutex<WindowLog>>,
    next_id: usize,
}

impl TestWindow {
    fn new() -> (Self, Arc<Mutex<WindowLog>>) {
        let log = Arc::new(Mutex::new(WindowLog::default()));
        (Self { log: log.clone(), next_id: 0 }, log)
    }
}

impl PreviewWindow for TestWindow {
    fn set_buffer_count(&mut self, count: usize) -> exynos_camera::Result<()> {
        self.log.lock().unwrap().buffer_count = count;
        Ok(())
    }

    fn set_usage(&mut self, usage: u32) -> exynos_camera::Result<()> {
        self.log.lock().unwrap().usage = usage;
        Ok(())
    }

    fn set_buffers_geometry(&mut self, width: u32, height: u32, hal_format: u32) -> exynos_camera::Result<()> {
        self.log.lock().unwrap().geometry = Some((width, height, hal_format));
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> exynos_camera::Result<WindowBuffer> {
        let (w, h, _) = self.log.lock().unwrap().geometry.unwrap_or((0, 0, 0));
        self.next_id += 1;
        Ok(WindowBuffer {
            id: self.next_id,
            data: vec![0; (w * h * 3 / 2) as usize],
        })
    }

    fn enqueue_buffer(&mut self, buffer: WindowBuffer) -> exynos_camera::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.frames += 1;
        log.last_frame = buffer.data;
        Ok(())
    }

    fn cancel_buffer(&mut self, _buffer: WindowBuffer) -> exynos_camera::Result<()> {
        Ok(())
    }
}

/// Collects every notify and data message in arrival order.
fn recording_callbacks(
    device: &Arc<VirtualDevice>,
) -> (Callbacks, Arc<Mutex<Vec<(MessageType, i32)>>>, mpsc::Receiver<Vec<u8>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);

    let notify_events = events.clone();
    let data_events = events.clone();
    let callbacks = Callbacks::new()
        .with_allocator(device.allocator())
        .with_notify(move |msg, ext1, _| notify_events.lock().unwrap().push((msg, ext1)))
        .with_data(move |msg, block, _| {
            data_events.lock().unwrap().push((msg, 0));
            if msg == MessageType::COMPRESSED_IMAGE {
                let _ = tx.lock().unwrap().send(block.to_vec());
            }
        });
    (callbacks, events, rx)
}

// ============================================================================
// Preview
// ============================================================================

#[test]
fn test_preview_streams_into_window() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_parameters("preview-size=320x240").unwrap();

    let frames = Arc::new(Mutex::new(0usize));
    let counter = frames.clone();
    camera.set_callbacks(
        Callbacks::new()
            .with_allocator(device.allocator())
            .with_data(move |msg, block, index| {
                assert_eq!(msg, MessageType::PREVIEW_FRAME);
                assert!(block.slot(index).is_some());
                *counter.lock().unwrap() += 1;
            }),
    );
    camera.enable_msg_type(MessageType::PREVIEW_FRAME);

    let (window, log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    camera.start_preview().unwrap();

    assert!(wait_until(|| log.lock().unwrap().frames >= 3));
    assert!(*frames.lock().unwrap() >= 3);
    assert!(camera.preview_enabled());

    {
        let log = log.lock().unwrap();
        assert_eq!(log.buffer_count, 8);
        assert_eq!(log.usage, exynos_camera::v4l2::hal::USAGE_SW_WRITE_OFTEN);
        assert_eq!(
            log.geometry,
            Some((320, 240, exynos_camera::v4l2::hal::PIXEL_FORMAT_YCRCB_420_SP))
        );
        assert!(log.last_frame.iter().any(|&b| b != 0));
    }
    assert_eq!(device.buffer_count(NodeId::PREVIEW), 8);
    assert_eq!(device.fps(NodeId::PREVIEW), 30);
    assert_eq!(device.control(cid::CACHEABLE), Some(1));

    camera.stop_preview();
    assert!(!camera.preview_enabled());
    assert!(!device.is_streaming(NodeId::PREVIEW));
}

#[test]
fn test_preview_waits_for_window() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
    camera.start_preview().unwrap();

    thread::sleep(Duration::from_millis(50));
    assert!(camera.preview_enabled());
    assert!(!device.calls().iter().any(|c| c == "node0:dequeue_buffer"));

    let (window, log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    assert!(wait_until(|| log.lock().unwrap().frames >= 1));
    camera.stop_preview();
}

#[test]
fn test_start_preview_twice_is_noop() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
    camera.start_preview().unwrap();
    camera.start_preview().unwrap();
    let stream_ons = device.calls().iter().filter(|c| c.as_str() == "node0:stream_on").count();
    assert_eq!(stream_ons, 1);

    camera.stop_preview();
    camera.stop_preview();
}

#[test]
fn test_preview_without_allocator_fails_cleanly() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    let err = camera.start_preview().unwrap_err();
    assert!(matches!(err, CameraError::InvalidArgument(_)));
    assert!(!camera.preview_enabled());
    assert!(!device.is_streaming(NodeId::PREVIEW));
}

#[test]
fn test_preview_buffer_count_steps_down() {
    let (device, camera) = open_camera(0, VirtualDevice::new().with_max_buffers(4));
    camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
    camera.start_preview().unwrap();
    assert_eq!(device.buffer_count(NodeId::PREVIEW), 4);
    assert!(device.queued(NodeId::PREVIEW) <= 4);
    camera.stop_preview();

    // the window is sized from the last negotiated count
    let (window, log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    assert_eq!(log.lock().unwrap().buffer_count, 4);
}

#[test]
fn test_preview_failure_stops_worker_and_restarts() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
    let (window, _log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();

    device.fail_op("poll");
    camera.start_preview().unwrap();
    assert!(wait_until(|| !camera.preview_enabled()));
    assert_eq!(camera.metrics().preview.failures, 1);

    // restarting tears the dead stream down, window included
    device.clear_failures();
    camera.start_preview().unwrap();
    assert!(camera.preview_enabled());
    let (window, log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    assert!(wait_until(|| log.lock().unwrap().frames >= 1));
    camera.stop_preview();
}

#[test]
fn test_preview_stop_forces_full_reapply() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
    let quality_write = format!("node0:set_control:{:#x}=", cid::CAM_JPEG_QUALITY);

    device.clear_calls();
    camera.start_preview().unwrap();
    assert!(!device.calls().iter().any(|c| c.starts_with(&quality_write)));
    camera.stop_preview();

    device.clear_calls();
    camera.start_preview().unwrap();
    assert!(device.calls().iter().any(|c| c.starts_with(&quality_write)));
    camera.stop_preview();
}

// ============================================================================
// Recording
// ============================================================================

#[test]
fn test_recording_frames_are_bounded_and_released_once() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_parameters("preview-size=320x240;video-size=640x480").unwrap();

    let (tx, rx) = mpsc::channel::<CameraAddrs>();
    let tx = Mutex::new(tx);
    camera.set_callbacks(
        Callbacks::new()
            .with_allocator(device.allocator())
            .with_data_timestamp(move |ts, msg, block, index| {
                assert_eq!(msg, MessageType::VIDEO_FRAME);
                assert!(ts > 0);
                let addrs = CameraAddrs::from_block(block, index).unwrap();
                let _ = tx.lock().unwrap().send(addrs);
            }),
    );
    camera.enable_msg_type(MessageType::VIDEO_FRAME);
    camera.store_meta_data_in_buffers(true).unwrap();

    let (window, _log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    camera.start_preview().unwrap();
    camera.start_recording().unwrap();
    assert!(camera.recording_enabled());

    let buffers = device.buffer_count(NodeId::RECORDING) as usize;
    assert_eq!(buffers, 8);
    let geometry = device.geometry(NodeId::RECORDING).unwrap();
    assert_eq!((geometry.width, geometry.height), (640, 480));

    let mut last = None;
    for _ in 0..10 {
        let addrs = rx.recv_timeout(WAIT).unwrap();
        assert!((addrs.index as usize) < buffers);
        assert_ne!(addrs.y, 0);
        assert_eq!(addrs.cbcr, addrs.y + 640 * 480);
        assert!(camera.outstanding_recording_frames() <= buffers);
        camera.release_recording_frame(&addrs);
        last = Some(addrs);
    }

    // a second release of the same frame is ignored
    camera.release_recording_frame(&last.unwrap());

    camera.stop_recording();
    assert!(!camera.recording_enabled());
    assert!(!device.is_streaming(NodeId::RECORDING));
    assert_eq!(camera.metrics().recording.released, 10);

    // releases after stop are ignored
    camera.release_recording_frame(&last.unwrap());
    assert_eq!(camera.metrics().recording.released, 10);
    camera.stop_preview();
}

#[test]
fn test_recording_without_consumer_requeues() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
    let (window, _log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    camera.start_preview().unwrap();
    camera.start_recording().unwrap();

    assert!(wait_until(|| camera.metrics().recording.requeued >= 5));
    assert_eq!(camera.metrics().recording.delivered, 0);
    assert_eq!(camera.outstanding_recording_frames(), 0);

    camera.stop_recording();
    camera.stop_preview();
}

// ============================================================================
// Still capture
// ============================================================================

#[test]
fn test_capture_delivers_exif_jpeg_in_order() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera
        .set_parameters("picture-size=640x480;rotation=90;gps-latitude=37.5665;gps-longitude=126.978;gps-altitude=38;gps-timestamp=1700000000;gps-processing-method=GPS")
        .unwrap();
    let (callbacks, events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::SHUTTER | MessageType::RAW_IMAGE | MessageType::COMPRESSED_IMAGE);

    camera.take_picture().unwrap();
    let jpeg = rx.recv_timeout(WAIT).unwrap();
    assert!(wait_until(|| !camera.picture_in_progress()));

    let order: Vec<MessageType> = events.lock().unwrap().iter().map(|(m, _)| *m).collect();
    assert_eq!(
        order,
        vec![MessageType::SHUTTER, MessageType::RAW_IMAGE, MessageType::COMPRESSED_IMAGE]
    );

    assert_eq!(&jpeg[..4], &[0xFF, 0xD8, 0xFF, 0xE1]);
    let summary = summarize_jpeg(&jpeg).unwrap();
    assert_eq!(summary.make.as_deref(), Some("SAMSUNG"));
    assert_eq!(summary.orientation, Some(6));
    let dims = summary.dimensions.as_ref().unwrap();
    assert_eq!((dims.width, dims.height), (640, 480));
    let thumb = summary.thumbnail.as_ref().unwrap();
    assert_eq!((thumb.width, thumb.height), (Some(320), Some(240)));
    let gps = summary.gps.as_ref().unwrap();
    assert!((gps.latitude - 37.5665).abs() < 1e-3);
    assert!((gps.longitude - 126.978).abs() < 1e-3);
    assert_eq!(gps.altitude, Some(38.0));

    // the main image still decodes past the EXIF segment
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 480));

    assert_eq!(camera.metrics().picture.taken, 1);
    assert!(!device.is_streaming(NodeId::PREVIEW));
}

#[test]
fn test_capture_stops_preview_before_reconfiguring() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_parameters("picture-size=640x480").unwrap();
    let (callbacks, _events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::COMPRESSED_IMAGE);

    let (window, log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    camera.start_preview().unwrap();
    assert!(wait_until(|| log.lock().unwrap().frames >= 2));

    camera.take_picture().unwrap();
    rx.recv_timeout(WAIT).unwrap();
    assert!(!camera.preview_enabled());

    let calls = device.calls();
    let capture_format = calls
        .iter()
        .position(|c| c == "node0:set_format:capture")
        .unwrap();
    let stream_off = calls[..capture_format]
        .iter()
        .rposition(|c| c == "node0:stream_off")
        .unwrap();
    assert!(!calls[stream_off..capture_format]
        .iter()
        .any(|c| c == "node0:dequeue_buffer"));
    assert_eq!(
        device.geometry(NodeId::PREVIEW).unwrap().format,
        exynos_camera::PixelFormat::Jpeg
    );
}

#[test]
fn test_second_capture_is_busy() {
    let (device, camera) = open_camera(
        0,
        VirtualDevice::new().with_frame_interval(Duration::from_millis(300)),
    );
    camera.set_parameters("picture-size=640x480").unwrap();
    let (callbacks, _events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::COMPRESSED_IMAGE);

    camera.take_picture().unwrap();
    assert!(matches!(camera.take_picture(), Err(CameraError::Busy(_))));
    rx.recv_timeout(WAIT).unwrap();
    assert!(wait_until(|| !camera.picture_in_progress()));
    assert_eq!(camera.metrics().picture.taken, 1);
}

#[test]
fn test_cancelled_capture_delivers_nothing() {
    let (device, camera) = open_camera(
        0,
        VirtualDevice::new().with_frame_interval(Duration::from_millis(200)),
    );
    camera.set_parameters("picture-size=640x480").unwrap();
    let (callbacks, events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::SHUTTER | MessageType::COMPRESSED_IMAGE);

    camera.take_picture().unwrap();
    camera.cancel_picture();
    assert!(!camera.picture_in_progress());
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(camera.metrics().picture.failed, 1);
}

#[test]
fn test_corrupt_sensor_jpeg_fails_capture() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_parameters("picture-size=640x480").unwrap();
    let (callbacks, events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::SHUTTER | MessageType::COMPRESSED_IMAGE);

    device.break_next_jpeg();
    camera.take_picture().unwrap();
    assert!(wait_until(|| !camera.picture_in_progress()));
    assert!(rx.try_recv().is_err());
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(camera.metrics().picture.failed, 1);

    // the next capture is unaffected
    camera.take_picture().unwrap();
    rx.recv_timeout(WAIT).unwrap();
}

#[test]
fn test_failed_capture_poll_releases_preview_node() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_parameters("picture-size=640x480").unwrap();
    let (callbacks, events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::SHUTTER | MessageType::COMPRESSED_IMAGE);

    device.fail_op("poll");
    camera.take_picture().unwrap();
    assert!(wait_until(|| !camera.picture_in_progress()));
    assert!(!device.is_streaming(NodeId::PREVIEW));
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(camera.metrics().picture.failed, 1);
    device.clear_failures();

    // the node can be reconfigured for preview and for another capture
    let (window, log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    camera.start_preview().unwrap();
    assert!(wait_until(|| log.lock().unwrap().frames >= 1));

    camera.take_picture().unwrap();
    rx.recv_timeout(WAIT).unwrap();
    assert_eq!(camera.metrics().picture.taken, 1);
}

#[test]
fn test_preview_start_during_capture_is_busy() {
    let (device, camera) = open_camera(
        0,
        VirtualDevice::new().with_frame_interval(Duration::from_millis(300)),
    );
    camera.set_parameters("picture-size=640x480").unwrap();
    let (callbacks, _events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::COMPRESSED_IMAGE);

    camera.take_picture().unwrap();
    device.clear_calls();
    assert!(matches!(camera.start_preview(), Err(CameraError::Busy(_))));
    assert!(!camera.preview_enabled());
    assert!(!device.calls().iter().any(|c| c == "node0:set_format:preview"));

    rx.recv_timeout(WAIT).unwrap();
    assert!(wait_until(|| !camera.picture_in_progress()));
    camera.start_preview().unwrap();
    assert!(camera.preview_enabled());
}

#[test]
fn test_front_camera_encodes_raw_capture() {
    let (device, camera) = open_camera(1, VirtualDevice::new());
    camera.set_parameters("picture-size=640x480").unwrap();
    let (callbacks, events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::RAW_IMAGE | MessageType::COMPRESSED_IMAGE);

    camera.take_picture().unwrap();
    let jpeg = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(events.lock().unwrap().len(), 2);
    assert_eq!(
        device.geometry(NodeId::PREVIEW).unwrap().format,
        exynos_camera::PixelFormat::Yuyv
    );

    let summary = summarize_jpeg(&jpeg).unwrap();
    let thumb = summary.thumbnail.unwrap();
    assert_eq!((thumb.width, thumb.height), (Some(160), Some(120)));
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (640, 480));
}

#[test]
fn test_capture_written_file_reads_back() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("capture.jpg");

    let (device, camera) = open_camera(0, VirtualDevice::new());
    camera.set_parameters("picture-size=640x480;jpeg-thumbnail-width=0;jpeg-thumbnail-height=0").unwrap();
    let (callbacks, events, rx) = recording_callbacks(&device);
    camera.set_callbacks(callbacks);
    camera.enable_msg_type(MessageType::RAW_IMAGE | MessageType::COMPRESSED_IMAGE);

    camera.take_picture().unwrap();
    let jpeg = rx.recv_timeout(WAIT).unwrap();
    std::fs::write(&path, &jpeg).unwrap();

    // no thumbnail means no RAW_IMAGE delivery and no IFD1
    assert_eq!(events.lock().unwrap().len(), 1);
    let summary = exynos_camera::read_summary(&path).unwrap();
    assert!(summary.thumbnail.is_none());
    assert_eq!(summary.model.as_deref(), Some("SAMSUNG"));
}

// ============================================================================
// Autofocus
// ============================================================================

fn focus_channel(device: &Arc<VirtualDevice>, camera: &ExynosCamera) -> mpsc::Receiver<i32> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    camera.set_callbacks(
        Callbacks::new()
            .with_allocator(device.allocator())
            .with_notify(move |msg, ext1, _| {
                if msg == MessageType::FOCUS {
                    let _ = tx.lock().unwrap().send(ext1);
                }
            }),
    );
    camera.enable_msg_type(MessageType::FOCUS);
    rx
}

#[test]
fn test_autofocus_success() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    let rx = focus_channel(&device, &camera);
    device.script_focus(3, af_status::SUCCESS);

    camera.auto_focus().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
    assert_eq!(device.control(cid::CAMERA_SET_AUTO_FOCUS), Some(AUTO_FOCUS_OFF));
    assert!(wait_until(|| camera.metrics().focus.success == 1));
}

#[test]
fn test_autofocus_failure() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    let rx = focus_channel(&device, &camera);
    device.script_focus(1, af_status::FAIL);

    camera.auto_focus().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);
}

#[test]
fn test_autofocus_cancel_notifies_failure() {
    let (device, camera) = open_camera(0, VirtualDevice::new());
    let rx = focus_channel(&device, &camera);
    device.script_focus(100_000, af_status::SUCCESS);

    camera.auto_focus().unwrap();
    assert!(matches!(camera.auto_focus(), Err(CameraError::Busy(_))));
    thread::sleep(Duration::from_millis(30));
    camera.cancel_auto_focus();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0);
    assert_eq!(device.control(cid::CAMERA_SET_AUTO_FOCUS), Some(AUTO_FOCUS_OFF));

    // a new search can start once the previous one exited
    device.script_focus(0, af_status::SUCCESS);
    camera.auto_focus().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_release_stops_everything() {
    let (device, mut camera) = open_camera(0, VirtualDevice::new());
    camera.set_callbacks(Callbacks::new().with_allocator(device.allocator()));
    let (window, _log) = TestWindow::new();
    camera.set_preview_window(Some(Box::new(window))).unwrap();
    camera.start_preview().unwrap();
    camera.start_recording().unwrap();
    device.script_focus(100_000, af_status::SUCCESS);
    camera.auto_focus().unwrap();

    camera.release();
    assert!(!camera.preview_enabled());
    assert!(!camera.recording_enabled());
    assert!(!device.is_open(NodeId::PREVIEW));
    assert!(!device.is_open(NodeId::RECORDING));
}

#[test]
fn test_firmware_read_failure_is_tolerated() {
    let device = VirtualDevice::new();
    device.fail_control(cid::CAM_SENSOR_FW_VER);
    let (device, camera) = open_camera(0, device);
    assert!(device.is_open(NodeId::PREVIEW));
    assert!(camera.parameter("preview-size").is_some());
}
