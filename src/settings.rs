//! Configuration resolver
//!
//! Translates the textual [`ParamStore`] into the numeric settings the
//! pipeline runs with, and pushes sensor controls to the preview node.
//!
//! ## Delta application
//!
//! Every control value last written is cached in [`AppliedControls`]. A pass
//! writes a control only when its resolved value differs from the cache, or
//! when the pass is forced (first pass after open or after preview stop).
//! Control failures are logged and the pass carries on.

use tracing::{debug, warn};

use crate::params::ParamStore;
use crate::preset::Preset;
use crate::v4l2::{
    cid, DeviceGateway, Effect, FlashMode, FocusMode, IsoMode, Metering, NodeId, PixelFormat,
    SceneMode, SensorMode, WhiteBalance,
};

// ============================================================================
// Session settings
// ============================================================================

/// Last value written for each sensor control; `None` until first written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedControls {
    pub jpeg_quality: Option<i32>,
    pub sensor_output_size: Option<i32>,
    pub sensor_mode: Option<i32>,
    pub focus_mode: Option<i32>,
    pub focus_x: Option<i32>,
    pub focus_y: Option<i32>,
    pub zoom: Option<i32>,
    pub flash_mode: Option<i32>,
    pub exposure: Option<i32>,
    pub white_balance: Option<i32>,
    pub scene_mode: Option<i32>,
    pub effect: Option<i32>,
    pub iso: Option<i32>,
}

/// Numeric pipeline settings of one open session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Degrees applied through the ROTATION control.
    pub rotation: i32,
    pub hflip: bool,
    pub vflip: bool,
    /// Format the sensor delivers on still capture.
    pub camera_picture_format: PixelFormat,
    /// Focal length in hundredths of a millimetre.
    pub focal_length: i32,
    pub metering: Metering,

    pub preview_width: u32,
    pub preview_height: u32,
    pub preview_format: PixelFormat,
    pub preview_fps: u32,

    pub picture_width: u32,
    pub picture_height: u32,
    pub picture_format: PixelFormat,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub thumbnail_quality: i32,
    pub jpeg_quality: i32,

    pub recording_width: u32,
    pub recording_height: u32,
    pub recording_format: PixelFormat,

    pub applied: AppliedControls,
    /// Cleared on preview stop so the next pass writes every control.
    pub params_applied: bool,
}

impl SessionSettings {
    pub fn from_preset(preset: &Preset) -> Self {
        Self {
            rotation: preset.rotation,
            hflip: preset.hflip,
            vflip: preset.vflip,
            camera_picture_format: preset.picture_format,
            focal_length: (preset.focal_length * 100.0).round() as i32,
            metering: preset.metering,

            preview_width: 0,
            preview_height: 0,
            preview_format: PixelFormat::Nv21,
            preview_fps: 0,

            picture_width: 0,
            picture_height: 0,
            picture_format: PixelFormat::Jpeg,
            thumbnail_width: 0,
            thumbnail_height: 0,
            thumbnail_quality: 0,
            jpeg_quality: 0,

            recording_width: 0,
            recording_height: 0,
            recording_format: PixelFormat::Nv12,

            applied: AppliedControls::default(),
            params_applied: false,
        }
    }

    pub fn preview_frame_size(&self) -> usize {
        self.preview_format.frame_size(self.preview_width, self.preview_height)
    }
}

/// Outcome of one resolver pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplySummary {
    pub forced: bool,
    /// Control ids written, in order.
    pub written: Vec<u32>,
    pub failed: usize,
}

// ============================================================================
// Defaults
// ============================================================================

/// Fills `store` with every key the preset declares.
pub fn populate_defaults(store: &mut ParamStore, preset: &Preset) {
    let p = &preset.params;
    let mut put = |key: &str, value: &Option<String>| {
        if let Some(value) = value {
            store.set_string(key, value);
        }
    };

    put("preferred-preview-size-for-video", &p.preview_size);

    put("preview-size-values", &p.preview_size_values);
    put("preview-size", &p.preview_size);
    put("preview-format-values", &p.preview_format_values);
    put("preview-format", &p.preview_format);
    put("preview-frame-rate-values", &p.preview_frame_rate_values);
    put("preview-fps-range-values", &p.preview_fps_range_values);
    put("preview-fps-range", &p.preview_fps_range);

    put("picture-size-values", &p.picture_size_values);
    put("picture-size", &p.picture_size);
    put("picture-format-values", &p.picture_format_values);
    put("picture-format", &p.picture_format);
    put("jpeg-thumbnail-size-values", &p.jpeg_thumbnail_size_values);

    put("video-size", &p.recording_size);
    put("video-size-values", &p.recording_size_values);
    put("video-frame-format", &p.recording_format);

    put("focus-mode", &p.focus_mode);
    put("focus-mode-values", &p.focus_mode_values);
    put("focus-distances", &p.focus_distances);
    if p.max_num_focus_areas > 0 {
        put("focus-areas", &p.focus_areas);
    }

    put("flash-mode", &p.flash_mode);
    put("flash-mode-values", &p.flash_mode_values);
    put("whitebalance", &p.whitebalance);
    put("whitebalance-values", &p.whitebalance_values);
    put("scene-mode", &p.scene_mode);
    put("scene-mode-values", &p.scene_mode_values);
    put("effect", &p.effect);
    put("effect-values", &p.effect_values);
    put("iso", &p.iso);
    put("iso-values", &p.iso_values);

    store.set_int("preview-frame-rate", p.preview_frame_rate);
    store.set_int("jpeg-thumbnail-width", p.jpeg_thumbnail_width);
    store.set_int("jpeg-thumbnail-height", p.jpeg_thumbnail_height);
    store.set_int("jpeg-thumbnail-quality", p.jpeg_thumbnail_quality);
    store.set_int("jpeg-quality", p.jpeg_quality);

    if p.max_num_focus_areas > 0 {
        store.set_int("max-num-focus-areas", p.max_num_focus_areas);
    }

    if p.zoom_supported {
        store.set_string("zoom-supported", "true");
        if p.smooth_zoom_supported {
            store.set_string("smooth-zoom-supported", "true");
        }
        if let Some(ratios) = &p.zoom_ratios {
            store.set_string("zoom-ratios", ratios);
        }
        store.set_int("zoom", p.zoom);
        store.set_int("max-zoom", p.max_zoom);
    } else {
        store.set_string("zoom-supported", "false");
    }

    store.set_int("exposure-compensation", p.exposure_compensation);
    store.set_float("exposure-compensation-step", p.exposure_compensation_step);
    store.set_int("min-exposure-compensation", p.min_exposure_compensation);
    store.set_int("max-exposure-compensation", p.max_exposure_compensation);

    store.set_float("focal-length", preset.focal_length);
    store.set_float("horizontal-view-angle", preset.horizontal_view_angle);
    store.set_float("vertical-view-angle", preset.vertical_view_angle);
}

// ============================================================================
// Parsing helpers
// ============================================================================

/// Parses `"WxH"`.
pub fn parse_size(text: &str) -> Option<(u32, u32)> {
    let (w, h) = text.trim().split_once('x')?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// First entry of a `"WxH,WxH"` list whose aspect ratio equals
/// `width:height` exactly.
pub fn match_aspect(values: &str, width: u32, height: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    values
        .split(',')
        .filter_map(parse_size)
        .find(|&(w, h)| u64::from(width) * u64::from(h) == u64::from(w) * u64::from(height))
}

/// Parses `"(left,top,right,bottom,weight)"`.
pub fn parse_focus_area(text: &str) -> Option<[i32; 5]> {
    let inner = text.trim().strip_prefix('(')?.strip_suffix(')')?;
    let values = inner
        .split(',')
        .map(|v| v.trim().parse::<i32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .ok()?;
    values.try_into().ok()
}

/// Maps the centre of a focus area from the [-1000, 1000] space into preview
/// pixel coordinates.
pub fn focus_position(area: &[i32; 5], width: u32, height: u32) -> (i32, i32) {
    let [left, top, right, bottom, _] = *area;
    let map = |center: i32, dimension: u32| {
        ((i64::from(center) + 1000) * i64::from(dimension) / 2000) as i32
    };
    (map((left + right) / 2, width), map((top + bottom) / 2, height))
}

fn preview_format_from_param(value: &str) -> Option<PixelFormat> {
    match value {
        "yuv420sp" => Some(PixelFormat::Nv21),
        "yuv420p" => Some(PixelFormat::Yuv420),
        "rgb565" => Some(PixelFormat::Rgb565),
        "rgb8888" => Some(PixelFormat::Rgb32),
        _ => None,
    }
}

fn recording_format_from_param(value: &str) -> Option<PixelFormat> {
    match value {
        "yuv420sp" => Some(PixelFormat::Nv12),
        "yuv420p" => Some(PixelFormat::Yuv420),
        "rgb565" => Some(PixelFormat::Rgb565),
        "rgb8888" => Some(PixelFormat::Rgb32),
        _ => None,
    }
}

// ============================================================================
// Apply
// ============================================================================

struct ControlWriter<'a> {
    gateway: &'a dyn DeviceGateway,
    force: bool,
    summary: ApplySummary,
}

impl ControlWriter<'_> {
    fn sync(&mut self, cached: &mut Option<i32>, id: u32, value: i32) {
        if !self.force && *cached == Some(value) {
            return;
        }
        *cached = Some(value);
        self.summary.written.push(id);
        if let Err(e) = self.gateway.set_control(NodeId::PREVIEW, id, value) {
            warn!("control {:#x} = {} failed: {}", id, value, e);
            self.summary.failed += 1;
        }
    }
}

/// Reconciles `store` into `settings`, writing changed sensor controls.
pub fn apply_parameters(
    settings: &mut SessionSettings,
    store: &ParamStore,
    gateway: &dyn DeviceGateway,
) -> ApplySummary {
    let force = !settings.params_applied;
    if force {
        debug!("applying every parameter");
        settings.params_applied = true;
    }
    let mut out = ControlWriter {
        gateway,
        force,
        summary: ApplySummary {
            forced: force,
            ..ApplySummary::default()
        },
    };
    let applied = &mut settings.applied;

    // Preview
    if let Some(text) = store.get_string("preview-size") {
        match parse_size(&text) {
            Some((w, h)) => {
                if w != 0 {
                    settings.preview_width = w;
                }
                if h != 0 {
                    settings.preview_height = h;
                }
            }
            None => warn!("malformed preview size: {}", text),
        }
    }

    if let Some(text) = store.get_string("preview-format") {
        settings.preview_format = preview_format_from_param(&text).unwrap_or_else(|| {
            warn!("unsupported preview format: {}", text);
            PixelFormat::Nv21
        });
    }

    settings.preview_fps = store
        .get_int("preview-frame-rate")
        .filter(|&fps| fps > 0)
        .map_or(0, |fps| fps as u32);

    // Picture
    if let Some(text) = store.get_string("picture-size") {
        match parse_size(&text) {
            Some((w, h)) => {
                if w != 0 {
                    settings.picture_width = w;
                }
                if h != 0 {
                    settings.picture_height = h;
                }
            }
            None => warn!("malformed picture size: {}", text),
        }
    }

    if let Some(text) = store.get_string("picture-format") {
        if text != "jpeg" {
            warn!("unsupported picture format: {}", text);
        }
        settings.picture_format = PixelFormat::Jpeg;
    }

    // zero disables the thumbnail
    if let Some(w) = store.get_int("jpeg-thumbnail-width").filter(|&w| w >= 0) {
        settings.thumbnail_width = w as u32;
    }
    if let Some(h) = store.get_int("jpeg-thumbnail-height").filter(|&h| h >= 0) {
        settings.thumbnail_height = h as u32;
    }
    if let Some(q) = store.get_int("jpeg-thumbnail-quality").filter(|&q| q > 0) {
        settings.thumbnail_quality = q;
    }

    if let Some(q) = store.get_int("jpeg-quality").filter(|q| (0..=100).contains(q)) {
        settings.jpeg_quality = q;
        out.sync(&mut applied.jpeg_quality, cid::CAM_JPEG_QUALITY, q);
    }

    // Recording
    let video_size = store
        .get_string("video-size")
        .or_else(|| store.get_string("preview-size"));
    if let Some(text) = video_size {
        match parse_size(&text) {
            Some((w, h)) => {
                if w != 0 {
                    settings.recording_width = w;
                }
                if h != 0 {
                    settings.recording_height = h;
                }
            }
            None => warn!("malformed video size: {}", text),
        }
    }

    if let Some(text) = store.get_string("video-frame-format") {
        settings.recording_format = recording_format_from_param(&text).unwrap_or_else(|| {
            warn!("unsupported recording format: {}", text);
            PixelFormat::Nv12
        });
    }

    let sensor_mode = if store.get_string("recording-hint").as_deref() == Some("true") {
        let (rw, rh) = (settings.recording_width, settings.recording_height);
        let matched = store
            .get_string("preview-size-values")
            .and_then(|values| match_aspect(&values, rw, rh));
        if let Some((w, h)) = matched {
            debug!("recording {}x{} previews at {}x{}", rw, rh, w, h);
            settings.preview_width = w;
            settings.preview_height = h;
        }

        let output_size = (((rw & 0xffff) << 16) | (rh & 0xffff)) as i32;
        out.sync(&mut applied.sensor_output_size, cid::CAMERA_SENSOR_OUTPUT_SIZE, output_size);
        SensorMode::Movie
    } else {
        SensorMode::Camera
    };
    out.sync(&mut applied.sensor_mode, cid::CAMERA_SENSOR_MODE, sensor_mode as i32);

    // Focus
    if let Some(text) = store.get_string("focus-mode") {
        let mode = FocusMode::from_param(&text).unwrap_or(FocusMode::Auto);
        out.sync(&mut applied.focus_mode, cid::CAMERA_FOCUS_MODE, mode as i32);
    }

    if let Some(text) = store.get_string("focus-areas") {
        match parse_focus_area(&text) {
            Some(area) => {
                let (x, y) = focus_position(&area, settings.preview_width, settings.preview_height);
                out.sync(&mut applied.focus_x, cid::CAMERA_OBJECT_POSITION_X, x);
                out.sync(&mut applied.focus_y, cid::CAMERA_OBJECT_POSITION_Y, y);
            }
            None => warn!("malformed focus areas: {}", text),
        }
    }

    // Zoom
    if store.get_string("zoom-supported").as_deref() == Some("true") {
        if let (Some(zoom), Some(max)) = (store.get_int("zoom"), store.get_int("max-zoom")) {
            if (0..=max).contains(&zoom) {
                out.sync(&mut applied.zoom, cid::CAMERA_ZOOM, zoom);
            }
        }
    }

    // Flash
    if let Some(text) = store.get_string("flash-mode") {
        let mode = FlashMode::from_param(&text).unwrap_or(FlashMode::Auto);
        out.sync(&mut applied.flash_mode, cid::CAMERA_FLASH_MODE, mode as i32);
    }

    // Exposure
    if let (Some(ev), Some(min), Some(max)) = (
        store.get_int("exposure-compensation"),
        store.get_int("min-exposure-compensation"),
        store.get_int("max-exposure-compensation"),
    ) {
        if (min..=max).contains(&ev) {
            out.sync(&mut applied.exposure, cid::CAMERA_BRIGHTNESS, ev);
        }
    }

    if let Some(text) = store.get_string("whitebalance") {
        let wb = WhiteBalance::from_param(&text).unwrap_or(WhiteBalance::Auto);
        out.sync(&mut applied.white_balance, cid::CAMERA_WHITE_BALANCE, wb as i32);
    }

    if let Some(text) = store.get_string("scene-mode") {
        let scene = SceneMode::from_param(&text).unwrap_or(SceneMode::None);
        out.sync(&mut applied.scene_mode, cid::CAMERA_SCENE_MODE, scene as i32);
    }

    if let Some(text) = store.get_string("effect") {
        let effect = Effect::from_param(&text).unwrap_or(Effect::None);
        out.sync(&mut applied.effect, cid::CAMERA_EFFECT, effect as i32);
    }

    if let Some(text) = store.get_string("iso") {
        let iso = IsoMode::from_param(&text).unwrap_or(IsoMode::Auto);
        out.sync(&mut applied.iso, cid::CAMERA_ISO, iso as i32);
    }

    out.summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::CameraConfig;
    use crate::virtual_device::VirtualDevice;

    fn session(id: usize) -> (SessionSettings, ParamStore) {
        let config = CameraConfig::galaxys2();
        let preset = &config.presets[id];
        let mut store = ParamStore::new();
        populate_defaults(&mut store, preset);
        (SessionSettings::from_preset(preset), store)
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("640x480"), Some((640, 480)));
        assert_eq!(parse_size("640x"), None);
        assert_eq!(parse_size("garbage"), None);
    }

    #[test]
    fn test_aspect_match() {
        let values = "1280x720,640x480";
        assert_eq!(match_aspect(values, 1920, 1080), Some((1280, 720)));
        assert_eq!(match_aspect(values, 720, 480), None);
        assert_eq!(match_aspect(values, 320, 240), Some((640, 480)));
        assert_eq!(match_aspect(values, 0, 480), None);
    }

    #[test]
    fn test_focus_area_mapping() {
        let area = parse_focus_area("(-500,-500,500,500,100)").unwrap();
        assert_eq!(focus_position(&area, 640, 480), (320, 240));

        let corner = parse_focus_area("(-1000,-1000,-500,-500,1)").unwrap();
        assert_eq!(focus_position(&corner, 640, 480), (80, 60));

        assert_eq!(parse_focus_area("(1,2,3,4)"), None);
        assert_eq!(parse_focus_area("1,2,3,4,5"), None);
    }

    #[test]
    fn test_defaults_cover_preset_keys() {
        let (_, back) = session(0);
        for key in [
            "preview-size",
            "picture-size",
            "video-size",
            "focus-areas",
            "max-num-focus-areas",
            "zoom-ratios",
            "max-zoom",
            "flash-mode-values",
            "scene-mode-values",
            "exposure-compensation-step",
            "vertical-view-angle",
        ] {
            assert!(back.contains(key), "missing {}", key);
        }
        assert_eq!(back.get_string("zoom-supported").as_deref(), Some("true"));

        let (_, front) = session(1);
        assert_eq!(front.get_string("zoom-supported").as_deref(), Some("false"));
        assert!(!front.contains("focus-areas"));
        assert!(!front.contains("flash-mode"));
        assert!(!front.contains("zoom"));
        assert!(front.contains("iso-values"));
    }

    #[test]
    fn test_first_pass_forces_then_deltas_only() {
        let device = VirtualDevice::new();
        let (mut settings, mut store) = session(0);

        let first = apply_parameters(&mut settings, &store, &device);
        assert!(first.forced);
        assert!(first.written.contains(&cid::CAM_JPEG_QUALITY));
        assert!(first.written.contains(&cid::CAMERA_ZOOM));
        assert!(first.written.contains(&cid::CAMERA_ISO));
        assert_eq!(settings.preview_width, 640);
        assert_eq!(settings.picture_width, 3264);
        assert_eq!(settings.recording_height, 480);
        assert_eq!(settings.thumbnail_width, 320);

        let second = apply_parameters(&mut settings, &store, &device);
        assert!(!second.forced);
        assert!(second.written.is_empty());

        store.set_int("zoom", 12);
        store.set_string("whitebalance", "daylight");
        let third = apply_parameters(&mut settings, &store, &device);
        assert_eq!(third.written, vec![cid::CAMERA_ZOOM, cid::CAMERA_WHITE_BALANCE]);
        assert_eq!(device.control(cid::CAMERA_WHITE_BALANCE), Some(WhiteBalance::Sunny as i32));
    }

    #[test]
    fn test_out_of_range_values_are_ignored() {
        let device = VirtualDevice::new();
        let (mut settings, mut store) = session(0);
        apply_parameters(&mut settings, &store, &device);

        store.set_int("zoom", 31);
        store.set_int("exposure-compensation", -5);
        store.set_int("jpeg-quality", 101);
        let summary = apply_parameters(&mut settings, &store, &device);
        assert!(summary.written.is_empty());
        assert_eq!(settings.jpeg_quality, 90);
    }

    #[test]
    fn test_unknown_formats_degrade() {
        let device = VirtualDevice::new();
        let (mut settings, mut store) = session(0);
        store.set_string("preview-format", "bayer");
        store.set_string("picture-format", "png");
        store.set_string("video-frame-format", "h264");
        store.set_string("preview-size", "wide");

        apply_parameters(&mut settings, &store, &device);
        assert_eq!(settings.preview_format, PixelFormat::Nv21);
        assert_eq!(settings.picture_format, PixelFormat::Jpeg);
        assert_eq!(settings.recording_format, PixelFormat::Nv12);
        assert_eq!(settings.preview_width, 0);
    }

    #[test]
    fn test_recording_hint_matches_aspect() {
        let device = VirtualDevice::new();
        let (mut settings, mut store) = session(0);
        store.set_string("preview-size-values", "1280x720,640x480");
        store.set_string("video-size", "1920x1080");
        store.set_string("recording-hint", "true");

        let summary = apply_parameters(&mut settings, &store, &device);
        assert_eq!((settings.preview_width, settings.preview_height), (1280, 720));
        assert!(summary.written.contains(&cid::CAMERA_SENSOR_OUTPUT_SIZE));
        assert_eq!(device.control(cid::CAMERA_SENSOR_MODE), Some(SensorMode::Movie as i32));
        assert_eq!(
            device.control(cid::CAMERA_SENSOR_OUTPUT_SIZE),
            Some((1920 << 16) | 1080)
        );
    }

    #[test]
    fn test_malformed_focus_area_keeps_previous_position() {
        let device = VirtualDevice::new();
        let (mut settings, mut store) = session(0);
        store.set_string("focus-areas", "(-500,-500,500,500,100)");
        apply_parameters(&mut settings, &store, &device);
        assert_eq!(settings.applied.focus_x, Some(320));

        store.set_string("focus-areas", "(1,2,3)");
        let summary = apply_parameters(&mut settings, &store, &device);
        assert!(!summary.written.contains(&cid::CAMERA_OBJECT_POSITION_X));
        assert_eq!(settings.applied.focus_x, Some(320));
        assert_eq!(settings.applied.focus_y, Some(240));
    }

    #[test]
    fn test_control_failures_do_not_abort() {
        let device = VirtualDevice::new();
        device.fail_control(cid::CAMERA_FOCUS_MODE);
        let (mut settings, store) = session(0);

        let summary = apply_parameters(&mut settings, &store, &device);
        assert_eq!(summary.failed, 1);
        assert!(summary.written.contains(&cid::CAMERA_ISO));
    }
}
