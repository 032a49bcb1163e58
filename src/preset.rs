//! Per-device camera configuration
//!
//! A [`CameraConfig`] is the ordered list of sensor presets plus the
//! device-node table for one board. It is built once (either the built-in
//! Galaxy S2 table or a JSON file) and shared read-only by every session.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CameraError, Result};
use crate::v4l2::{Metering, NodeId, PixelFormat};

pub const MAX_PRESETS: usize = 2;
pub const MAX_NODES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Back = 0,
    Front = 1,
}

/// Static strings stamped into every EXIF block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub make: String,
    pub model: String,
    pub software: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            make: "SAMSUNG".to_string(),
            model: "SAMSUNG".to_string(),
            software: "SAMSUNG".to_string(),
        }
    }
}

/// Enumerated parameter defaults and ranges advertised for one sensor.
///
/// `None` means the sensor does not support the setting and the key is
/// left out of the parameter store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetParams {
    pub preview_size_values: Option<String>,
    pub preview_size: Option<String>,
    pub preview_format_values: Option<String>,
    pub preview_format: Option<String>,
    pub preview_frame_rate_values: Option<String>,
    pub preview_frame_rate: i32,
    pub preview_fps_range_values: Option<String>,
    pub preview_fps_range: Option<String>,

    pub picture_size_values: Option<String>,
    pub picture_size: Option<String>,
    pub picture_format_values: Option<String>,
    pub picture_format: Option<String>,
    pub jpeg_thumbnail_size_values: Option<String>,
    pub jpeg_thumbnail_width: i32,
    pub jpeg_thumbnail_height: i32,
    pub jpeg_thumbnail_quality: i32,
    pub jpeg_quality: i32,

    pub recording_size: Option<String>,
    pub recording_size_values: Option<String>,
    pub recording_format: Option<String>,

    pub focus_mode: Option<String>,
    pub focus_mode_values: Option<String>,
    pub focus_distances: Option<String>,
    pub focus_areas: Option<String>,
    pub max_num_focus_areas: i32,

    pub zoom_supported: bool,
    pub smooth_zoom_supported: bool,
    pub zoom_ratios: Option<String>,
    pub zoom: i32,
    pub max_zoom: i32,

    pub flash_mode: Option<String>,
    pub flash_mode_values: Option<String>,

    pub exposure_compensation: i32,
    pub exposure_compensation_step: f32,
    pub min_exposure_compensation: i32,
    pub max_exposure_compensation: i32,

    pub whitebalance: Option<String>,
    pub whitebalance_values: Option<String>,

    pub scene_mode: Option<String>,
    pub scene_mode_values: Option<String>,

    pub effect: Option<String>,
    pub effect_values: Option<String>,

    pub iso: Option<String>,
    pub iso_values: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    pub facing: Facing,
    /// Mounting orientation reported to the framework, in degrees.
    pub orientation: i32,
    pub rotation: i32,
    pub hflip: bool,
    pub vflip: bool,
    /// Format the sensor delivers on still capture.
    pub picture_format: PixelFormat,
    /// Millimetres.
    pub focal_length: f32,
    pub horizontal_view_angle: f32,
    pub vertical_view_angle: f32,
    pub metering: Metering,
    pub params: PresetParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub id: NodeId,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub presets: Vec<Preset>,
    pub nodes: Vec<DeviceNode>,
    #[serde(default)]
    pub identity: DeviceIdentity,
}

impl CameraConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: CameraConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.presets.is_empty() || self.presets.len() > MAX_PRESETS {
            return Err(CameraError::InvalidArgument(format!(
                "{} presets configured (1..={} supported)",
                self.presets.len(),
                MAX_PRESETS
            )));
        }
        if self.nodes.len() > MAX_NODES {
            return Err(CameraError::InvalidArgument(format!(
                "{} device nodes configured ({} supported)",
                self.nodes.len(),
                MAX_NODES
            )));
        }
        Ok(())
    }

    pub fn preset(&self, id: usize) -> Result<&Preset> {
        self.presets
            .get(id)
            .ok_or_else(|| CameraError::InvalidArgument(format!("no camera preset {}", id)))
    }

    pub fn node_path(&self, node: NodeId) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.id == node)
            .map(|n| n.path.as_str())
    }

    /// Board table for the Galaxy S2: M5MO rear sensor, S5K5BAFX front sensor.
    pub fn galaxys2() -> Self {
        let some = |s: &str| Some(s.to_string());

        let m5mo = Preset {
            name: "M5MO".to_string(),
            facing: Facing::Back,
            orientation: 90,
            rotation: 0,
            hflip: false,
            vflip: false,
            picture_format: PixelFormat::Jpeg,
            focal_length: 4.03,
            horizontal_view_angle: 60.5,
            vertical_view_angle: 47.1,
            metering: Metering::Center,
            params: PresetParams {
                preview_size_values: some(
                    "1280x720,640x480,720x480,800x480,800x450,352x288,320x240,176x144",
                ),
                preview_size: some("640x480"),
                preview_format_values: some("yuv420sp,yuv420p,rgb565"),
                preview_format: some("yuv420sp"),
                preview_frame_rate_values: some("30,25,20,15,10,7"),
                preview_frame_rate: 30,
                preview_fps_range_values: some("(7000,30000)"),
                preview_fps_range: some("7000,30000"),

                picture_size_values: some(
                    "3264x2448,3264x1968,2048x1536,2048x1232,1280x960,800x480,640x480",
                ),
                picture_size: some("3264x2448"),
                picture_format_values: some("jpeg"),
                picture_format: some("jpeg"),
                jpeg_thumbnail_size_values: some("320x240,400x240,0x0"),
                jpeg_thumbnail_width: 320,
                jpeg_thumbnail_height: 240,
                jpeg_thumbnail_quality: 100,
                jpeg_quality: 90,

                recording_size: some("720x480"),
                recording_size_values: some("1920x1080,1280x720,720x480,640x480"),
                recording_format: some("yuv420sp"),

                focus_mode: some("auto"),
                focus_mode_values: some("auto,infinity,macro,fixed,facedetect,continuous-video"),
                focus_distances: some("0.15,1.20,Infinity"),
                focus_areas: some("(0,0,0,0,0)"),
                max_num_focus_areas: 1,

                zoom_supported: true,
                smooth_zoom_supported: false,
                zoom_ratios: some(
                    "100,102,104,109,111,113,119,121,124,131,134,138,146,150,155,159,165,170,\
                     182,189,200,213,222,232,243,255,283,300,319,364,400",
                ),
                zoom: 0,
                max_zoom: 30,

                flash_mode: some("off"),
                flash_mode_values: some("off,auto,on,torch"),

                exposure_compensation: 0,
                exposure_compensation_step: 0.5,
                min_exposure_compensation: -4,
                max_exposure_compensation: 4,

                whitebalance: some("auto"),
                whitebalance_values: some("auto,incandescent,fluorescent,daylight,cloudy-daylight"),

                scene_mode: some("auto"),
                scene_mode_values: some(
                    "auto,portrait,landscape,night,beach,snow,sunset,fireworks,sports,party,\
                     candlelight,dusk-dawn,fall-color,back-light,text",
                ),

                effect: some("none"),
                effect_values: some("none,mono,negative,sepia,aqua"),

                iso: some("auto"),
                iso_values: some("auto,ISO50,ISO100,ISO200,ISO400,ISO800"),
            },
        };

        let s5k5bafx = Preset {
            name: "S5K5BAFX".to_string(),
            facing: Facing::Front,
            orientation: 270,
            rotation: 0,
            hflip: false,
            vflip: false,
            picture_format: PixelFormat::Yuyv,
            focal_length: 2.73,
            horizontal_view_angle: 51.2,
            vertical_view_angle: 39.4,
            metering: Metering::Center,
            params: PresetParams {
                preview_size_values: some("640x480,352x288,320x240,176x144"),
                preview_size: some("640x480"),
                preview_format_values: some("yuv420sp,yuv420p,rgb565"),
                preview_format: some("yuv420sp"),
                preview_frame_rate_values: some("30,25,20,15,10,7"),
                preview_frame_rate: 30,
                preview_fps_range_values: some("(7000,30000)"),
                preview_fps_range: some("7000,30000"),

                picture_size_values: some("1600x1200,640x480"),
                picture_size: some("1600x1200"),
                picture_format_values: some("jpeg"),
                picture_format: some("jpeg"),
                jpeg_thumbnail_size_values: some("160x120,0x0"),
                jpeg_thumbnail_width: 160,
                jpeg_thumbnail_height: 120,
                jpeg_thumbnail_quality: 100,
                jpeg_quality: 90,

                recording_size: some("640x480"),
                recording_size_values: some("640x480"),
                recording_format: some("yuv420sp"),

                focus_mode: some("fixed"),
                focus_mode_values: some("fixed"),
                focus_distances: some("0.20,0.25,Infinity"),
                focus_areas: None,
                max_num_focus_areas: 0,

                zoom_supported: false,

                exposure_compensation: 0,
                exposure_compensation_step: 0.5,
                min_exposure_compensation: -4,
                max_exposure_compensation: 4,

                iso: some("auto"),
                iso_values: some("auto"),

                ..PresetParams::default()
            },
        };

        let nodes = (0..3)
            .map(|i| DeviceNode {
                id: NodeId(i),
                path: format!("/dev/video{}", i),
            })
            .collect();

        Self {
            presets: vec![m5mo, s5k5bafx],
            nodes,
            identity: DeviceIdentity::default(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self::galaxys2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_galaxys2_table() {
        let config = CameraConfig::galaxys2();
        assert!(config.validate().is_ok());
        assert_eq!(config.presets.len(), 2);
        assert_eq!(config.presets[0].facing, Facing::Back);
        assert_eq!(config.presets[1].picture_format, PixelFormat::Yuyv);
        assert_eq!(config.node_path(NodeId::RECORDING), Some("/dev/video2"));

        let ratios = config.presets[0].params.zoom_ratios.as_deref().unwrap();
        assert_eq!(ratios.split(',').count(), 31);
        let scenes = config.presets[0].params.scene_mode_values.as_deref().unwrap();
        assert_eq!(scenes.split(',').count(), 15);
    }

    #[test]
    fn test_json_round_trip() {
        let config = CameraConfig::galaxys2();
        let text = serde_json::to_string(&config).unwrap();
        let loaded = CameraConfig::from_json_str(&text).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_rejects_too_many_presets() {
        let mut config = CameraConfig::galaxys2();
        config.presets.push(config.presets[0].clone());
        assert!(matches!(config.validate(), Err(CameraError::InvalidArgument(_))));
        assert!(config.preset(7).is_err());
    }
}
