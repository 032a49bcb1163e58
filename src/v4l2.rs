//! V4L2 vocabulary shared by the controller and its device gateway
//!
//! Pixel formats, Samsung FIMC private control ids, the enumerations the
//! sensor drivers expect in those controls, and the [`DeviceGateway`] seam
//! through which every ioctl-level operation is issued.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

// ============================================================================
// Pixel formats
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Nv21,
    Nv12,
    Nv12t,
    Yuv420,
    Yuyv,
    Uyvy,
    Yuv422p,
    Rgb565,
    Rgb32,
    Jpeg,
}

impl PixelFormat {
    pub fn fourcc(self) -> u32 {
        match self {
            PixelFormat::Nv21 => fourcc(b'N', b'V', b'2', b'1'),
            PixelFormat::Nv12 => fourcc(b'N', b'V', b'1', b'2'),
            PixelFormat::Nv12t => fourcc(b'T', b'M', b'1', b'2'),
            PixelFormat::Yuv420 => fourcc(b'Y', b'U', b'1', b'2'),
            PixelFormat::Yuyv => fourcc(b'Y', b'U', b'Y', b'V'),
            PixelFormat::Uyvy => fourcc(b'U', b'Y', b'V', b'Y'),
            PixelFormat::Yuv422p => fourcc(b'4', b'2', b'2', b'P'),
            PixelFormat::Rgb565 => fourcc(b'R', b'G', b'B', b'P'),
            PixelFormat::Rgb32 => fourcc(b'R', b'G', b'B', b'4'),
            PixelFormat::Jpeg => fourcc(b'J', b'P', b'E', b'G'),
        }
    }

    pub fn from_fourcc(value: u32) -> Option<Self> {
        [
            PixelFormat::Nv21,
            PixelFormat::Nv12,
            PixelFormat::Nv12t,
            PixelFormat::Yuv420,
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
            PixelFormat::Yuv422p,
            PixelFormat::Rgb565,
            PixelFormat::Rgb32,
            PixelFormat::Jpeg,
        ]
        .into_iter()
        .find(|f| f.fourcc() == value)
    }

    /// Bytes per pixel as a (numerator, denominator) pair.
    pub fn bytes_per_pixel(self) -> (usize, usize) {
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 | PixelFormat::Nv12t | PixelFormat::Yuv420 => {
                (3, 2)
            }
            PixelFormat::Yuyv
            | PixelFormat::Uyvy
            | PixelFormat::Yuv422p
            | PixelFormat::Rgb565
            | PixelFormat::Jpeg => (2, 1),
            PixelFormat::Rgb32 => (4, 1),
        }
    }

    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let (num, den) = self.bytes_per_pixel();
        width as usize * height as usize * num / den
    }

    /// Gralloc HAL pixel format used for the display surface.
    pub fn hal_format(self) -> u32 {
        match self {
            PixelFormat::Yuv420 => hal::PIXEL_FORMAT_YV12,
            PixelFormat::Rgb565 => hal::PIXEL_FORMAT_RGB_565,
            PixelFormat::Rgb32 => hal::PIXEL_FORMAT_RGBX_8888,
            _ => hal::PIXEL_FORMAT_YCRCB_420_SP,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.fourcc().to_le_bytes();
        write!(f, "{}", String::from_utf8_lossy(&code))
    }
}

/// Display-surface constants (Android gralloc values).
pub mod hal {
    pub const PIXEL_FORMAT_RGBX_8888: u32 = 2;
    pub const PIXEL_FORMAT_RGB_565: u32 = 4;
    pub const PIXEL_FORMAT_YCRCB_420_SP: u32 = 0x11;
    pub const PIXEL_FORMAT_YV12: u32 = 0x3231_5659;

    pub const USAGE_SW_WRITE_OFTEN: u32 = 0x30;
}

// ============================================================================
// Controls
// ============================================================================

/// Control ids understood by the FIMC capture nodes.
pub mod cid {
    const PRIVATE_BASE: u32 = 0x0800_0000;

    pub const HFLIP: u32 = 0x0098_0914;
    pub const VFLIP: u32 = 0x0098_0915;
    pub const ROTATION: u32 = 0x0098_0922;

    pub const PADDR_Y: u32 = PRIVATE_BASE + 1;
    pub const PADDR_CBCR: u32 = PRIVATE_BASE + 4;
    pub const CACHEABLE: u32 = PRIVATE_BASE + 8;

    pub const CAM_JPEG_MAIN_SIZE: u32 = PRIVATE_BASE + 32;
    pub const CAM_JPEG_MAIN_OFFSET: u32 = PRIVATE_BASE + 33;
    pub const CAM_JPEG_THUMB_SIZE: u32 = PRIVATE_BASE + 34;
    pub const CAM_JPEG_THUMB_OFFSET: u32 = PRIVATE_BASE + 35;
    pub const CAM_JPEG_QUALITY: u32 = PRIVATE_BASE + 37;
    pub const CAM_SENSOR_FW_VER: u32 = PRIVATE_BASE + 48;

    pub const CAMERA_EXIF_FLASH: u32 = PRIVATE_BASE + 52;
    pub const CAMERA_EXIF_ISO: u32 = PRIVATE_BASE + 53;
    pub const CAMERA_EXIF_TV: u32 = PRIVATE_BASE + 54;
    pub const CAMERA_EXIF_BV: u32 = PRIVATE_BASE + 55;
    pub const CAMERA_EXIF_EBV: u32 = PRIVATE_BASE + 56;

    pub const CAMERA_SCENE_MODE: u32 = PRIVATE_BASE + 70;
    pub const CAMERA_FLASH_MODE: u32 = PRIVATE_BASE + 71;
    pub const CAMERA_BRIGHTNESS: u32 = PRIVATE_BASE + 72;
    pub const CAMERA_WHITE_BALANCE: u32 = PRIVATE_BASE + 73;
    pub const CAMERA_EFFECT: u32 = PRIVATE_BASE + 74;
    pub const CAMERA_ISO: u32 = PRIVATE_BASE + 75;
    pub const CAMERA_FOCUS_MODE: u32 = PRIVATE_BASE + 82;
    pub const CAMERA_OBJECT_POSITION_X: u32 = PRIVATE_BASE + 83;
    pub const CAMERA_OBJECT_POSITION_Y: u32 = PRIVATE_BASE + 84;
    pub const CAMERA_SET_AUTO_FOCUS: u32 = PRIVATE_BASE + 85;
    pub const CAMERA_AUTO_FOCUS_RESULT: u32 = PRIVATE_BASE + 86;
    pub const CAMERA_ZOOM: u32 = PRIVATE_BASE + 90;
    pub const CAMERA_CAPTURE: u32 = PRIVATE_BASE + 97;
    pub const CAMERA_SENSOR_MODE: u32 = PRIVATE_BASE + 110;
    pub const CAMERA_SENSOR_OUTPUT_SIZE: u32 = PRIVATE_BASE + 111;
}

/// Value written to the PADDR controls on failure.
pub const INVALID_PHYS_ADDR: u32 = 0xffff_ffff;

/// Neutral point of the driver's 0..8 exposure scale.
pub const EV_DEFAULT: i32 = 4;

pub const AUTO_FOCUS_OFF: i32 = 0;
pub const AUTO_FOCUS_ON: i32 = 1;

/// Status values reported through `CAMERA_AUTO_FOCUS_RESULT`.
pub mod af_status {
    pub const FAIL: i32 = 0;
    pub const IN_PROGRESS: i32 = 1;
    pub const SUCCESS: i32 = 2;
    pub const FIRST_SUCCESS: i32 = 4;
}

macro_rules! driver_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr => [$($key:literal),*]),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            /// Maps a parameter-store keyword to the driver value.
            pub fn from_param(value: &str) -> Option<Self> {
                match value {
                    $($($key)|* => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

driver_enum!(FocusMode {
    Auto = 0 => ["auto"],
    Macro = 1 => ["macro"],
    FaceDetect = 2 => ["facedetect"],
    Infinity = 6 => ["infinity"],
    Fixed = 7 => ["fixed"],
    Continuous = 8 => ["continuous-video", "continuous-picture"],
});

driver_enum!(FlashMode {
    Off = 1 => ["off"],
    Auto = 2 => ["auto"],
    On = 3 => ["on"],
    Torch = 4 => ["torch"],
});

driver_enum!(WhiteBalance {
    Auto = 1 => ["auto"],
    Sunny = 2 => ["daylight"],
    Cloudy = 3 => ["cloudy-daylight"],
    Tungsten = 4 => ["incandescent"],
    Fluorescent = 5 => ["fluorescent"],
});

driver_enum!(SceneMode {
    None = 1 => ["auto"],
    Portrait = 2 => ["portrait"],
    Nightshot = 3 => ["night"],
    BackLight = 4 => ["back-light"],
    Landscape = 5 => ["landscape"],
    Sports = 6 => ["sports"],
    PartyIndoor = 7 => ["party"],
    BeachSnow = 8 => ["beach", "snow"],
    Sunset = 9 => ["sunset"],
    DuskDawn = 10 => ["dusk-dawn"],
    FallColor = 11 => ["fall-color"],
    Fireworks = 12 => ["fireworks"],
    Text = 13 => ["text"],
    CandleLight = 14 => ["candlelight"],
});

driver_enum!(Effect {
    None = 1 => ["none"],
    Mono = 2 => ["mono"],
    Sepia = 3 => ["sepia"],
    Aqua = 4 => ["aqua"],
    Negative = 6 => ["negative"],
});

driver_enum!(IsoMode {
    Auto = 0 => ["auto"],
    Iso50 = 1 => ["ISO50"],
    Iso100 = 2 => ["ISO100"],
    Iso200 = 3 => ["ISO200"],
    Iso400 = 4 => ["ISO400"],
    Iso800 = 5 => ["ISO800"],
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorMode {
    Camera = 0,
    Movie = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metering {
    Matrix = 1,
    Center = 2,
    Spot = 3,
}

// ============================================================================
// Device gateway
// ============================================================================

/// Index into the configuration's device-node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl NodeId {
    /// FIMC1: preview and still capture.
    pub const PREVIEW: NodeId = NodeId(0);
    /// FIMC2: recording.
    pub const RECORDING: NodeId = NodeId(2);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    Preview = 0,
    Capture = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Ready,
    Timeout,
}

/// ioctl-level access to the capture nodes.
///
/// Implementations own their file descriptors and synchronize internally;
/// every method takes `&self` so the preview, picture and autofocus workers
/// can share one gateway.
pub trait DeviceGateway: Send + Sync {
    fn open(&self, node: NodeId, path: &str) -> Result<()>;
    fn close(&self, node: NodeId);
    fn fd(&self, node: NodeId) -> Option<i32>;

    fn query_capabilities(&self, node: NodeId) -> Result<()>;
    fn enum_input(&self, node: NodeId, input: u32) -> Result<()>;
    fn set_input(&self, node: NodeId, input: u32) -> Result<()>;

    fn enum_format(&self, node: NodeId, format: PixelFormat) -> Result<()>;
    fn set_format(
        &self,
        node: NodeId,
        width: u32,
        height: u32,
        format: PixelFormat,
        mode: FormatMode,
    ) -> Result<()>;

    /// Returns the number of buffers the driver actually allocated.
    fn request_buffers(&self, node: NodeId, count: u32) -> Result<u32>;
    /// Returns the buffer length in bytes.
    fn query_buffer(&self, node: NodeId, index: u32) -> Result<usize>;
    fn queue_buffer(&self, node: NodeId, index: u32) -> Result<()>;
    fn dequeue_buffer(&self, node: NodeId) -> Result<u32>;

    fn stream_on(&self, node: NodeId) -> Result<()>;
    fn stream_off(&self, node: NodeId) -> Result<()>;
    fn poll(&self, node: NodeId) -> Result<PollStatus>;

    fn get_control(&self, node: NodeId, id: u32) -> Result<i32>;
    /// Some private controls (physical address lookups) answer through the
    /// returned value.
    fn set_control(&self, node: NodeId, id: u32, value: i32) -> Result<i32>;
    fn get_ext_control_string(&self, node: NodeId, id: u32) -> Result<String>;
    fn set_stream_parameters(&self, node: NodeId, fps: u32) -> Result<()>;
}
