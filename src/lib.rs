//! exynos_camera - V4L2 camera pipeline controller for Exynos FIMC sensors
//!
//! Drives the preview (FIMC1) and recording (FIMC2) capture nodes of the
//! Galaxy S2 camera stack: parameter negotiation, preview streaming, video
//! recording with metadata buffers, autofocus, and still capture with EXIF
//! packaging. All hardware access goes through the `DeviceGateway` seam;
//! `VirtualDevice` is an in-process implementation used by the CLI and tests.

pub mod autofocus;
pub mod callbacks;
pub mod camera;
pub mod encoder;
pub mod error;
pub mod exif_writer;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod params;
pub mod picture;
pub mod preset;
pub mod preview;
pub mod settings;
pub mod v4l2;
pub mod virtual_device;
pub mod worker;

pub use autofocus::FocusOutcome;
pub use callbacks::{CameraAddrs, Callbacks, MessageType, PreviewWindow, WindowBuffer};
pub use camera::{camera_info, number_of_cameras, CameraInfo, CameraOptions, ExynosCamera};
pub use encoder::{ImageJpegCodec, JpegCodec};
pub use error::{CameraError, Result};
pub use memory::{HeapAllocator, MemoryAllocator, MemoryBlock};
pub use metadata::{read_summary, summarize_jpeg, ExifSummary};
pub use metrics::MetricsSnapshot;
pub use params::ParamStore;
pub use preset::{CameraConfig, DeviceIdentity, Facing, Preset};
pub use v4l2::{DeviceGateway, NodeId, PixelFormat};
pub use virtual_device::VirtualDevice;
