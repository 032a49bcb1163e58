//! JPEG encoding for sensors that deliver raw frames on still capture
//!
//! The controller talks to a [`JpegCodec`] the way it would talk to the
//! hardware block: open a session, fill its input buffer, execute, read the
//! output, release (drop). [`ImageJpegCodec`] is a software backend built on
//! the `image` crate; it owns the colour conversion and scaling a hardware
//! codec would do.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ExtendedColorType, RgbImage};
use tracing::debug;

use crate::error::{CameraError, Result};
use crate::v4l2::PixelFormat;

// ============================================================================
// Job description
// ============================================================================

/// Discrete codec quality tiers, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QualityLevel {
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
    Level4 = 4,
}

impl QualityLevel {
    /// Maps a 0..=100 quality setting onto a tier.
    pub fn from_quality(quality: i32) -> Self {
        match quality {
            q if q >= 90 => QualityLevel::Level1,
            q if q >= 80 => QualityLevel::Level2,
            q if q >= 70 => QualityLevel::Level3,
            _ => QualityLevel::Level4,
        }
    }

    /// Quality handed to the software encoder for this tier.
    pub fn encoder_quality(self) -> u8 {
        match self {
            QualityLevel::Level1 => 95,
            QualityLevel::Level2 => 85,
            QualityLevel::Level3 => 75,
            QualityLevel::Level4 => 65,
        }
    }
}

/// Pixel layout of the encoder input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Rgb565,
    /// 4:2:0 semi-planar, Cb first.
    Nv12,
    /// 4:2:0 semi-planar, Cr first.
    Nv21,
    /// 4:2:0 planar.
    Yuv420,
    /// 4:2:2 packed, Y0 Cb Y1 Cr.
    Yuyv,
    /// 4:2:2 packed, Cb Y0 Cr Y1.
    Uyvy,
}

impl InputFormat {
    pub fn from_pixel_format(format: PixelFormat) -> Option<Self> {
        match format {
            PixelFormat::Rgb565 => Some(InputFormat::Rgb565),
            PixelFormat::Nv12 | PixelFormat::Nv12t => Some(InputFormat::Nv12),
            PixelFormat::Nv21 => Some(InputFormat::Nv21),
            PixelFormat::Yuv420 => Some(InputFormat::Yuv420),
            PixelFormat::Yuyv | PixelFormat::Yuv422p => Some(InputFormat::Yuyv),
            PixelFormat::Uyvy => Some(InputFormat::Uyvy),
            PixelFormat::Rgb32 | PixelFormat::Jpeg => None,
        }
    }

    pub fn is_yuv420(self) -> bool {
        matches!(self, InputFormat::Nv12 | InputFormat::Nv21 | InputFormat::Yuv420)
    }

    /// Bytes the codec reads for a `width` x `height` frame.
    pub fn input_size(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        if self.is_yuv420() {
            pixels * 3 / 2
        } else {
            pixels * 2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsampling {
    Yuv420,
    Yuv422,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    pub source_width: u32,
    pub source_height: u32,
    /// Output dimensions.
    pub width: u32,
    pub height: u32,
    pub input: InputFormat,
    pub subsampling: Subsampling,
    pub quality: QualityLevel,
}

impl EncodeParams {
    pub fn new(
        input: InputFormat,
        source: (u32, u32),
        output: (u32, u32),
        quality: i32,
    ) -> Self {
        Self {
            source_width: source.0,
            source_height: source.1,
            width: output.0,
            height: output.1,
            input,
            subsampling: if input.is_yuv420() {
                Subsampling::Yuv420
            } else {
                Subsampling::Yuv422
            },
            quality: QualityLevel::from_quality(quality),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input.input_size(self.source_width, self.source_height)
    }
}

// ============================================================================
// Codec seam
// ============================================================================

pub trait JpegCodec: Send + Sync {
    fn open(&self) -> Result<Box<dyn JpegSession>>;
}

/// One encode job. Dropping the session releases its buffers.
pub trait JpegSession {
    fn set_params(&mut self, params: EncodeParams) -> Result<()>;
    fn input_buffer(&mut self, size: usize) -> Result<&mut [u8]>;
    /// Returns the compressed size.
    fn execute(&mut self) -> Result<usize>;
    fn output(&self) -> Result<&[u8]>;
}

/// Runs a full encode job over `pixels`.
pub fn encode(codec: &dyn JpegCodec, params: EncodeParams, pixels: &[u8]) -> Result<Vec<u8>> {
    let size = params.input_size();
    if pixels.len() < size {
        return Err(CameraError::Encoder(format!(
            "input holds {} bytes, {}x{} {:?} needs {}",
            pixels.len(),
            params.source_width,
            params.source_height,
            params.input,
            size
        )));
    }

    let mut session = codec.open()?;
    session.set_params(params)?;
    session.input_buffer(size)?.copy_from_slice(&pixels[..size]);
    let len = session.execute()?;
    let output = session.output()?;
    output
        .get(..len)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| CameraError::Encoder(format!("codec reported {} bytes, produced {}", len, output.len())))
}

// ============================================================================
// Software backend
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageJpegCodec;

impl JpegCodec for ImageJpegCodec {
    fn open(&self) -> Result<Box<dyn JpegSession>> {
        Ok(Box::new(ImageJpegSession::default()))
    }
}

#[derive(Default)]
struct ImageJpegSession {
    params: Option<EncodeParams>,
    input: Vec<u8>,
    output: Vec<u8>,
}

impl JpegSession for ImageJpegSession {
    fn set_params(&mut self, params: EncodeParams) -> Result<()> {
        if params.source_width == 0 || params.source_height == 0 || params.width == 0 || params.height == 0 {
            return Err(CameraError::Encoder("zero-sized encode".into()));
        }
        self.params = Some(params);
        Ok(())
    }

    fn input_buffer(&mut self, size: usize) -> Result<&mut [u8]> {
        self.input.resize(size, 0);
        Ok(&mut self.input)
    }

    fn execute(&mut self) -> Result<usize> {
        let params = self
            .params
            .ok_or_else(|| CameraError::Encoder("execute before set_params".into()))?;

        let mut rgb = to_rgb(&self.input, params.input, params.source_width, params.source_height)?;
        if (params.width, params.height) != (params.source_width, params.source_height) {
            rgb = imageops::resize(&rgb, params.width, params.height, FilterType::Triangle);
        }

        self.output.clear();
        let mut encoder = JpegEncoder::new_with_quality(&mut self.output, params.quality.encoder_quality());
        encoder
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
            .map_err(|e| CameraError::Encoder(e.to_string()))?;

        debug!(
            "encoded {}x{} -> {}x{} ({:?}) into {} bytes",
            params.source_width,
            params.source_height,
            params.width,
            params.height,
            params.quality,
            self.output.len()
        );
        Ok(self.output.len())
    }

    fn output(&self) -> Result<&[u8]> {
        if self.output.is_empty() {
            return Err(CameraError::Encoder("no output".into()));
        }
        Ok(&self.output)
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y);
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;
    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp(c + ((359 * e) >> 8)),
        clamp(c - ((88 * d + 183 * e) >> 8)),
        clamp(c + ((454 * d) >> 8)),
    ]
}

fn to_rgb(data: &[u8], input: InputFormat, width: u32, height: u32) -> Result<RgbImage> {
    let (w, h) = (width as usize, height as usize);
    if data.len() < input.input_size(width, height) {
        return Err(CameraError::Encoder("short input buffer".into()));
    }
    let at = |i: usize| data.get(i).copied().unwrap_or(128);
    let plane = w * h;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    let img = RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        let rgb = match input {
            InputFormat::Rgb565 => {
                let i = (y * w + x) * 2;
                let v = u16::from_le_bytes([at(i), at(i + 1)]);
                [
                    ((v >> 11) as u8 & 0x1f) << 3,
                    ((v >> 5) as u8 & 0x3f) << 2,
                    (v as u8 & 0x1f) << 3,
                ]
            }
            InputFormat::Nv12 | InputFormat::Nv21 => {
                let c = plane + (y / 2) * cw * 2 + (x / 2) * 2;
                let (u, v) = if input == InputFormat::Nv12 {
                    (at(c), at(c + 1))
                } else {
                    (at(c + 1), at(c))
                };
                yuv_to_rgb(at(y * w + x), u, v)
            }
            InputFormat::Yuv420 => {
                let c = (y / 2) * cw + x / 2;
                yuv_to_rgb(at(y * w + x), at(plane + c), at(plane + cw * ch + c))
            }
            InputFormat::Yuyv | InputFormat::Uyvy => {
                let pair = (y * w + (x & !1)) * 2;
                let (y0, u, y1, v) = if input == InputFormat::Yuyv {
                    (at(pair), at(pair + 1), at(pair + 2), at(pair + 3))
                } else {
                    (at(pair + 1), at(pair), at(pair + 3), at(pair + 2))
                };
                yuv_to_rgb(if x % 2 == 0 { y0 } else { y1 }, u, v)
            }
        };
        image::Rgb(rgb)
    });
    Ok(img)
}
