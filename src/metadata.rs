//! EXIF read-back
//!
//! Parses a captured JPEG with kamadak-exif and summarizes the fields the
//! capture path writes. Used by the `inspect` command and by tests to prove
//! the generated container is readable by a third-party parser.
//!
//! ## Example
//!
//! ```rust,ignore
//! use exynos_camera::metadata::read_summary;
//!
//! let summary = read_summary(Path::new("capture.jpg"))?;
//! println!("{} {}", summary.make.unwrap_or_default(), summary.model.unwrap_or_default());
//! ```

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Cursor, Seek};
use std::path::Path;
use tracing::debug;

use crate::error::{CameraError, Result};

// ============================================================================
// Summary Types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifSummary {
    pub make: Option<String>,
    pub model: Option<String>,
    pub software: Option<String>,

    /// `YYYY:MM:DD HH:MM:SS`
    pub date_time: Option<String>,

    /// EXIF orientation (1-8)
    pub orientation: Option<u16>,

    /// Pixel dimensions from the EXIF IFD
    pub dimensions: Option<Dimensions>,

    pub exposure: ExposureInfo,

    /// Focal length in millimetres
    pub focal_length: Option<f64>,

    pub gps: Option<GpsCoordinates>,

    pub thumbnail: Option<ThumbnailInfo>,

    /// Number of fields across all directories
    pub field_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureInfo {
    pub iso: Option<u32>,
    pub fnumber: Option<f64>,
    /// Seconds
    pub exposure_time: Option<f64>,
    pub exposure_bias: Option<f64>,
    pub metering_mode: Option<u32>,
    pub flash: Option<u32>,
    pub white_balance: Option<u32>,
    pub scene_capture_type: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinates {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub date_stamp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Offset from the TIFF header
    pub offset: u32,
    pub length: u32,
}

// ============================================================================
// Readers
// ============================================================================

/// Summarizes the EXIF block of the JPEG at `path`.
pub fn read_summary(path: &Path) -> Result<ExifSummary> {
    let file = std::fs::File::open(path)?;
    read_from(&mut BufReader::new(file))
}

/// Summarizes the EXIF block of an in-memory JPEG.
pub fn summarize_jpeg(bytes: &[u8]) -> Result<ExifSummary> {
    read_from(&mut Cursor::new(bytes))
}

fn read_from<R: BufRead + Seek>(reader: &mut R) -> Result<ExifSummary> {
    let exif_data = exif::Reader::new()
        .read_from_container(reader)
        .map_err(|e| CameraError::Malformed(format!("EXIF parse error: {}", e)))?;
    debug!("parsed {} EXIF fields", exif_data.fields().count());

    let get_str = |tag: exif::Tag| -> Option<String> {
        exif_data.get_field(tag, exif::In::PRIMARY).and_then(|f| match f.value {
            exif::Value::Ascii(ref v) if !v.is_empty() => {
                Some(String::from_utf8_lossy(&v[0]).trim_end_matches('\0').to_string())
            }
            _ => None,
        })
    };

    let get_rational = |tag: exif::Tag| -> Option<f64> {
        exif_data.get_field(tag, exif::In::PRIMARY).and_then(|f| match f.value {
            exif::Value::Rational(ref v) if !v.is_empty() => Some(v[0].to_f64()),
            exif::Value::SRational(ref v) if !v.is_empty() => Some(v[0].to_f64()),
            _ => None,
        })
    };

    let get_u32 = |tag: exif::Tag, ifd: exif::In| -> Option<u32> {
        exif_data.get_field(tag, ifd).and_then(|f| f.value.get_uint(0))
    };

    let dimensions = match (
        get_u32(exif::Tag::PixelXDimension, exif::In::PRIMARY),
        get_u32(exif::Tag::PixelYDimension, exif::In::PRIMARY),
    ) {
        (Some(width), Some(height)) => Some(Dimensions { width, height }),
        _ => None,
    };

    let exposure = ExposureInfo {
        iso: get_u32(exif::Tag::PhotographicSensitivity, exif::In::PRIMARY),
        fnumber: get_rational(exif::Tag::FNumber),
        exposure_time: get_rational(exif::Tag::ExposureTime),
        exposure_bias: get_rational(exif::Tag::ExposureBiasValue),
        metering_mode: get_u32(exif::Tag::MeteringMode, exif::In::PRIMARY),
        flash: get_u32(exif::Tag::Flash, exif::In::PRIMARY),
        white_balance: get_u32(exif::Tag::WhiteBalance, exif::In::PRIMARY),
        scene_capture_type: get_u32(exif::Tag::SceneCaptureType, exif::In::PRIMARY),
    };

    let thumbnail = match (
        get_u32(exif::Tag::JPEGInterchangeFormat, exif::In::THUMBNAIL),
        get_u32(exif::Tag::JPEGInterchangeFormatLength, exif::In::THUMBNAIL),
    ) {
        (Some(offset), Some(length)) => Some(ThumbnailInfo {
            width: get_u32(exif::Tag::ImageWidth, exif::In::THUMBNAIL),
            height: get_u32(exif::Tag::ImageLength, exif::In::THUMBNAIL),
            offset,
            length,
        }),
        _ => None,
    };

    Ok(ExifSummary {
        make: get_str(exif::Tag::Make),
        model: get_str(exif::Tag::Model),
        software: get_str(exif::Tag::Software),
        date_time: get_str(exif::Tag::DateTime),
        orientation: get_u32(exif::Tag::Orientation, exif::In::PRIMARY).map(|v| v as u16),
        dimensions,
        exposure,
        focal_length: get_rational(exif::Tag::FocalLength),
        gps: parse_exif_gps(&exif_data, &get_str),
        thumbnail,
        field_count: exif_data.fields().count(),
    })
}

/// Parse GPS from EXIF fields
fn parse_exif_gps(
    exif_data: &exif::Exif,
    get_str: &dyn Fn(exif::Tag) -> Option<String>,
) -> Option<GpsCoordinates> {
    let lat = exif_data.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY)?;
    let lon = exif_data.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY)?;

    let parse_dms = |field: &exif::Field| -> Option<f64> {
        match &field.value {
            exif::Value::Rational(v) if v.len() >= 3 => {
                Some(v[0].to_f64() + v[1].to_f64() / 60.0 + v[2].to_f64() / 3600.0)
            }
            _ => None,
        }
    };

    let mut latitude = parse_dms(lat)?;
    let mut longitude = parse_dms(lon)?;

    // Apply hemisphere
    if get_str(exif::Tag::GPSLatitudeRef).is_some_and(|r| r.contains('S')) {
        latitude = -latitude;
    }
    if get_str(exif::Tag::GPSLongitudeRef).is_some_and(|r| r.contains('W')) {
        longitude = -longitude;
    }

    let below_sea_level = exif_data
        .get_field(exif::Tag::GPSAltitudeRef, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
        == Some(1);
    let altitude = exif_data
        .get_field(exif::Tag::GPSAltitude, exif::In::PRIMARY)
        .and_then(|f| match &f.value {
            exif::Value::Rational(v) if !v.is_empty() => Some(v[0].to_f64()),
            _ => None,
        })
        .map(|alt| if below_sea_level { -alt } else { alt });

    Some(GpsCoordinates {
        latitude,
        longitude,
        altitude,
        date_stamp: get_str(exif::Tag::GPSDateStamp),
    })
}

// ============================================================================
// Helper Methods on ExifSummary
// ============================================================================

impl ExifSummary {
    /// Human-readable exposure summary, e.g. `f/2.6 1/64s ISO100 4.03mm`
    pub fn exposure_summary(&self) -> String {
        let exp = &self.exposure;

        let shutter = exp
            .exposure_time
            .map(|s| {
                if s >= 1.0 {
                    format!("{:.1}s", s)
                } else if s > 0.0 {
                    format!("1/{:.0}s", 1.0 / s)
                } else {
                    "?".to_string()
                }
            })
            .unwrap_or_else(|| "?".to_string());

        format!(
            "f/{:.1} {} ISO{} {}mm",
            exp.fnumber.unwrap_or(0.0),
            shutter,
            exp.iso.unwrap_or(0),
            self.focal_length.unwrap_or(0.0)
        )
    }

    /// Aspect ratio as a string (e.g., "4:3")
    pub fn aspect_ratio(&self) -> Option<String> {
        let d = self.dimensions.as_ref()?;
        let g = gcd(d.width, d.height);
        if g == 0 {
            return None;
        }
        Some(format!("{}:{}", d.width / g, d.height / g))
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

// ============================================================================
// Tests
// ============================================================================
