//! EXIF assembly for captured stills
//!
//! ## Sections
//! - Attributes: the per-capture attribute set and how it is gathered
//! - TIFF writer: typed IFD entries serialized through a cursor
//! - APP1 block: IFD0, EXIF, GPS and thumbnail directories
//! - Container: splicing the APP1 segment into the main JPEG
//!
//! ## Layout
//!
//! ```text
//! FF E1 <len:u16 BE> "Exif\0\0"
//! "II" 2A 00 <8:u32>               TIFF header, offsets relative to "II"
//! IFD0   dir + values              -> EXIF pointer, GPS pointer, next = IFD1
//! EXIF   dir + values
//! GPS    dir + values              (optional)
//! IFD1   dir + values + thumbnail  (optional)
//! ```
//!
//! Each directory is followed by the values too large to fit in an entry,
//! appended in entry order and padded to an even offset.

use chrono::{DateTime, Local, Timelike, Utc};
use tracing::{debug, warn};

use crate::error::{CameraError, Result};
use crate::params::ParamStore;
use crate::preset::DeviceIdentity;
use crate::settings::SessionSettings;
use crate::v4l2::{cid, DeviceGateway, Metering, NodeId, SceneMode, WhiteBalance, EV_DEFAULT};

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG APP1 marker.
pub const APP1: [u8; 2] = [0xFF, 0xE1];

const EXIF_HEADER: &[u8; 6] = b"Exif\0\0";
const ASCII_PREFIX: &[u8; 8] = b"ASCII\0\0\0";
const TIFF_HEADER_LEN: u32 = 8;
/// Marker, length field and "Exif\0\0".
const APP1_FRAMING: usize = 10;

const MAX_PROCESSING_METHOD: usize = 100;
const APEX_DEN: i32 = 10;

// ============================================================================
// Attributes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SRational {
    pub num: i32,
    pub den: i32,
}

impl SRational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpsAttributes {
    pub latitude_ref: &'static str,
    pub latitude: [Rational; 3],
    pub longitude_ref: &'static str,
    pub longitude: [Rational; 3],
    /// 0 above sea level, 1 below.
    pub altitude_ref: u8,
    pub altitude: Rational,
    pub timestamp: [Rational; 3],
    /// `YYYY:MM:DD`, UTC.
    pub datestamp: String,
    pub processing_method: Option<String>,
}

/// Everything written into one EXIF block.
#[derive(Debug, Clone, PartialEq)]
pub struct ExifAttributes {
    pub width: u32,
    pub height: u32,
    pub make: String,
    pub model: String,
    pub software: String,
    pub orientation: u16,
    /// `YYYY:MM:DD HH:MM:SS`
    pub date_time: String,
    pub ycbcr_positioning: u16,

    pub exposure_time: Rational,
    pub fnumber: Rational,
    pub exposure_program: u16,
    pub iso_speed: u16,
    pub exif_version: [u8; 4],
    pub shutter_speed: SRational,
    pub aperture: Rational,
    pub brightness: SRational,
    pub exposure_bias: SRational,
    pub max_aperture: Rational,
    pub metering_mode: u16,
    pub flash: u16,
    pub focal_length: Rational,
    pub user_comment: String,
    pub color_space: u16,
    pub exposure_mode: u16,
    pub white_balance: u16,
    pub scene_capture_type: u16,

    pub gps: Option<GpsAttributes>,

    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub compression: u16,
    pub x_resolution: Rational,
    pub y_resolution: Rational,
    pub resolution_unit: u16,
}

/// APEX aperture value of an f-number, in tenths.
fn apex_aperture(fnumber: f64) -> i32 {
    (2.0 * fnumber.log2() * f64::from(APEX_DEN)).round() as i32
}

/// APEX time value of an exposure in seconds, in tenths.
fn apex_shutter(exposure: f64) -> i32 {
    (-exposure.log2() * f64::from(APEX_DEN)).round() as i32
}

/// APEX speed value of an ISO rating, in tenths.
fn apex_speed(iso: f64) -> i32 {
    ((iso / 3.125).log2() * f64::from(APEX_DEN)).round() as i32
}

/// Exposure time denominator for a time value in hundredths.
fn shutter_to_exposure_den(tv_hundredths: i32) -> u32 {
    2f64.powf(f64::from(tv_hundredths) / 100.0).round().max(1.0) as u32
}

impl ExifAttributes {
    /// Static attributes that do not depend on the capture.
    pub fn with_defaults(identity: &DeviceIdentity) -> Self {
        let fnumber = Rational::new(26, 10);
        let av = apex_aperture(26.0 / 10.0) as u32;
        Self {
            width: 0,
            height: 0,
            make: identity.make.clone(),
            model: identity.model.clone(),
            software: identity.software.clone(),
            orientation: 1,
            date_time: String::new(),
            ycbcr_positioning: 1,

            exposure_time: Rational::new(1, 1),
            fnumber,
            exposure_program: 2,
            iso_speed: 100,
            exif_version: *b"0220",
            shutter_speed: SRational::new(0, 100),
            aperture: Rational::new(av, APEX_DEN as u32),
            brightness: SRational::new(0, APEX_DEN),
            exposure_bias: SRational::new(0, APEX_DEN),
            max_aperture: Rational::new(av, APEX_DEN as u32),
            metering_mode: 2,
            flash: 0,
            focal_length: Rational::new(0, 100),
            user_comment: "User comments".to_string(),
            color_space: 1,
            exposure_mode: 0,
            white_balance: 0,
            scene_capture_type: 0,

            gps: None,

            thumbnail_width: 0,
            thumbnail_height: 0,
            compression: 6,
            x_resolution: Rational::new(72, 1),
            y_resolution: Rational::new(72, 1),
            resolution_unit: 2,
        }
    }

    /// Gathers the per-capture attributes from the session, the parameter
    /// store and the sensor's EXIF controls.
    pub fn gather(
        identity: &DeviceIdentity,
        settings: &SessionSettings,
        store: &ParamStore,
        gateway: &dyn DeviceGateway,
        now: DateTime<Local>,
    ) -> Self {
        let mut attrs = Self::with_defaults(identity);

        attrs.width = settings.picture_width;
        attrs.height = settings.picture_height;
        attrs.thumbnail_width = settings.thumbnail_width;
        attrs.thumbnail_height = settings.thumbnail_height;

        attrs.orientation = match store.get_int("rotation") {
            Some(90) => 6,
            Some(180) => 3,
            Some(270) => 8,
            _ => 1,
        };

        attrs.date_time = now.format("%Y:%m:%d %H:%M:%S").to_string();
        attrs.focal_length = Rational::new(settings.focal_length.max(0) as u32, 100);

        let read = |id: u32| match gateway.get_control(NodeId::PREVIEW, id) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("EXIF control {:#x} unavailable: {}", id, e);
                None
            }
        };

        let tv = read(cid::CAMERA_EXIF_TV).unwrap_or(100);
        attrs.shutter_speed = SRational::new(tv, 100);
        attrs.exposure_time = Rational::new(1, shutter_to_exposure_den(tv));

        attrs.iso_speed = read(cid::CAMERA_EXIF_ISO)
            .filter(|&iso| iso > 0)
            .map_or(100, |iso| iso.min(i32::from(u16::MAX)) as u16);
        attrs.flash = read(cid::CAMERA_EXIF_FLASH).map_or(0, |f| f.clamp(0, 0xffff) as u16);

        let (bv, ev) = match (read(cid::CAMERA_EXIF_BV), read(cid::CAMERA_EXIF_EBV)) {
            (Some(bv), Some(ev)) => (bv, ev),
            _ => {
                let exposure = store
                    .get_int("exposure-compensation")
                    .filter(|&e| e >= 0)
                    .unwrap_or(EV_DEFAULT);
                let av = apex_aperture(26.0 / 10.0);
                let tv = apex_shutter(1.0 / f64::from(attrs.exposure_time.den));
                let sv = apex_speed(f64::from(attrs.iso_speed));
                (av + tv - sv, exposure - EV_DEFAULT)
            }
        };
        attrs.brightness = SRational::new(bv, APEX_DEN);

        let scene = settings.applied.scene_mode;
        attrs.exposure_bias = if scene == Some(SceneMode::BeachSnow as i32) {
            SRational::new(APEX_DEN, APEX_DEN)
        } else {
            SRational::new(ev * APEX_DEN, APEX_DEN)
        };

        attrs.metering_mode = match settings.metering {
            Metering::Matrix => 1,
            Metering::Center => 2,
            Metering::Spot => 3,
        };

        attrs.white_balance = match settings.applied.white_balance {
            None => 0,
            Some(wb) if wb == WhiteBalance::Auto as i32 => 0,
            Some(_) => 1,
        };

        attrs.scene_capture_type = match scene {
            Some(s) if s == SceneMode::Portrait as i32 => 2,
            Some(s) if s == SceneMode::Landscape as i32 => 1,
            Some(s) if s == SceneMode::Nightshot as i32 => 3,
            _ => 0,
        };

        attrs.gps = gps_from_params(store);
        attrs
    }
}

fn degrees(value: f64) -> [Rational; 3] {
    [
        Rational::new((value.abs() * 1e7).round() as u32, 10_000_000),
        Rational::new(0, 1),
        Rational::new(0, 1),
    ]
}

/// GPS attributes, present only when position, altitude and a timestamp
/// were all supplied.
pub fn gps_from_params(store: &ParamStore) -> Option<GpsAttributes> {
    let number = |key: &str| store.get_string(key)?.trim().parse::<f64>().ok();

    let latitude = number("gps-latitude")?;
    let longitude = number("gps-longitude")?;
    let altitude = number("gps-altitude")?;
    let timestamp = store
        .get_string("gps-timestamp")?
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|&t| t > 0)?;
    let time: DateTime<Utc> = DateTime::from_timestamp(timestamp, 0)?;

    let processing_method = store
        .get_string("gps-processing-method")
        .filter(|m| !m.is_empty())
        .map(|m| m.chars().take(MAX_PROCESSING_METHOD).collect());

    Some(GpsAttributes {
        latitude_ref: if latitude > 0.0 { "N" } else { "S" },
        latitude: degrees(latitude),
        longitude_ref: if longitude > 0.0 { "E" } else { "W" },
        longitude: degrees(longitude),
        altitude_ref: if altitude > 0.0 { 0 } else { 1 },
        altitude: Rational::new((altitude * 100.0).abs() as u32, 100),
        timestamp: [
            Rational::new(time.hour(), 1),
            Rational::new(time.minute(), 1),
            Rational::new(time.second(), 1),
        ],
        datestamp: time.format("%Y:%m:%d").to_string(),
        processing_method,
    })
}

// ============================================================================
// TIFF writer
// ============================================================================

mod tag {
    pub const IMAGE_WIDTH: u16 = 0x0100;
    pub const IMAGE_LENGTH: u16 = 0x0101;
    pub const COMPRESSION: u16 = 0x0103;
    pub const MAKE: u16 = 0x010F;
    pub const MODEL: u16 = 0x0110;
    pub const ORIENTATION: u16 = 0x0112;
    pub const X_RESOLUTION: u16 = 0x011A;
    pub const Y_RESOLUTION: u16 = 0x011B;
    pub const RESOLUTION_UNIT: u16 = 0x0128;
    pub const SOFTWARE: u16 = 0x0131;
    pub const DATE_TIME: u16 = 0x0132;
    pub const JPEG_INTERCHANGE_FORMAT: u16 = 0x0201;
    pub const JPEG_INTERCHANGE_FORMAT_LENGTH: u16 = 0x0202;
    pub const YCBCR_POSITIONING: u16 = 0x0213;
    pub const EXIF_IFD_POINTER: u16 = 0x8769;
    pub const GPS_IFD_POINTER: u16 = 0x8825;

    pub const EXPOSURE_TIME: u16 = 0x829A;
    pub const FNUMBER: u16 = 0x829D;
    pub const EXPOSURE_PROGRAM: u16 = 0x8822;
    pub const ISO_SPEED_RATINGS: u16 = 0x8827;
    pub const EXIF_VERSION: u16 = 0x9000;
    pub const DATE_TIME_ORIGINAL: u16 = 0x9003;
    pub const DATE_TIME_DIGITIZED: u16 = 0x9004;
    pub const SHUTTER_SPEED: u16 = 0x9201;
    pub const APERTURE: u16 = 0x9202;
    pub const BRIGHTNESS: u16 = 0x9203;
    pub const EXPOSURE_BIAS: u16 = 0x9204;
    pub const MAX_APERTURE: u16 = 0x9205;
    pub const METERING_MODE: u16 = 0x9207;
    pub const FLASH: u16 = 0x9209;
    pub const FOCAL_LENGTH: u16 = 0x920A;
    pub const USER_COMMENT: u16 = 0x9286;
    pub const COLOR_SPACE: u16 = 0xA001;
    pub const PIXEL_X_DIMENSION: u16 = 0xA002;
    pub const PIXEL_Y_DIMENSION: u16 = 0xA003;
    pub const EXPOSURE_MODE: u16 = 0xA402;
    pub const WHITE_BALANCE: u16 = 0xA403;
    pub const SCENE_CAPTURE_TYPE: u16 = 0xA406;

    pub const GPS_VERSION_ID: u16 = 0x0000;
    pub const GPS_LATITUDE_REF: u16 = 0x0001;
    pub const GPS_LATITUDE: u16 = 0x0002;
    pub const GPS_LONGITUDE_REF: u16 = 0x0003;
    pub const GPS_LONGITUDE: u16 = 0x0004;
    pub const GPS_ALTITUDE_REF: u16 = 0x0005;
    pub const GPS_ALTITUDE: u16 = 0x0006;
    pub const GPS_TIMESTAMP: u16 = 0x0007;
    pub const GPS_PROCESSING_METHOD: u16 = 0x001B;
    pub const GPS_DATESTAMP: u16 = 0x001D;
}

/// A typed IFD entry value.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Byte(Vec<u8>),
    /// NUL terminator included.
    Ascii(Vec<u8>),
    Short(u16),
    Long(u32),
    Rational(Vec<Rational>),
    Undefined(Vec<u8>),
    SRational(Vec<SRational>),
}

impl Value {
    fn ascii(text: &str) -> Self {
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        Value::Ascii(bytes)
    }

    /// ASCII padded or truncated to `len` bytes including the terminator.
    fn ascii_fixed(text: &str, len: usize) -> Self {
        let mut bytes: Vec<u8> = text.bytes().take(len.saturating_sub(1)).collect();
        bytes.resize(len, 0);
        Value::Ascii(bytes)
    }

    fn prefixed(text: &str) -> Self {
        let mut bytes = ASCII_PREFIX.to_vec();
        bytes.extend_from_slice(text.as_bytes());
        Value::Undefined(bytes)
    }

    fn type_code(&self) -> u16 {
        match self {
            Value::Byte(_) => 1,
            Value::Ascii(_) => 2,
            Value::Short(_) => 3,
            Value::Long(_) => 4,
            Value::Rational(_) => 5,
            Value::Undefined(_) => 7,
            Value::SRational(_) => 10,
        }
    }

    fn count(&self) -> u32 {
        let n = match self {
            Value::Byte(v) | Value::Ascii(v) | Value::Undefined(v) => v.len(),
            Value::Short(_) | Value::Long(_) => 1,
            Value::Rational(v) => v.len(),
            Value::SRational(v) => v.len(),
        };
        n as u32
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Value::Byte(v) | Value::Ascii(v) | Value::Undefined(v) => v.clone(),
            Value::Short(v) => v.to_le_bytes().to_vec(),
            Value::Long(v) => v.to_le_bytes().to_vec(),
            Value::Rational(v) => v
                .iter()
                .flat_map(|r| [r.num.to_le_bytes(), r.den.to_le_bytes()])
                .flatten()
                .collect(),
            Value::SRational(v) => v
                .iter()
                .flat_map(|r| [r.num.to_le_bytes(), r.den.to_le_bytes()])
                .flatten()
                .collect(),
        }
    }
}

fn padded(len: usize) -> usize {
    len + (len & 1)
}

/// Little-endian byte cursor over the TIFF body.
#[derive(Debug, Default)]
struct TiffWriter {
    buf: Vec<u8>,
}

impl TiffWriter {
    fn position(&self) -> u32 {
        self.buf.len() as u32
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn header(&mut self) {
        self.bytes(b"II");
        self.u16(0x002A);
        self.u32(TIFF_HEADER_LEN);
    }
}

#[derive(Debug, Clone, Default)]
struct Ifd {
    entries: Vec<(u16, Value)>,
}

impl Ifd {
    fn push(&mut self, tag: u16, value: Value) {
        self.entries.push((tag, value));
    }

    fn set(&mut self, tag: u16, value: Value) {
        if let Some(entry) = self.entries.iter_mut().find(|(t, _)| *t == tag) {
            entry.1 = value;
        }
    }

    fn directory_len(&self) -> u32 {
        (2 + 12 * self.entries.len() + 4) as u32
    }

    fn values_len(&self) -> u32 {
        self.entries
            .iter()
            .map(|(_, v)| v.encode().len())
            .filter(|&len| len > 4)
            .map(padded)
            .sum::<usize>() as u32
    }

    fn len(&self) -> u32 {
        self.directory_len() + self.values_len()
    }

    /// Writes the directory at the cursor followed by its external values.
    fn write(&self, out: &mut TiffWriter, next_ifd: u32) {
        let mut value_offset = out.position() + self.directory_len();
        let mut external = Vec::new();

        out.u16(self.entries.len() as u16);
        for (tag, value) in &self.entries {
            let data = value.encode();
            out.u16(*tag);
            out.u16(value.type_code());
            out.u32(value.count());
            if data.len() <= 4 {
                let mut inline = [0u8; 4];
                inline[..data.len()].copy_from_slice(&data);
                out.bytes(&inline);
            } else {
                out.u32(value_offset);
                value_offset += padded(data.len()) as u32;
                external.push(data);
            }
        }
        out.u32(next_ifd);

        for data in external {
            out.bytes(&data);
            if data.len() % 2 == 1 {
                out.bytes(&[0]);
            }
        }
    }
}

// ============================================================================
// APP1 block
// ============================================================================

fn ifd0(attrs: &ExifAttributes, with_gps: bool) -> Ifd {
    let mut ifd = Ifd::default();
    ifd.push(tag::IMAGE_WIDTH, Value::Long(attrs.width));
    ifd.push(tag::IMAGE_LENGTH, Value::Long(attrs.height));
    ifd.push(tag::MAKE, Value::ascii(&attrs.make));
    ifd.push(tag::MODEL, Value::ascii(&attrs.model));
    ifd.push(tag::ORIENTATION, Value::Short(attrs.orientation));
    ifd.push(tag::SOFTWARE, Value::ascii(&attrs.software));
    ifd.push(tag::DATE_TIME, Value::ascii_fixed(&attrs.date_time, 20));
    ifd.push(tag::YCBCR_POSITIONING, Value::Short(attrs.ycbcr_positioning));
    ifd.push(tag::EXIF_IFD_POINTER, Value::Long(0));
    if with_gps {
        ifd.push(tag::GPS_IFD_POINTER, Value::Long(0));
    }
    ifd
}

fn exif_ifd(attrs: &ExifAttributes) -> Ifd {
    let mut ifd = Ifd::default();
    ifd.push(tag::EXPOSURE_TIME, Value::Rational(vec![attrs.exposure_time]));
    ifd.push(tag::FNUMBER, Value::Rational(vec![attrs.fnumber]));
    ifd.push(tag::EXPOSURE_PROGRAM, Value::Short(attrs.exposure_program));
    ifd.push(tag::ISO_SPEED_RATINGS, Value::Short(attrs.iso_speed));
    ifd.push(tag::EXIF_VERSION, Value::Undefined(attrs.exif_version.to_vec()));
    ifd.push(tag::DATE_TIME_ORIGINAL, Value::ascii_fixed(&attrs.date_time, 20));
    ifd.push(tag::DATE_TIME_DIGITIZED, Value::ascii_fixed(&attrs.date_time, 20));
    ifd.push(tag::SHUTTER_SPEED, Value::SRational(vec![attrs.shutter_speed]));
    ifd.push(tag::APERTURE, Value::Rational(vec![attrs.aperture]));
    ifd.push(tag::BRIGHTNESS, Value::SRational(vec![attrs.brightness]));
    ifd.push(tag::EXPOSURE_BIAS, Value::SRational(vec![attrs.exposure_bias]));
    ifd.push(tag::MAX_APERTURE, Value::Rational(vec![attrs.max_aperture]));
    ifd.push(tag::METERING_MODE, Value::Short(attrs.metering_mode));
    ifd.push(tag::FLASH, Value::Short(attrs.flash));
    ifd.push(tag::FOCAL_LENGTH, Value::Rational(vec![attrs.focal_length]));
    ifd.push(tag::USER_COMMENT, Value::prefixed(&attrs.user_comment));
    ifd.push(tag::COLOR_SPACE, Value::Short(attrs.color_space));
    ifd.push(tag::PIXEL_X_DIMENSION, Value::Long(attrs.width));
    ifd.push(tag::PIXEL_Y_DIMENSION, Value::Long(attrs.height));
    ifd.push(tag::EXPOSURE_MODE, Value::Short(attrs.exposure_mode));
    ifd.push(tag::WHITE_BALANCE, Value::Short(attrs.white_balance));
    ifd.push(tag::SCENE_CAPTURE_TYPE, Value::Short(attrs.scene_capture_type));
    ifd
}

fn gps_ifd(gps: &GpsAttributes) -> Ifd {
    let mut ifd = Ifd::default();
    ifd.push(tag::GPS_VERSION_ID, Value::Byte(vec![2, 2, 0, 0]));
    ifd.push(tag::GPS_LATITUDE_REF, Value::ascii(gps.latitude_ref));
    ifd.push(tag::GPS_LATITUDE, Value::Rational(gps.latitude.to_vec()));
    ifd.push(tag::GPS_LONGITUDE_REF, Value::ascii(gps.longitude_ref));
    ifd.push(tag::GPS_LONGITUDE, Value::Rational(gps.longitude.to_vec()));
    ifd.push(tag::GPS_ALTITUDE_REF, Value::Byte(vec![gps.altitude_ref]));
    ifd.push(tag::GPS_ALTITUDE, Value::Rational(vec![gps.altitude]));
    ifd.push(tag::GPS_TIMESTAMP, Value::Rational(gps.timestamp.to_vec()));
    if let Some(method) = &gps.processing_method {
        ifd.push(tag::GPS_PROCESSING_METHOD, Value::prefixed(method));
    }
    ifd.push(tag::GPS_DATESTAMP, Value::ascii_fixed(&gps.datestamp, 11));
    ifd
}

fn ifd1(attrs: &ExifAttributes, thumbnail_len: usize) -> Ifd {
    let mut ifd = Ifd::default();
    ifd.push(tag::IMAGE_WIDTH, Value::Long(attrs.thumbnail_width));
    ifd.push(tag::IMAGE_LENGTH, Value::Long(attrs.thumbnail_height));
    ifd.push(tag::COMPRESSION, Value::Short(attrs.compression));
    ifd.push(tag::ORIENTATION, Value::Short(attrs.orientation));
    ifd.push(tag::X_RESOLUTION, Value::Rational(vec![attrs.x_resolution]));
    ifd.push(tag::Y_RESOLUTION, Value::Rational(vec![attrs.y_resolution]));
    ifd.push(tag::RESOLUTION_UNIT, Value::Short(attrs.resolution_unit));
    ifd.push(tag::JPEG_INTERCHANGE_FORMAT, Value::Long(0));
    ifd.push(tag::JPEG_INTERCHANGE_FORMAT_LENGTH, Value::Long(thumbnail_len as u32));
    ifd
}

fn tiff_body(attrs: &ExifAttributes, thumbnail: Option<&[u8]>) -> Vec<u8> {
    let gps = attrs.gps.as_ref().map(gps_ifd);
    let mut ifd0 = ifd0(attrs, gps.is_some());
    let exif = exif_ifd(attrs);
    let mut ifd1 = thumbnail.map(|t| ifd1(attrs, t.len()));

    // plan every offset before writing; sizes do not depend on offsets
    let exif_offset = TIFF_HEADER_LEN + ifd0.len();
    let gps_offset = exif_offset + exif.len();
    let ifd1_offset = gps_offset + gps.as_ref().map_or(0, Ifd::len);

    ifd0.set(tag::EXIF_IFD_POINTER, Value::Long(exif_offset));
    if gps.is_some() {
        ifd0.set(tag::GPS_IFD_POINTER, Value::Long(gps_offset));
    }
    if let Some(ifd1) = ifd1.as_mut() {
        let thumbnail_offset = ifd1_offset + ifd1.len();
        ifd1.set(tag::JPEG_INTERCHANGE_FORMAT, Value::Long(thumbnail_offset));
    }

    let mut out = TiffWriter::default();
    out.header();
    ifd0.write(&mut out, if ifd1.is_some() { ifd1_offset } else { 0 });
    debug_assert_eq!(out.position(), exif_offset);
    exif.write(&mut out, 0);
    if let Some(gps) = &gps {
        debug_assert_eq!(out.position(), gps_offset);
        gps.write(&mut out, 0);
    }
    if let (Some(ifd1), Some(thumbnail)) = (&ifd1, thumbnail) {
        debug_assert_eq!(out.position(), ifd1_offset);
        ifd1.write(&mut out, 0);
        out.bytes(thumbnail);
    }
    out.buf
}

/// Builds the complete APP1 segment, marker included.
///
/// A thumbnail that would push the segment past the 64 KiB JPEG limit is
/// left out.
pub fn build_exif(attrs: &ExifAttributes, thumbnail: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut tiff = tiff_body(attrs, thumbnail);
    if tiff.len() + APP1_FRAMING - 2 > usize::from(u16::MAX) && thumbnail.is_some() {
        warn!("thumbnail does not fit in the APP1 segment, dropping it");
        tiff = tiff_body(attrs, None);
    }

    let exif_size = tiff.len() + APP1_FRAMING;
    let segment_len = u16::try_from(exif_size - 2)
        .map_err(|_| CameraError::Malformed(format!("EXIF block of {} bytes", exif_size)))?;

    let mut block = Vec::with_capacity(exif_size);
    block.extend_from_slice(&APP1);
    block.extend_from_slice(&segment_len.to_be_bytes());
    block.extend_from_slice(EXIF_HEADER);
    block.extend_from_slice(&tiff);
    debug!("EXIF block: {} bytes", block.len());
    Ok(block)
}

// ============================================================================
// Container
// ============================================================================

/// Inserts `exif` right after the SOI marker of `main`.
pub fn assemble_jpeg(main: &[u8], exif: &[u8]) -> Result<Vec<u8>> {
    if main.len() < SOI.len() || main[..2] != SOI {
        return Err(CameraError::Malformed(
            "main image does not start with a JPEG SOI marker".into(),
        ));
    }
    let mut out = Vec::with_capacity(main.len() + exif.len());
    out.extend_from_slice(&main[..2]);
    out.extend_from_slice(exif);
    out.extend_from_slice(&main[2..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn attrs() -> ExifAttributes {
        let mut attrs = ExifAttributes::with_defaults(&DeviceIdentity::default());
        attrs.width = 640;
        attrs.height = 480;
        attrs.thumbnail_width = 160;
        attrs.thumbnail_height = 120;
        attrs.date_time = "2024:05:01 12:30:45".into();
        attrs
    }

    fn u16_at(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    fn u32_at(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    #[test]
    fn test_apex_helpers() {
        assert_eq!(apex_aperture(2.6), 28);
        assert_eq!(shutter_to_exposure_den(600), 64);
        assert_eq!(shutter_to_exposure_den(-500), 1);
        assert_eq!(apex_speed(100.0), 50);
        assert_eq!(apex_shutter(1.0 / 64.0), 60);
    }

    #[test]
    fn test_framing_and_header() {
        let block = build_exif(&attrs(), None).unwrap();
        assert_eq!(&block[..2], &APP1);
        let len = u16::from_be_bytes([block[2], block[3]]) as usize;
        assert_eq!(len, block.len() - 2);
        assert_eq!(&block[4..10], b"Exif\0\0");
        assert_eq!(&block[10..14], b"II*\0");
        assert_eq!(u32_at(&block, 14), 8);
    }

    #[test]
    fn test_directory_counts_and_links() {
        let thumb = [0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let mut a = attrs();
        let block = build_exif(&a, Some(&thumb)).unwrap();
        let tiff = &block[10..];

        assert_eq!(u16_at(tiff, 8), 9);
        let exif_ptr = u32_at(tiff, 8 + 2 + 8 * 12 + 8) as usize;
        assert_eq!(exif_ptr, 8 + 2 + 9 * 12 + 4 + 8 + 8 + 8 + 20);
        assert_eq!(u16_at(tiff, exif_ptr), 22);

        let ifd1 = u32_at(tiff, 8 + 2 + 9 * 12) as usize;
        assert_eq!(u16_at(tiff, ifd1), 9);
        let jpeg_offset = u32_at(tiff, ifd1 + 2 + 7 * 12 + 8) as usize;
        let jpeg_len = u32_at(tiff, ifd1 + 2 + 8 * 12 + 8) as usize;
        assert_eq!(&tiff[jpeg_offset..jpeg_offset + jpeg_len], &thumb);
        assert_eq!(jpeg_offset + jpeg_len, tiff.len());

        a.gps = Some(GpsAttributes {
            latitude_ref: "N",
            latitude: degrees(37.5),
            longitude_ref: "W",
            longitude: degrees(-122.25),
            altitude_ref: 0,
            altitude: Rational::new(1200, 100),
            timestamp: [Rational::new(1, 1), Rational::new(2, 1), Rational::new(3, 1)],
            datestamp: "2024:05:01".into(),
            processing_method: None,
        });
        let block = build_exif(&a, None).unwrap();
        let tiff = &block[10..];
        assert_eq!(u16_at(tiff, 8), 10);
        assert_eq!(u32_at(tiff, 8 + 2 + 10 * 12), 0);
        let gps_ptr = u32_at(tiff, 8 + 2 + 9 * 12 + 8) as usize;
        assert_eq!(u16_at(tiff, gps_ptr), 9);
    }

    #[test]
    fn test_external_values_are_even_aligned() {
        let mut a = attrs();
        a.make = "LGE".into();
        a.model = "Nexus".into();
        let block = build_exif(&a, None).unwrap();
        let tiff = &block[10..];

        // "LGE\0" fits inline
        assert_eq!(&tiff[8 + 2 + 2 * 12 + 8..8 + 2 + 2 * 12 + 12], b"LGE\0");
        let model_at = u32_at(tiff, 8 + 2 + 3 * 12 + 8);
        let software_at = u32_at(tiff, 8 + 2 + 5 * 12 + 8);
        assert_eq!(software_at - model_at, 6);
        assert_eq!(software_at % 2, 0);
    }

    #[test]
    fn test_identical_inputs_identical_bytes() {
        let thumb = vec![0xFF, 0xD8, 9, 9, 0xFF, 0xD9];
        let first = build_exif(&attrs(), Some(&thumb)).unwrap();
        let second = build_exif(&attrs(), Some(&thumb)).unwrap();
        assert_eq!(first, second);

        let mut later = attrs();
        later.date_time = "2024:05:01 12:30:46".into();
        let third = build_exif(&later, Some(&thumb)).unwrap();
        assert_eq!(first.len(), third.len());
        let differing = first.iter().zip(&third).filter(|(a, b)| a != b).count();
        assert_eq!(differing, 3);
    }

    #[test]
    fn test_oversized_thumbnail_is_dropped() {
        let thumb = vec![0u8; 70_000];
        let block = build_exif(&attrs(), Some(&thumb)).unwrap();
        assert!(block.len() < 65_536);
        let tiff = &block[10..];
        assert_eq!(u32_at(tiff, 8 + 2 + 9 * 12), 0);
    }

    #[test]
    fn test_gps_from_params() {
        let mut store = ParamStore::new();
        store.set_string("gps-latitude", "37.4219983");
        store.set_string("gps-longitude", "-122.084");
        store.set_string("gps-altitude", "-3.5");
        assert!(gps_from_params(&store).is_none());

        store.set_string("gps-timestamp", "1714566645");
        store.set_string("gps-processing-method", "GPS");
        let gps = gps_from_params(&store).unwrap();
        assert_eq!(gps.latitude_ref, "N");
        assert_eq!(gps.latitude[0], Rational::new(374_219_983, 10_000_000));
        assert_eq!(gps.longitude_ref, "W");
        assert_eq!(gps.altitude_ref, 1);
        assert_eq!(gps.altitude, Rational::new(350, 100));
        assert_eq!(gps.datestamp, "2024:05:01");
        assert_eq!(gps.timestamp[0], Rational::new(12, 1));
        assert_eq!(gps.processing_method.as_deref(), Some("GPS"));
    }

    #[test]
    fn test_gps_keeps_framework_precision() {
        let store = ParamStore::from_flattened(
            "gps-latitude=37.4219983;gps-longitude=-122.0840575;gps-altitude=1.0e2;gps-timestamp=1714566645",
        );
        let gps = gps_from_params(&store).unwrap();
        assert_eq!(gps.latitude[0], Rational::new(374_219_983, 10_000_000));
        assert_eq!(gps.longitude[0], Rational::new(1_220_840_575, 10_000_000));
        assert_eq!(gps.altitude_ref, 0);
        assert_eq!(gps.altitude, Rational::new(10_000, 100));
    }

    #[test]
    fn test_assemble_requires_soi() {
        let exif = build_exif(&attrs(), None).unwrap();
        let main = [0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0xFF, 0xD9];
        let out = assemble_jpeg(&main, &exif).unwrap();
        assert_eq!(out.len(), main.len() + exif.len());
        assert_eq!(&out[..2], &SOI);
        assert_eq!(&out[2..4], &APP1);
        assert_eq!(&out[2 + exif.len()..], &main[2..]);

        let err = assemble_jpeg(&[0x00, 0x00, 0x01], &exif).unwrap_err();
        assert!(matches!(err, CameraError::Malformed(_)));
    }

    #[test]
    fn test_gather_defaults_without_sensor_controls() {
        use crate::preset::CameraConfig;
        use crate::virtual_device::VirtualDevice;

        let config = CameraConfig::galaxys2();
        let mut settings = SessionSettings::from_preset(&config.presets[0]);
        settings.picture_width = 640;
        settings.picture_height = 480;
        let mut store = ParamStore::new();
        store.set_int("rotation", 90);

        let device = VirtualDevice::new();
        device.fail_control(cid::CAMERA_EXIF_BV);
        let now = Local.with_ymd_and_hms(2024, 5, 1, 8, 9, 10).unwrap();
        let a = ExifAttributes::gather(&config.identity, &settings, &store, &device, now);

        assert_eq!(a.orientation, 6);
        assert_eq!(a.date_time, "2024:05:01 08:09:10");
        assert_eq!(a.focal_length, Rational::new(403, 100));
        assert_eq!(a.width, 640);
        assert_eq!(a.metering_mode, 2);
        assert_eq!(a.exposure_bias, SRational::new(0, 10));
        assert!(a.gps.is_none());
    }
}
