//! ASCII sensor-line decoders.
//!
//! The avionics stack emits NMEA-style comma-delimited sentences, one per
//! line:
//!
//! ```text
//! $GPADC,<8 hex ADC channels>          raw IMU (accel + gyro counts)
//! $GPPPM,<8 hex PPM channels>          radio receiver pulse widths
//! $GPHDM,ddd                           magnetic heading, whole degrees
//! $GPGGA,...                           NMEA GPS fix
//! $GPVTG,...                           NMEA GPS track and ground speed
//! ```
//!
//! Decoders are pure: a malformed line produces a [`ParseError`] and no state
//! change, so a corrupted serial stream degrades to dropped samples. The
//! fusion layer counts rejects and keeps going.

use std::error::Error;
use std::fmt;

use nalgebra::Vector3;

/// A sensor line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line does not start with a known `$GP..` talker tag.
    UnknownSentence,
    /// Wrong number of comma-delimited fields.
    FieldCount { expected: usize, found: usize },
    /// A field failed numeric conversion.
    BadField(&'static str),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnknownSentence => write!(f, "unknown sentence type"),
            ParseError::FieldCount { expected, found } => {
                write!(f, "expected {expected} fields, found {found}")
            }
            ParseError::BadField(name) => write!(f, "malformed {name} field"),
        }
    }
}

impl Error for ParseError {}

/// Sentence types the fusion router dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentenceKind {
    Adc,
    Ppm,
    Heading,
    GpsFix,
    GpsTrack,
}

/// Classify a line by its sentence tag.
pub fn sentence_kind(line: &str) -> Option<SentenceKind> {
    match line.get(..6)? {
        "$GPADC" => Some(SentenceKind::Adc),
        "$GPPPM" => Some(SentenceKind::Ppm),
        "$GPHDM" => Some(SentenceKind::Heading),
        "$GPGGA" => Some(SentenceKind::GpsFix),
        "$GPVTG" => Some(SentenceKind::GpsTrack),
        _ => None,
    }
}

/// Split the hex channel fields of an `$GPADC`/`$GPPPM` sentence.
fn hex_fields<const N: usize>(line: &str) -> Result<[i32; N], ParseError> {
    let body = line
        .split_once(',')
        .ok_or(ParseError::FieldCount {
            expected: N,
            found: 0,
        })?
        .1;

    let mut values = [0i32; N];
    let mut count = 0;
    for field in body.split(',') {
        if count == N {
            break;
        }
        values[count] =
            i32::from_str_radix(field.trim(), 16).map_err(|_| ParseError::BadField("channel"))?;
        count += 1;
    }
    if count < N {
        return Err(ParseError::FieldCount {
            expected: N,
            found: count,
        });
    }
    Ok(values)
}

/// A calibrated IMU sample: specific force in m/s² and angular rate in rad/s,
/// both body frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub accel: Vector3<f64>,
    pub gyro: Vector3<f64>,
}

/// Decoder for `$GPADC` lines from the rev 2.4 sensor board.
///
/// The eight 10-bit ADC channels carry the three accelerometer and three
/// rate-gyro axes in board order; the per-axis zero offsets and scale factors
/// below were measured on the bench (±1 g flips for the accelerometers,
/// 0.9444 °/s per bit for the gyros).
#[derive(Debug, Clone)]
pub struct ImuDecoder {
    accel_index: [usize; 3],
    gyro_index: [usize; 3],
    accel_zero: Vector3<f64>,
    accel_scale: Vector3<f64>,
    gyro_zero: Vector3<f64>,
    gyro_scale: Vector3<f64>,
}

impl Default for ImuDecoder {
    fn default() -> Self {
        ImuDecoder {
            accel_index: [5, 6, 4],
            gyro_index: [3, 2, 7],
            accel_zero: Vector3::new(0x0225 as f64, 0x0270 as f64, 0x0210 as f64),
            accel_scale: Vector3::new(
                -9.81 * 2.0 / 0x1A4 as f64,
                -9.81 * 2.0 / 0x1BB as f64,
                9.81 * 2.0 / 0x1BC as f64,
            ),
            gyro_zero: Vector3::new(0x0224 as f64, 0x01C5 as f64, 0x01D7 as f64),
            gyro_scale: Vector3::repeat(0.9444_f64.to_radians()),
        }
    }
}

impl ImuDecoder {
    /// Decode one `$GPADC` line into a calibrated sample.
    pub fn decode(&self, line: &str) -> Result<ImuSample, ParseError> {
        let ch: [i32; 8] = hex_fields(line)?;

        let mut accel = Vector3::zeros();
        let mut gyro = Vector3::zeros();
        for i in 0..3 {
            accel[i] = (ch[self.accel_index[i]] as f64 - self.accel_zero[i]) * self.accel_scale[i];
            gyro[i] = (ch[self.gyro_index[i]] as f64 - self.gyro_zero[i]) * self.gyro_scale[i];
        }
        Ok(ImuSample { accel, gyro })
    }
}

/// Decode a `$GPHDM,ddd` magnetic heading line into radians in (−π, π].
///
/// The board reports whole degrees in [0, 360); values past 180 wrap to the
/// negative side.
pub fn decode_heading(line: &str) -> Result<f64, ParseError> {
    let field = line
        .split_once(',')
        .ok_or(ParseError::FieldCount {
            expected: 1,
            found: 0,
        })?
        .1;
    let mut degrees: f64 = field
        .trim()
        .parse::<i32>()
        .map_err(|_| ParseError::BadField("heading"))? as f64;

    if degrees > 180.0 {
        degrees -= 360.0;
    }
    Ok(degrees.to_radians())
}

/// A decoded `$GPGGA` fix.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsFix {
    /// Seconds past midnight, UTC.
    pub time: f64,
    /// Geodetic latitude in degrees, south negative.
    pub latitude: f64,
    /// Geodetic longitude in degrees, west negative.
    pub longitude: f64,
    /// Fix quality indicator (0 = none).
    pub quality: u8,
    /// Satellites used in the solution.
    pub num_sats: u32,
    /// Horizontal dilution of precision.
    pub hdop: f64,
    /// Antenna altitude above mean sea level, meters.
    pub altitude: f64,
    /// Geoid separation, meters.
    pub wgs_alt: f64,
}

/// A decoded `$GPVTG` track and ground speed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GpsTrack {
    /// True track made good, degrees.
    pub track_true: f64,
    /// Magnetic track made good, degrees.
    pub track_magnetic: f64,
    /// Ground speed, knots.
    pub speed_knots: f64,
    /// Ground speed, km/h.
    pub speed_kmh: f64,
}

fn parse_f64_or_zero(field: &str, name: &'static str) -> Result<f64, ParseError> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(0.0);
    }
    field.parse().map_err(|_| ParseError::BadField(name))
}

/// Decode a `$GPGGA` sentence.
///
/// Latitude arrives as `ddmm.mmm` and longitude as `dddmm.mmm`; minutes are
/// folded into fractional degrees. Empty optional fields (altitude on some
/// receivers) decode as zero, matching the upstream receiver behavior.
pub fn decode_gpgga(line: &str) -> Result<GpsFix, ParseError> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 13 {
        return Err(ParseError::FieldCount {
            expected: 13,
            found: fields.len(),
        });
    }

    let time_field = fields[1];
    if time_field.len() < 6 {
        return Err(ParseError::BadField("time"));
    }
    let hours: f64 = time_field[0..2]
        .parse()
        .map_err(|_| ParseError::BadField("time"))?;
    let minutes: f64 = time_field[2..4]
        .parse()
        .map_err(|_| ParseError::BadField("time"))?;
    let seconds: f64 = time_field[4..]
        .parse()
        .map_err(|_| ParseError::BadField("time"))?;
    let time = hours * 3600.0 + minutes * 60.0 + seconds;

    let lat_field = fields[2];
    if lat_field.len() < 3 {
        return Err(ParseError::BadField("latitude"));
    }
    let lat_deg: f64 = lat_field[0..2]
        .parse()
        .map_err(|_| ParseError::BadField("latitude"))?;
    let lat_min: f64 = lat_field[2..]
        .parse()
        .map_err(|_| ParseError::BadField("latitude"))?;
    let mut latitude = lat_deg + lat_min / 60.0;
    if fields[3] == "S" {
        latitude = -latitude;
    }

    let lon_field = fields[4];
    if lon_field.len() < 4 {
        return Err(ParseError::BadField("longitude"));
    }
    let lon_deg: f64 = lon_field[0..3]
        .parse()
        .map_err(|_| ParseError::BadField("longitude"))?;
    let lon_min: f64 = lon_field[3..]
        .parse()
        .map_err(|_| ParseError::BadField("longitude"))?;
    let mut longitude = lon_deg + lon_min / 60.0;
    if fields[5] == "W" {
        longitude = -longitude;
    }

    let quality: u8 = fields[6]
        .trim()
        .parse()
        .map_err(|_| ParseError::BadField("quality"))?;
    let num_sats: u32 = fields[7]
        .trim()
        .parse()
        .map_err(|_| ParseError::BadField("num_sats"))?;
    let hdop = parse_f64_or_zero(fields[8], "hdop")?;
    let altitude = parse_f64_or_zero(fields[9], "altitude")?;
    let wgs_alt = parse_f64_or_zero(fields[11], "wgs_alt")?;

    Ok(GpsFix {
        time,
        latitude,
        longitude,
        quality,
        num_sats,
        hdop,
        altitude,
        wgs_alt,
    })
}

/// Decode a `$GPVTG` sentence: `$GPVTG,159,T,169,M,04.1,N,07.7,K*48`.
pub fn decode_gpvtg(line: &str) -> Result<GpsTrack, ParseError> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() < 8 {
        return Err(ParseError::FieldCount {
            expected: 8,
            found: fields.len(),
        });
    }

    Ok(GpsTrack {
        track_true: parse_f64_or_zero(fields[1], "track_true")?,
        track_magnetic: parse_f64_or_zero(fields[3], "track_magnetic")?,
        speed_knots: parse_f64_or_zero(fields[5], "speed_knots")?,
        speed_kmh: parse_f64_or_zero(fields[7].split('*').next().unwrap_or(""), "speed_kmh")?,
    })
}

/// Latest-value GPS decoder: routes `$GPGGA`/`$GPVTG` lines and keeps the
/// most recent fix and track.
#[derive(Debug, Clone, Default)]
pub struct GpsDecoder {
    pub fix: GpsFix,
    pub track: GpsTrack,
}

impl GpsDecoder {
    /// Decode one GPS line, updating the stored fix or track.
    pub fn update(&mut self, line: &str) -> Result<(), ParseError> {
        match sentence_kind(line) {
            Some(SentenceKind::GpsFix) => {
                self.fix = decode_gpgga(line)?;
                Ok(())
            }
            Some(SentenceKind::GpsTrack) => {
                self.track = decode_gpvtg(line)?;
                Ok(())
            }
            _ => Err(ParseError::UnknownSentence),
        }
    }
}

/// Decoded radio receiver command, in raw pulse-width counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RadioCommand {
    pub collective: i32,
    pub throttle: i32,
    pub roll: i32,
    pub pitch: i32,
    pub yaw: i32,
    pub extra: i32,
    /// Flight mode switch position, 0..=2.
    pub mode: u8,
    /// Manual-override switch engaged.
    pub manual: bool,
}

/// Decoder for `$GPPPM` radio lines.
///
/// Channel order and the switch thresholds must agree with the transmitter
/// program; the defaults are the Futaba assignments of the flight hardware.
#[derive(Debug, Clone)]
pub struct RadioDecoder {
    collective_index: usize,
    throttle_index: usize,
    roll_index: usize,
    pitch_index: usize,
    yaw_index: usize,
    extra_index: usize,
    manual_index: usize,
    manual_threshold: i32,
    mode_index: usize,
    mode_threshold_0: i32,
    mode_threshold_1: i32,
}

impl Default for RadioDecoder {
    fn default() -> Self {
        RadioDecoder {
            collective_index: 2,
            throttle_index: 5,
            roll_index: 0,
            pitch_index: 1,
            yaw_index: 3,
            extra_index: 7,
            manual_index: 4,
            manual_threshold: 0x3000,
            mode_index: 6,
            mode_threshold_0: 0x2000,
            mode_threshold_1: 0x3800,
        }
    }
}

impl RadioDecoder {
    /// Decode one `$GPPPM` line.
    pub fn decode(&self, line: &str) -> Result<RadioCommand, ParseError> {
        let ch: [i32; 8] = hex_fields(line)?;

        let mode_width = ch[self.mode_index];
        let mode = if mode_width < self.mode_threshold_0 {
            0
        } else if mode_width < self.mode_threshold_1 {
            1
        } else {
            2
        };

        Ok(RadioCommand {
            collective: ch[self.collective_index],
            throttle: ch[self.throttle_index],
            roll: ch[self.roll_index],
            pitch: ch[self.pitch_index],
            yaw: ch[self.yaw_index],
            extra: ch[self.extra_index],
            mode,
            manual: ch[self.manual_index] > self.manual_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn adc_zero_counts_decode_to_rest() {
        // channel layout: [_, _, q, p, az, ax, ay, r], all at calibration zero
        let line = "$GPADC,0000,0000,01C5,0224,0210,0225,0270,01D7";
        let sample = ImuDecoder::default().decode(line).unwrap();
        assert_approx_eq!(sample.accel.norm(), 0.0, 1e-12);
        assert_approx_eq!(sample.gyro.norm(), 0.0, 1e-12);
    }

    #[test]
    fn adc_gyro_scale_is_per_bit() {
        // p channel one count above zero: 0.9444 deg/s
        let line = "$GPADC,0000,0000,01C5,0225,0210,0225,0270,01D7";
        let sample = ImuDecoder::default().decode(line).unwrap();
        assert_approx_eq!(sample.gyro[0], 0.9444_f64.to_radians(), 1e-12);
        assert_approx_eq!(sample.gyro[1], 0.0, 1e-12);
    }

    #[test]
    fn adc_accel_x_sign_is_inverted() {
        // counts above the zero point on ax map to negative specific force
        let line = "$GPADC,0000,0000,01C5,0224,0210,0303,0270,01D7";
        let sample = ImuDecoder::default().decode(line).unwrap();
        assert!(sample.accel[0] < -9.0);
    }

    #[test]
    fn adc_short_line_is_rejected() {
        let err = ImuDecoder::default()
            .decode("$GPADC,0000,0000,01C5")
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::FieldCount {
                expected: 8,
                found: 3
            }
        );
    }

    #[test]
    fn heading_wraps_past_180() {
        assert_approx_eq!(decode_heading("$GPHDM,090").unwrap(), 90.0_f64.to_radians(), 1e-12);
        assert_approx_eq!(
            decode_heading("$GPHDM,270").unwrap(),
            -90.0_f64.to_radians(),
            1e-12
        );
        assert_approx_eq!(decode_heading("$GPHDM,180").unwrap(), std::f64::consts::PI, 1e-12);
    }

    #[test]
    fn gpgga_reference_sentence() {
        let fix =
            decode_gpgga("$GPGGA,020314.0,3902.848,N,07706.833,W,1,4,002.3,,M,-033,M,,*50")
                .unwrap();
        assert_approx_eq!(fix.time, 7394.0, 1e-9);
        assert_approx_eq!(fix.latitude, 39.0 + 2.848 / 60.0, 1e-9);
        assert_approx_eq!(fix.longitude, -(77.0 + 6.833 / 60.0), 1e-9);
        assert_eq!(fix.quality, 1);
        assert_eq!(fix.num_sats, 4);
        assert_approx_eq!(fix.hdop, 2.3, 1e-9);
        assert_approx_eq!(fix.altitude, 0.0, 1e-12);
        assert_approx_eq!(fix.wgs_alt, -33.0, 1e-9);
    }

    #[test]
    fn gpgga_southern_western_hemispheres() {
        let fix =
            decode_gpgga("$GPGGA,120000.0,3330.000,S,07030.000,W,1,6,001.0,520,M,10,M,,*00")
                .unwrap();
        assert_approx_eq!(fix.latitude, -33.5, 1e-9);
        assert_approx_eq!(fix.longitude, -70.5, 1e-9);
        assert_approx_eq!(fix.altitude, 520.0, 1e-9);
    }

    #[test]
    fn gpvtg_reference_sentence() {
        let track = decode_gpvtg("$GPVTG,159,T,169,M,04.1,N,07.7,K*48").unwrap();
        assert_approx_eq!(track.track_true, 159.0, 1e-9);
        assert_approx_eq!(track.track_magnetic, 169.0, 1e-9);
        assert_approx_eq!(track.speed_knots, 4.1, 1e-9);
        assert_approx_eq!(track.speed_kmh, 7.7, 1e-9);
    }

    #[test]
    fn gps_decoder_routes_by_sentence() {
        let mut gps = GpsDecoder::default();
        gps.update("$GPGGA,020314.0,3902.848,N,07706.833,W,1,4,002.3,,M,-033,M,,*50")
            .unwrap();
        gps.update("$GPVTG,159,T,169,M,04.1,N,07.7,K*48").unwrap();
        assert_eq!(gps.fix.num_sats, 4);
        assert_approx_eq!(gps.track.speed_knots, 4.1, 1e-9);

        assert_eq!(
            gps.update("$GPXXX,1").unwrap_err(),
            ParseError::UnknownSentence
        );
    }

    #[test]
    fn ppm_switch_thresholds() {
        // manual above 0x3000, mode between 0x2000 and 0x3800
        let cmd = RadioDecoder::default()
            .decode("$GPPPM,1000,1100,1200,1300,3800,1500,2800,1700")
            .unwrap();
        assert_eq!(cmd.roll, 0x1000);
        assert_eq!(cmd.pitch, 0x1100);
        assert_eq!(cmd.collective, 0x1200);
        assert_eq!(cmd.yaw, 0x1300);
        assert_eq!(cmd.throttle, 0x1500);
        assert!(cmd.manual);
        assert_eq!(cmd.mode, 1);

        let cmd = RadioDecoder::default()
            .decode("$GPPPM,1000,1100,1200,1300,2000,1500,3900,1700")
            .unwrap();
        assert!(!cmd.manual);
        assert_eq!(cmd.mode, 2);
    }

    #[test]
    fn sentence_kinds() {
        assert_eq!(sentence_kind("$GPADC,1"), Some(SentenceKind::Adc));
        assert_eq!(sentence_kind("$GPHDM,90"), Some(SentenceKind::Heading));
        assert_eq!(sentence_kind("$GPGGA,"), Some(SentenceKind::GpsFix));
        assert_eq!(sentence_kind("$GPXYZ,"), None);
        assert_eq!(sentence_kind("$GP"), None);
    }
}
