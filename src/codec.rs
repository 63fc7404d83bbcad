//! Serial frame codec for the platform firmware.
//!
//! Frames are newline-terminated ASCII lines:
//!
//! ```text
//! IMU:<id>,<ax>,<ay>,<az>,<gx>,<gy>,<gz>*<CC>
//! S:<s1>,<s2>,<s3>,<s4>,<s5>,<s6>*<CC>
//! ```
//!
//! Values are signed 16-bit raw counts. `CC` is a two-digit hex CRC-8
//! (poly 0x31, init 0xFF, MSB first) over the little-endian bytes of each
//! value. The IMU id is not covered by the checksum.

use crc::{Crc, CRC_8_NRSC_5};
use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::types::{Frame, ImuSample, ServoAngles, Vec3};

/// CRC-8/NRSC-5 is exactly the firmware's table-less loop: poly 0x31, init 0xFF,
/// no reflection, no final xor.
pub static FRAME_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

const IMU_FIELDS: usize = 7;
const SERVO_FIELDS: usize = 6;
/// Upper bound for `max_line_len`; firmware lines are under 64 bytes.
const MAX_LINE_LIMIT: usize = 64 * 1024;
const MAX_PREALLOC: usize = 4096;

/// Checksum over a run of raw values, `[lsb, msb]` per value.
pub fn checksum(values: &[i16]) -> u8 {
    let mut digest = FRAME_CRC.digest();
    for value in values {
        digest.update(&value.to_le_bytes());
    }
    digest.finalize()
}

/// Wire layout and scaling. Defaults match the current platform firmware.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameFormat {
    pub imu_marker: String,
    pub servo_marker: String,
    /// m/s² per accelerometer count
    pub accel_scale: f64,
    /// gyro counts per °/s
    pub gyro_lsb_per_dps: f64,
    /// accelerometer counts per g (G-force readout)
    pub lsb_per_g: f64,
    /// accelerometer counts mapped to a full 90° platform tilt
    pub tilt_full_scale: f64,
    /// longest line accepted before the buffer is flushed
    pub max_line_len: usize,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            imu_marker: "IMU:".to_string(),
            servo_marker: "S:".to_string(),
            accel_scale: 0.000565,
            gyro_lsb_per_dps: 65.5,
            lsb_per_g: 16390.0,
            tilt_full_scale: 17000.0,
            max_line_len: 256,
        }
    }
}

impl FrameFormat {
    pub fn accel_from_raw(&self, raw: i16) -> f64 {
        f64::from(raw) * self.accel_scale
    }

    pub fn gyro_from_raw(&self, raw: i16) -> f64 {
        (f64::from(raw) / self.gyro_lsb_per_dps).to_radians()
    }

    pub fn accel_to_raw(&self, value: f64) -> i16 {
        saturate(value / self.accel_scale)
    }

    pub fn gyro_to_raw(&self, value: f64) -> i16 {
        saturate(value.to_degrees() * self.gyro_lsb_per_dps)
    }

    /// Accelerometer vector back in raw counts (tilt and G-force readouts work
    /// in counts, like the firmware).
    pub fn accel_counts(&self, accel: &Vec3) -> Vec3 {
        accel / self.accel_scale
    }

    /// Planar G-force (x, y) in g.
    pub fn g_force(&self, accel: &Vec3) -> [f64; 2] {
        let counts = self.accel_counts(accel);
        [counts.x / self.lsb_per_g, counts.y / self.lsb_per_g]
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.imu_marker.is_empty() || self.servo_marker.is_empty() {
            return Err("frame markers must not be empty".to_string());
        }
        if self.imu_marker == self.servo_marker {
            return Err("IMU and servo markers must differ".to_string());
        }
        for (name, value) in [
            ("accel_scale", self.accel_scale),
            ("gyro_lsb_per_dps", self.gyro_lsb_per_dps),
            ("lsb_per_g", self.lsb_per_g),
            ("tilt_full_scale", self.tilt_full_scale),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("{} must be positive, got {}", name, value));
            }
        }
        if !(16..=MAX_LINE_LIMIT).contains(&self.max_line_len) {
            return Err(format!(
                "max_line_len must be in [16, {}], got {}",
                MAX_LINE_LIMIT, self.max_line_len
            ));
        }
        Ok(())
    }
}

fn saturate(value: f64) -> i16 {
    value
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecStats {
    pub frames: u64,
    pub errors: u64,
    pub bytes_skipped: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameKind {
    Imu,
    Servo,
}

/// Incremental decoder. One instance per connection session.
pub struct FrameCodec {
    format: FrameFormat,
    buffer: Vec<u8>,
    // set after an oversized line; bytes are dropped up to the next terminator
    discarding: bool,
    stats: CodecStats,
}

impl FrameCodec {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            buffer: Vec::with_capacity(format.max_line_len.min(MAX_PREALLOC).saturating_mul(2)),
            format,
            discarding: false,
            stats: CodecStats::default(),
        }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn stats(&self) -> CodecStats {
        self.stats
    }

    /// Bytes waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Forget any partial line, e.g. when a new session starts.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Append a chunk read from the transport and lazily decode every complete
    /// line it finishes. Incomplete trailing bytes stay buffered for the next
    /// call.
    pub fn decode<'a>(&'a mut self, bytes: &[u8], received_at: f64) -> Decode<'a> {
        self.append(bytes);
        Decode {
            codec: self,
            received_at,
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        if !self.discarding {
            self.buffer.extend_from_slice(bytes);
            return;
        }
        match bytes.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.stats.bytes_skipped += (pos + 1) as u64;
                self.discarding = false;
                self.buffer.extend_from_slice(&bytes[pos + 1..]);
            }
            None => self.stats.bytes_skipped += bytes.len() as u64,
        }
    }

    fn next_frame(&mut self, received_at: f64) -> Option<Result<Frame, FrameError>> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > self.format.max_line_len {
                    self.stats.bytes_skipped += self.buffer.len() as u64;
                    self.buffer.clear();
                    self.discarding = true;
                    return Some(self.fail(FrameError::Oversized {
                        limit: self.format.max_line_len,
                    }));
                }
                return None;
            };

            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if pos > self.format.max_line_len {
                self.stats.bytes_skipped += line.len() as u64;
                return Some(self.fail(FrameError::Oversized {
                    limit: self.format.max_line_len,
                }));
            }

            let line = line[..pos].trim_ascii();
            if line.is_empty() {
                continue;
            }

            let result = self.parse_line(line, received_at);
            match result {
                Ok(frame) => {
                    self.stats.frames += 1;
                    return Some(Ok(frame));
                }
                Err(e) => return Some(self.fail(e)),
            }
        }
    }

    fn fail(&mut self, error: FrameError) -> Result<Frame, FrameError> {
        self.stats.errors += 1;
        Err(error)
    }

    fn find_marker(&self, line: &[u8]) -> Option<(FrameKind, usize, usize)> {
        let imu = find_subslice(line, self.format.imu_marker.as_bytes())
            .map(|p| (FrameKind::Imu, p, self.format.imu_marker.len()));
        let servo = find_subslice(line, self.format.servo_marker.as_bytes())
            .map(|p| (FrameKind::Servo, p, self.format.servo_marker.len()));
        match (imu, servo) {
            (Some(a), Some(b)) => Some(if a.1 <= b.1 { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    fn parse_line(&mut self, line: &[u8], received_at: f64) -> Result<Frame, FrameError> {
        let (kind, start, marker_len) = self.find_marker(line).ok_or(FrameError::UnknownMarker)?;
        if start > 0 {
            // resynchronized on a marker in the middle of the line
            self.stats.bytes_skipped += start as u64;
        }

        let body = &line[start + marker_len..];
        let body = std::str::from_utf8(body).map_err(|_| FrameError::InvalidField {
            index: 0,
            value: String::from_utf8_lossy(body).into_owned(),
        })?;

        let (data, crc_text) = body.rsplit_once('*').ok_or(FrameError::MissingChecksum)?;
        let crc_text = crc_text.trim();
        if crc_text.len() != 2 || !crc_text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FrameError::BadChecksumFormat(crc_text.to_string()));
        }
        let received = u8::from_str_radix(crc_text, 16)
            .map_err(|_| FrameError::BadChecksumFormat(crc_text.to_string()))?;

        let fields: Vec<&str> = data.split(',').map(str::trim).collect();
        match kind {
            FrameKind::Imu => self.parse_imu(&fields, received, received_at),
            FrameKind::Servo => parse_servo(&fields, received, received_at),
        }
    }

    fn parse_imu(
        &self,
        fields: &[&str],
        received: u8,
        received_at: f64,
    ) -> Result<Frame, FrameError> {
        if fields.len() != IMU_FIELDS {
            return Err(FrameError::FieldCount {
                expected: IMU_FIELDS,
                actual: fields.len(),
            });
        }
        let imu = fields[0]
            .parse::<u8>()
            .map_err(|_| FrameError::InvalidField {
                index: 0,
                value: fields[0].to_string(),
            })?;
        let raw = parse_values::<6>(&fields[1..], 1)?;
        verify(received, &raw)?;

        let f = &self.format;
        Ok(Frame::Imu(ImuSample {
            imu,
            timestamp: received_at,
            accel: Vec3::new(
                f.accel_from_raw(raw[0]),
                f.accel_from_raw(raw[1]),
                f.accel_from_raw(raw[2]),
            ),
            gyro: Vec3::new(
                f.gyro_from_raw(raw[3]),
                f.gyro_from_raw(raw[4]),
                f.gyro_from_raw(raw[5]),
            ),
        }))
    }

    /// Wire form of a frame, newline included.
    pub fn encode(&self, frame: &Frame) -> String {
        let f = &self.format;
        match frame {
            Frame::Imu(s) => {
                let raw = [
                    f.accel_to_raw(s.accel.x),
                    f.accel_to_raw(s.accel.y),
                    f.accel_to_raw(s.accel.z),
                    f.gyro_to_raw(s.gyro.x),
                    f.gyro_to_raw(s.gyro.y),
                    f.gyro_to_raw(s.gyro.z),
                ];
                self.encode_raw_imu(s.imu, &raw)
            }
            Frame::Servo(s) => self.encode_servo(&s.angles),
        }
    }

    pub fn encode_raw_imu(&self, imu: u8, raw: &[i16; 6]) -> String {
        format!(
            "{}{},{}*{:02X}\n",
            self.format.imu_marker,
            imu,
            join(raw),
            checksum(raw)
        )
    }

    pub fn encode_servo(&self, angles: &[i16; 6]) -> String {
        format!(
            "{}{}*{:02X}\n",
            self.format.servo_marker,
            join(angles),
            checksum(angles)
        )
    }
}

fn parse_servo(fields: &[&str], received: u8, received_at: f64) -> Result<Frame, FrameError> {
    if fields.len() != SERVO_FIELDS {
        return Err(FrameError::FieldCount {
            expected: SERVO_FIELDS,
            actual: fields.len(),
        });
    }
    let angles = parse_values::<6>(fields, 0)?;
    verify(received, &angles)?;
    Ok(Frame::Servo(ServoAngles {
        timestamp: received_at,
        angles,
    }))
}

fn parse_values<const N: usize>(fields: &[&str], first_index: usize) -> Result<[i16; N], FrameError> {
    let mut out = [0i16; N];
    for (i, (slot, text)) in out.iter_mut().zip(fields).enumerate() {
        *slot = text.parse::<i16>().map_err(|_| FrameError::InvalidField {
            index: first_index + i,
            value: text.to_string(),
        })?;
    }
    Ok(out)
}

fn verify(received: u8, values: &[i16]) -> Result<(), FrameError> {
    let calculated = checksum(values);
    if received != calculated {
        return Err(FrameError::ChecksumMismatch {
            received,
            calculated,
        });
    }
    Ok(())
}

fn join(values: &[i16]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Lazy iterator over the frames completed by one `decode` call.
pub struct Decode<'a> {
    codec: &'a mut FrameCodec,
    received_at: f64,
}

impl Iterator for Decode<'_> {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.codec.next_frame(self.received_at)
    }
}
