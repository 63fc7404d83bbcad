//! Simulated platform firmware.
//!
//! Emits the same text frames as the real board so the whole stack can run
//! without hardware: the platform rocks on two axes, IMU2 reads the same motion
//! plus a fixed bias, and servo angles follow the tilt.

use std::f64::consts::PI;
use std::io;

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::codec::{FrameCodec, FrameFormat};
use crate::connection::{BoxedTransport, PortOpener, SerialSettings};
use crate::types::Vec3;

const GRAVITY: f64 = 9.81; // m/s²

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub imu_rate_hz: f64,
    pub servo_rate_hz: f64,
    pub tilt_amplitude_deg: f64,
    pub tilt_period_s: f64,
    /// Added to IMU2's accelerometer, m/s²
    pub imu2_accel_bias: [f64; 3],
    /// Added to IMU2's gyro, rad/s
    pub imu2_gyro_bias: [f64; 3],
    /// Corrupt the checksum of every Nth line (0 = never)
    pub corrupt_every: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            imu_rate_hz: 100.0,
            servo_rate_hz: 10.0,
            tilt_amplitude_deg: 15.0,
            tilt_period_s: 6.0,
            imu2_accel_bias: [0.02, -0.03, 0.05],
            imu2_gyro_bias: [0.001, 0.0, -0.002],
            corrupt_every: 0,
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.imu_rate_hz > 0.0 && self.imu_rate_hz <= 2000.0) {
            return Err(format!("simulator IMU rate out of range: {}", self.imu_rate_hz));
        }
        if !(self.servo_rate_hz >= 0.0 && self.servo_rate_hz <= self.imu_rate_hz) {
            return Err(format!(
                "simulator servo rate must be in [0, {}], got {}",
                self.imu_rate_hz, self.servo_rate_hz
            ));
        }
        if !(self.tilt_period_s > 0.0) {
            return Err(format!("tilt period must be positive, got {}", self.tilt_period_s));
        }
        Ok(())
    }
}

pub struct SimulatedPlatform {
    config: SimulatorConfig,
    codec: FrameCodec,
    step: u64,
    lines: u64,
}

impl SimulatedPlatform {
    pub fn new(config: SimulatorConfig, format: FrameFormat) -> Self {
        Self {
            config,
            codec: FrameCodec::new(format),
            step: 0,
            lines: 0,
        }
    }

    /// Roll and pitch in radians at time `t`.
    pub fn attitude(&self, t: f64) -> (f64, f64) {
        let amp = self.config.tilt_amplitude_deg.to_radians();
        let w = 2.0 * PI / self.config.tilt_period_s;
        ((w * t).sin() * amp, (w * t * 0.7).cos() * amp * 0.6)
    }

    /// Accelerometer (m/s²) and gyro (rad/s) of the platform IMU at time `t`.
    pub fn motion(&self, t: f64) -> (Vec3, Vec3) {
        let (roll, pitch) = self.attitude(t);
        // gravity rotated into the platform frame, so |accel| == g
        let accel = Vec3::new(
            GRAVITY * roll.sin() * pitch.cos(),
            GRAVITY * pitch.sin(),
            GRAVITY * roll.cos() * pitch.cos(),
        );

        let amp = self.config.tilt_amplitude_deg.to_radians();
        let w = 2.0 * PI / self.config.tilt_period_s;
        let gyro = Vec3::new(
            (w * t).cos() * amp * w,
            -(w * t * 0.7).sin() * amp * 0.6 * w * 0.7,
            0.0,
        );
        (accel, gyro)
    }

    fn raw(&self, accel: Vec3, gyro: Vec3) -> [i16; 6] {
        let f = self.codec.format();
        [
            f.accel_to_raw(accel.x),
            f.accel_to_raw(accel.y),
            f.accel_to_raw(accel.z),
            f.gyro_to_raw(gyro.x),
            f.gyro_to_raw(gyro.y),
            f.gyro_to_raw(gyro.z),
        ]
    }

    /// Lines for the next IMU period.
    pub fn next_lines(&mut self) -> Vec<String> {
        let t = self.step as f64 / self.config.imu_rate_hz;
        let (accel, gyro) = self.motion(t);
        let accel2 = accel + Vec3::from(self.config.imu2_accel_bias);
        let gyro2 = gyro + Vec3::from(self.config.imu2_gyro_bias);

        let mut lines = vec![
            self.codec.encode_raw_imu(1, &self.raw(accel, gyro)),
            self.codec.encode_raw_imu(2, &self.raw(accel2, gyro2)),
        ];

        if self.config.servo_rate_hz > 0.0 {
            let every = (self.config.imu_rate_hz / self.config.servo_rate_hz).round().max(1.0) as u64;
            if self.step % every == 0 {
                let (roll, pitch) = self.attitude(t);
                let (r, p) = (roll.to_degrees(), pitch.to_degrees());
                let angles = [r, -r, p, -p, r + p, r - p]
                    .map(|a| a.round().clamp(-90.0, 90.0) as i16);
                lines.push(self.codec.encode_servo(&angles));
            }
        }

        for line in lines.iter_mut() {
            self.lines += 1;
            if self.config.corrupt_every > 0 && self.lines % self.config.corrupt_every == 0 {
                corrupt_checksum(line);
            }
        }

        self.step += 1;
        lines
    }

    /// Write frames in real time until the sink closes.
    pub async fn run<W: AsyncWrite + Unpin>(mut self, mut sink: W) -> io::Result<()> {
        let mut ticker = interval(Duration::from_secs_f64(1.0 / self.config.imu_rate_hz));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let chunk: String = self.next_lines().concat();
            if let Err(e) = sink.write_all(chunk.as_bytes()).await {
                debug!("Simulator stopped after {} lines: {}", self.lines, e);
                return Err(e);
            }
        }
    }
}

fn corrupt_checksum(line: &mut String) {
    let Some(star) = line.rfind('*') else {
        return;
    };
    let at = star + 1;
    let replacement = if line.get(at..at + 1) == Some("0") { "1" } else { "0" };
    line.replace_range(at..at + 1, replacement);
}

/// `PortOpener` that answers every port name with a simulated board.
pub struct SimulatedPortOpener {
    config: SimulatorConfig,
    format: FrameFormat,
}

impl SimulatedPortOpener {
    pub fn new(config: SimulatorConfig, format: FrameFormat) -> Self {
        Self { config, format }
    }
}

impl PortOpener for SimulatedPortOpener {
    fn open(&self, port: &str, _settings: &SerialSettings) -> io::Result<BoxedTransport> {
        let (client, board) = tokio::io::duplex(16 * 1024);
        let platform = SimulatedPlatform::new(self.config.clone(), self.format.clone());
        debug!("Simulated board attached to {}", port);
        tokio::spawn(async move {
            // ends when the reader drops its end
            let _ = platform.run(board).await;
        });
        Ok(Box::new(client))
    }
}
