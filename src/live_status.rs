use serde::{Deserialize, Serialize};
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::pipeline::Snapshot;

#[derive(Serialize, Deserialize, Clone)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub status: String,
    pub connected: bool,
    // Link counters
    pub bytes_read: u64,
    pub frames: u64,
    pub frame_errors: u64,
    pub queue_drops: u64,
    pub ignored_frames: u64,
    // Pairing
    pub paired: u64,
    pub pairing_drop_rate: f64,
    pub pairing_degraded: bool,
    // Health monitoring
    pub imu1_healthy: bool,
    pub imu2_healthy: bool,
    pub servo_healthy: bool,
    pub imu1_silence_duration_secs: f64,
    pub imu2_silence_duration_secs: f64,
    pub servo_silence_duration_secs: f64,
    // Platform
    pub gravity: [f64; 3],
    pub gravity_scale: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub ball_x: f64,
    pub ball_y: f64,
    pub ball_speed: f64,
    pub bounces: u64,
}

impl LiveStatus {
    pub fn from_snapshot(snapshot: &Snapshot, uptime_seconds: u64) -> Self {
        let health = &snapshot.health;
        let gravity = snapshot.gravity.as_vec3();
        Self {
            timestamp: current_timestamp(),
            uptime_seconds,
            status: snapshot.status_text.clone(),
            connected: snapshot.connection.is_connected(),
            bytes_read: snapshot.link.bytes_read,
            frames: snapshot.link.frames,
            frame_errors: snapshot.link.frame_errors,
            queue_drops: snapshot.link.queue_drops,
            ignored_frames: snapshot.ignored_frames,
            paired: snapshot.pairing.paired,
            pairing_drop_rate: snapshot.pairing.drop_rate,
            pairing_degraded: snapshot.pairing.degraded,
            imu1_healthy: health.imu1.healthy,
            imu2_healthy: health.imu2.healthy,
            servo_healthy: health.servo.healthy,
            imu1_silence_duration_secs: health.imu1.silence_s,
            imu2_silence_duration_secs: health.imu2.silence_s,
            servo_silence_duration_secs: health.servo.silence_s,
            gravity: [gravity.x, gravity.y, gravity.z],
            gravity_scale: snapshot.gravity_scale,
            roll_deg: snapshot.tilt.roll_deg,
            pitch_deg: snapshot.tilt.pitch_deg,
            ball_x: snapshot.ball.position.x,
            ball_y: snapshot.ball.position.y,
            ball_speed: snapshot.ball.speed(),
            bounces: snapshot.bounces,
        }
    }

    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
