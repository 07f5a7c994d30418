use crate::error::{Result, SyncError};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::f32::consts::{PI, TAU};

/// Fixed-point units per world unit (1 unit = 1 metre, stored as millimetres).
pub const POSITION_SCALE: f64 = 1000.0;

/// Largest encodable absolute coordinate, in world units.
pub const MAX_COORDINATE: f32 = 2_000_000.0;

const ROTATION_STEPS: f32 = 65536.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompactVector(pub [i32; 3]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompactRotation(pub u16);

pub fn encode_vector(v: Vec3) -> Result<CompactVector> {
    Ok(CompactVector([
        encode_axis(v.x, "x")?,
        encode_axis(v.y, "y")?,
        encode_axis(v.z, "z")?,
    ]))
}

fn encode_axis(value: f32, axis: &str) -> Result<i32> {
    if !value.is_finite() {
        return Err(SyncError::InvalidInput(format!(
            "non-finite {} coordinate: {}",
            axis, value
        )));
    }

    if value.abs() > MAX_COORDINATE {
        return Err(SyncError::InvalidInput(format!(
            "{} coordinate {} outside encodable range ±{}",
            axis, value, MAX_COORDINATE
        )));
    }

    Ok((value as f64 * POSITION_SCALE).round() as i32)
}

pub fn decode_vector(compact: CompactVector) -> Vec3 {
    let [x, y, z] = compact.0;
    Vec3::new(decode_axis(x), decode_axis(y), decode_axis(z))
}

fn decode_axis(value: i32) -> f32 {
    (value as f64 / POSITION_SCALE) as f32
}

pub fn encode_rotation(yaw: f32) -> Result<CompactRotation> {
    if !yaw.is_finite() {
        return Err(SyncError::InvalidInput(format!("non-finite yaw: {}", yaw)));
    }

    let turn = yaw.rem_euclid(TAU) / TAU;
    let steps = (turn * ROTATION_STEPS).round() as u32 % ROTATION_STEPS as u32;
    Ok(CompactRotation(steps as u16))
}

/// Returns the yaw in radians, normalized into (-π, π].
pub fn decode_rotation(compact: CompactRotation) -> f32 {
    let yaw = compact.0 as f32 / ROTATION_STEPS * TAU;
    if yaw > PI {
        yaw - TAU
    } else {
        yaw
    }
}
