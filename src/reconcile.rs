use crate::error::{Result, SyncError};
use crate::snapshot::AvatarPose;
use glam::Vec3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileConfig {
    /// Squared distance beyond which the local avatar is snapped instead of blended.
    pub snap_threshold_sq: f32,
    /// Fraction of the remaining error removed per correction.
    pub blend_factor: f32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            snap_threshold_sq: 9.0,
            blend_factor: 0.2,
        }
    }
}

impl ReconcileConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snap_threshold_sq(mut self, threshold: f32) -> Self {
        self.snap_threshold_sq = threshold;
        self
    }

    pub fn with_blend_factor(mut self, factor: f32) -> Self {
        self.blend_factor = factor;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    Snapped,
    Blended,
}

#[derive(Debug, Clone, Default)]
pub struct StateReconciler {
    config: ReconcileConfig,
}

impl StateReconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    /// Moves `local` toward the authoritative pose. On error `local` is left
    /// untouched.
    pub fn reconcile(
        &self,
        local: &mut AvatarPose,
        authoritative: Vec3,
        authoritative_yaw: Option<f32>,
        full_sync: bool,
    ) -> Result<Correction> {
        if authoritative.is_nan() {
            return Err(SyncError::MalformedSnapshot(format!(
                "authoritative position {} is NaN",
                authoritative
            )));
        }

        let delta = authoritative - local.position;
        let distance_sq = delta.length_squared();

        let (position, correction) = if full_sync || distance_sq > self.config.snap_threshold_sq {
            (authoritative, Correction::Snapped)
        } else {
            (local.position + delta * self.config.blend_factor, Correction::Blended)
        };

        if position.is_nan() {
            return Err(SyncError::MalformedSnapshot(format!(
                "reconciled position {} is NaN",
                position
            )));
        }

        local.position = position;
        if let Some(yaw) = authoritative_yaw.filter(|yaw| yaw.is_finite()) {
            local.yaw = yaw;
        }

        Ok(correction)
    }

    pub fn get_config(&self) -> &ReconcileConfig {
        &self.config
    }
}
