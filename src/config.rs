//! Renderer configuration

use glam::Vec4;

use crate::atlas::PackingParams;
use crate::error::{GraphicsError, GraphicsResult};

/// Configuration for a [`RenderContext`](crate::RenderContext) and its
/// [`Renderer`](crate::Renderer).
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Depth of the frame pipeline
    pub frames_in_flight: u32,
    /// Clear color of the swapchain images
    pub clear_color: Vec4,
    /// Initial size of the shared staging stack, in bytes
    pub staging_size: u64,
    /// Capacity used for arrays whose descriptor asks for zero slots
    pub initial_array_capacity: u32,
    /// Default packing tolerances for new atlases
    pub atlas_packing: PackingParams,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            clear_color: Vec4::new(0.1, 0.1, 0.1, 1.0),
            staging_size: 10 * 1024 * 1024,
            initial_array_capacity: 16,
            atlas_packing: PackingParams::default(),
        }
    }
}

impl RendererConfig {
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_staging_size(mut self, bytes: u64) -> Self {
        self.staging_size = bytes;
        self
    }

    pub fn with_initial_array_capacity(mut self, capacity: u32) -> Self {
        self.initial_array_capacity = capacity;
        self
    }

    pub fn with_atlas_packing(mut self, params: PackingParams) -> Self {
        self.atlas_packing = params;
        self
    }

    pub fn validate(&self) -> GraphicsResult<()> {
        if self.frames_in_flight == 0 {
            return Err(GraphicsError::InvalidConfig(
                "frames_in_flight must be at least 1".into(),
            ));
        }
        if self.staging_size == 0 {
            return Err(GraphicsError::InvalidConfig(
                "staging_size must be non-zero".into(),
            ));
        }
        if self.initial_array_capacity == 0 {
            return Err(GraphicsError::InvalidConfig(
                "initial_array_capacity must be non-zero".into(),
            ));
        }
        let p = self.atlas_packing;
        if p.min_height_ratio.den == 0 || p.max_growth_ratio.den == 0 {
            return Err(GraphicsError::InvalidConfig(
                "atlas packing ratios need a non-zero denominator".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.staging_size, 10 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_frames_rejected() {
        let config = RendererConfig::default().with_frames_in_flight(0);
        assert!(matches!(
            config.validate(),
            Err(GraphicsError::InvalidConfig(_))
        ));
    }
}
