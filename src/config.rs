//! Encoder session configuration.

use serde::{Deserialize, Serialize};

/// Construction-time parameters of an encoder session.
///
/// Geometry and pixel format are negotiated once; every frame fed later has
/// to match them. The defaults mirror a low-latency streaming setup:
/// microsecond time base, square pixels, keyframes only on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Frame width in pixels.
    pub width: u32,

    /// Frame height in pixels.
    pub height: u32,

    /// DRM fourcc of the frames the producer will feed (see [`crate::fourcc`]).
    pub fourcc: u32,

    /// Time base as (numerator, denominator).
    #[serde(default = "default_time_base")]
    pub time_base: (i32, i32),

    /// Sample aspect ratio as (numerator, denominator).
    #[serde(default = "default_sample_aspect_ratio")]
    pub sample_aspect_ratio: (i32, i32),
}

impl EncoderConfig {
    pub fn new(width: u32, height: u32, fourcc: u32) -> Self {
        Self {
            width,
            height,
            fourcc,
            ..Self::default()
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fourcc: 0,
            time_base: default_time_base(),
            sample_aspect_ratio: default_sample_aspect_ratio(),
        }
    }
}

fn default_time_base() -> (i32, i32) {
    (1, 1_000_000)
}

fn default_sample_aspect_ratio() -> (i32, i32) {
    (1, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc::DRM_FORMAT_XRGB8888;

    #[test]
    fn new_applies_streaming_defaults() {
        let config = EncoderConfig::new(1920, 1080, DRM_FORMAT_XRGB8888);
        assert_eq!(config.time_base, (1, 1_000_000));
        assert_eq!(config.sample_aspect_ratio, (1, 1));
    }
}
