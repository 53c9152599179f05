//! Error types of the encoder core.
//!
//! Construction and admission failures surface synchronously through
//! [`EncoderError`]. Per-frame pipeline failures are [`PipelineError`]s;
//! they never reach the caller: the affected frame is dropped and the
//! scheduler moves on to the next queued frame.

use crate::buffer::FrameTransform;
use std::result;

/// Result type of all h264-streamer library calls.
pub type Result<T, E = EncoderError> = result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum EncoderError {
    #[error("no DRM render node available")]
    NoDeviceFound,

    #[error("no FFmpeg pixel format mapping for DRM fourcc {0:#010x}")]
    UnsupportedPixelFormat(u32),

    #[error("unsupported frame: {0}")]
    UnsupportedFrame(#[from] UnsupportedFrameError),

    #[error("encoder construction failed at {stage}: {reason}")]
    Init {
        /// Construction stage that failed.
        stage: &'static str,
        /// Underlying failure, usually an `av_err2str` rendering.
        reason: String,
    },

    #[error("encoder has been destroyed")]
    Destroyed,
}

/// Reasons a buffer can be rejected at admission.
#[derive(thiserror::Error, Debug)]
pub enum UnsupportedFrameError {
    #[error("transform {0:?} does not match the negotiated normal orientation")]
    Transform(FrameTransform),

    #[error("fourcc {got:#010x} does not match the negotiated {negotiated:#010x}")]
    PixelFormat { got: u32, negotiated: u32 },

    #[error("buffer carries no DMA-BUF planes")]
    NoPlanes,
}

/// Per-frame failures inside the background conversion/encode cycle.
///
/// These are recovered locally: logged, the frame dropped, the pipeline
/// kept alive for the next frame.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("DMA-BUF export failed: {0}")]
    ExportFailed(String),

    #[error("filter graph error: {0}")]
    Filter(String),

    #[error("encode error: {0}")]
    Encode(String),
}
