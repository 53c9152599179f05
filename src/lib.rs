//! # h264-streamer
//!
//! Orchestration core of a hardware-accelerated H.264 frame encoder.
//!
//! GPU-resident frames come in through [`H264Encoder::feed`]; at most one
//! frame at a time is pushed through a device-side conversion graph and the
//! `h264_vaapi` encoder on a background task; encoded packets come back
//! through the callback registered at construction. Feeding, keyframe
//! requests and destruction never block the caller.
//!
//! ```no_run
//! use h264_streamer::{EncoderConfig, H264Encoder, fourcc};
//!
//! # fn demo() -> h264_streamer::Result<()> {
//! let config = EncoderConfig::new(1920, 1080, fourcc::DRM_FORMAT_XRGB8888);
//! let encoder = H264Encoder::new(config, |packet| {
//!     // hand packet.data to the transport layer
//!     let _ = packet;
//! })?;
//!
//! // feed Arc<GpuBuffer> frames as the compositor produces them
//! encoder.request_keyframe();
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod encoder;
pub mod error;
pub mod fourcc;
pub mod pipeline;
mod queue;

//
// Re-export
//
pub use buffer::{DmaBufPlane, FrameTransform, GpuBuffer};
pub use config::EncoderConfig;
pub use encoder::H264Encoder;
pub use error::{EncoderError, PipelineError, Result, UnsupportedFrameError};
pub use pipeline::{EncodePipeline, EncodedPacket, FrameRequest, ProcessOutcome};
pub use pipeline::vaapi::VaapiPipeline;
