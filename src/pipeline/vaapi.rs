//! FFmpeg/VAAPI conversion + encode backend.
//!
//! Construction wires up, in order: DRM hardware device context → hardware
//! frames context (DRM PRIME over the negotiated software format) → filter
//! graph (`hwmap` into VAAPI, `scale_vaapi` to NV12) → `h264_vaapi` codec
//! session. Each stage is an RAII wrapper, so a failure at any step unwinds
//! the stages already built, and dropping the pipeline releases everything
//! in reverse dependency order.

use super::drm_frame;
use super::{EncodePipeline, EncodedPacket, FrameRequest, ProcessOutcome};
use crate::config::EncoderConfig;
use crate::device;
use crate::error::{EncoderError, PipelineError};
use crate::fourcc::*;
use bytes::Bytes;
use ffmpeg_sys_next::{
    AV_BUFFERSRC_FLAG_KEEP_REF, AV_ERROR_MAX_STRING_SIZE, AVBufferRef, AVCodecContext, AVERROR,
    AVFilterContext, AVFilterGraph, AVFrame, AVHWFramesContext, AVHWDeviceType, AVPixelFormat,
    AVRational, EAGAIN, av_buffer_ref, av_buffer_unref, av_buffersink_get_frame,
    av_buffersink_get_hw_frames_ctx, av_buffersrc_add_frame_flags, av_buffersrc_parameters_alloc,
    av_buffersrc_parameters_set, av_free, av_hwdevice_ctx_create, av_hwframe_ctx_alloc,
    av_hwframe_ctx_init, av_strdup, av_strerror, avcodec_alloc_context3,
    avcodec_find_encoder_by_name, avcodec_free_context, avcodec_open2, avcodec_receive_packet,
    avcodec_send_frame, avfilter_get_by_name, avfilter_graph_alloc, avfilter_graph_config,
    avfilter_graph_create_filter, avfilter_graph_free, avfilter_graph_parse, avfilter_inout_alloc,
    avfilter_inout_free,
};
use libc::{c_char, c_int, c_void};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::null_mut;
use tracing::debug;

/// Fixed conversion graph: zero-copy map into VAAPI, then scale/convert to
/// NV12 on the device.
const FILTER_DESC: &CStr = c"hwmap=mode=direct:derive_device=vaapi,scale_vaapi=format=nv12:mode=fast";

/// open-h264 requires baseline profile, so we use constrained baseline.
const PROFILE_H264_CONSTRAINED_BASELINE: c_int = 578;

/// Safe wrapper around `av_strerror()`.
fn av_err2str(err: c_int) -> String {
    unsafe {
        let mut buffer = [0 as c_char; AV_ERROR_MAX_STRING_SIZE];
        av_strerror(err, buffer.as_mut_ptr(), AV_ERROR_MAX_STRING_SIZE);
        let c_str = CStr::from_ptr(buffer.as_ptr());
        match c_str.to_str() {
            Ok(s) => s.to_string(),
            Err(_) => format!("unknown error: {err}"),
        }
    }
}

fn init_error(stage: &'static str, err: c_int) -> EncoderError {
    EncoderError::Init {
        stage,
        reason: av_err2str(err),
    }
}

/// Map a DRM fourcc to the software pixel format FFmpeg sees behind the
/// DRM PRIME surface. Formats differing only in their alpha channel share a
/// mapping; the encoder ignores alpha.
pub(crate) fn drm_to_av_pixel_format(fourcc: u32) -> Option<AVPixelFormat> {
    match fourcc {
        DRM_FORMAT_XRGB8888 | DRM_FORMAT_ARGB8888 => Some(AVPixelFormat::AV_PIX_FMT_BGR0),
        DRM_FORMAT_XBGR8888 | DRM_FORMAT_ABGR8888 => Some(AVPixelFormat::AV_PIX_FMT_RGB0),
        DRM_FORMAT_RGBX8888 | DRM_FORMAT_RGBA8888 => Some(AVPixelFormat::AV_PIX_FMT_0BGR),
        DRM_FORMAT_BGRX8888 | DRM_FORMAT_BGRA8888 => Some(AVPixelFormat::AV_PIX_FMT_0RGB),
        DRM_FORMAT_XRGB2101010 | DRM_FORMAT_ARGB2101010 => {
            Some(AVPixelFormat::AV_PIX_FMT_X2RGB10LE)
        }
        DRM_FORMAT_BGRX1010102 | DRM_FORMAT_BGRA1010102 => {
            Some(AVPixelFormat::AV_PIX_FMT_X2RGB10BE)
        }
        _ => None,
    }
}

struct HwDeviceCtx {
    inner: *mut AVBufferRef,
}

unsafe impl Send for HwDeviceCtx {}

impl HwDeviceCtx {
    fn create(node: &Path) -> Result<Self, EncoderError> {
        let node = CString::new(node.as_os_str().as_bytes()).map_err(|_| EncoderError::Init {
            stage: "hardware device context",
            reason: "render node path contains a NUL byte".into(),
        })?;

        let mut inner = null_mut();
        let rc = unsafe {
            av_hwdevice_ctx_create(
                &mut inner,
                AVHWDeviceType::AV_HWDEVICE_TYPE_DRM,
                node.as_ptr(),
                null_mut(),
                0,
            )
        };
        if rc != 0 {
            return Err(init_error("hardware device context", rc));
        }
        Ok(Self { inner })
    }

    fn as_mut_ptr(&self) -> *mut AVBufferRef {
        self.inner
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.inner);
        }
    }
}

struct HwFramesCtx {
    inner: *mut AVBufferRef,
}

unsafe impl Send for HwFramesCtx {}

impl HwFramesCtx {
    fn create(
        device: &HwDeviceCtx,
        sw_format: AVPixelFormat,
        width: u32,
        height: u32,
    ) -> Result<Self, EncoderError> {
        let inner = unsafe { av_hwframe_ctx_alloc(device.as_mut_ptr()) };
        if inner.is_null() {
            return Err(EncoderError::Init {
                stage: "hardware frames context",
                reason: "allocation failed".into(),
            });
        }
        let this = Self { inner };

        let rc = unsafe {
            let ctx = (*this.inner).data as *mut AVHWFramesContext;
            (*ctx).format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME;
            (*ctx).sw_format = sw_format;
            (*ctx).width = width as c_int;
            (*ctx).height = height as c_int;
            av_hwframe_ctx_init(this.inner)
        };
        if rc < 0 {
            return Err(init_error("hardware frames context", rc));
        }
        Ok(this)
    }

    fn as_mut_ptr(&self) -> *mut AVBufferRef {
        self.inner
    }
}

impl Drop for HwFramesCtx {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.inner);
        }
    }
}

struct FilterGraphCtx {
    graph: *mut AVFilterGraph,
    src: *mut AVFilterContext,
    sink: *mut AVFilterContext,
}

unsafe impl Send for FilterGraphCtx {}

impl FilterGraphCtx {
    fn build(
        device: &HwDeviceCtx,
        frames: &HwFramesCtx,
        width: u32,
        height: u32,
        time_base: AVRational,
        sample_aspect_ratio: AVRational,
    ) -> Result<Self, EncoderError> {
        let graph = unsafe { avfilter_graph_alloc() };
        if graph.is_null() {
            return Err(EncoderError::Init {
                stage: "filter graph",
                reason: "allocation failed".into(),
            });
        }
        let mut this = Self {
            graph,
            src: null_mut(),
            sink: null_mut(),
        };

        this.init_buffersrc(frames, width, height, time_base, sample_aspect_ratio)?;
        this.init_buffersink()?;
        this.parse_and_configure(device)?;
        Ok(this)
    }

    fn init_buffersrc(
        &mut self,
        frames: &HwFramesCtx,
        width: u32,
        height: u32,
        time_base: AVRational,
        sample_aspect_ratio: AVRational,
    ) -> Result<(), EncoderError> {
        unsafe {
            // Placeholder args pacify input checking; the real values are
            // set through the parameters struct below.
            let rc = avfilter_graph_create_filter(
                &mut self.src,
                avfilter_get_by_name(c"buffer".as_ptr()),
                c"in".as_ptr(),
                c"width=1:height=1:pix_fmt=drm_prime:time_base=1/1".as_ptr(),
                null_mut(),
                self.graph,
            );
            if rc != 0 {
                return Err(init_error("filter graph source", rc));
            }

            let params = av_buffersrc_parameters_alloc();
            if params.is_null() {
                return Err(EncoderError::Init {
                    stage: "filter graph source",
                    reason: "parameter allocation failed".into(),
                });
            }
            (*params).format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME as c_int;
            (*params).width = width as c_int;
            (*params).height = height as c_int;
            (*params).sample_aspect_ratio = sample_aspect_ratio;
            (*params).time_base = time_base;
            (*params).hw_frames_ctx = frames.as_mut_ptr();

            let rc = av_buffersrc_parameters_set(self.src, params);
            av_free(params as *mut c_void);
            if rc != 0 {
                return Err(init_error("filter graph source", rc));
            }
        }
        Ok(())
    }

    fn init_buffersink(&mut self) -> Result<(), EncoderError> {
        let rc = unsafe {
            avfilter_graph_create_filter(
                &mut self.sink,
                avfilter_get_by_name(c"buffersink".as_ptr()),
                c"out".as_ptr(),
                null_mut(),
                null_mut(),
                self.graph,
            )
        };
        if rc != 0 {
            return Err(init_error("filter graph sink", rc));
        }
        Ok(())
    }

    fn parse_and_configure(&mut self, device: &HwDeviceCtx) -> Result<(), EncoderError> {
        unsafe {
            let mut inputs = avfilter_inout_alloc();
            if inputs.is_null() {
                return Err(EncoderError::Init {
                    stage: "filter graph parse",
                    reason: "inout allocation failed".into(),
                });
            }
            (*inputs).name = av_strdup(c"in".as_ptr());
            (*inputs).filter_ctx = self.src;
            (*inputs).pad_idx = 0;
            (*inputs).next = null_mut();

            let outputs = avfilter_inout_alloc();
            if outputs.is_null() {
                avfilter_inout_free(&mut inputs);
                return Err(EncoderError::Init {
                    stage: "filter graph parse",
                    reason: "inout allocation failed".into(),
                });
            }
            (*outputs).name = av_strdup(c"out".as_ptr());
            (*outputs).filter_ctx = self.sink;
            (*outputs).pad_idx = 0;
            (*outputs).next = null_mut();

            // `avfilter_graph_parse` owns and frees both inout lists.
            let rc = avfilter_graph_parse(self.graph, FILTER_DESC.as_ptr(), outputs, inputs, null_mut());
            if rc != 0 {
                return Err(init_error("filter graph parse", rc));
            }

            for i in 0..(*self.graph).nb_filters as usize {
                let filter = *(*self.graph).filters.add(i);
                (*filter).hw_device_ctx = av_buffer_ref(device.as_mut_ptr());
            }

            let rc = avfilter_graph_config(self.graph, null_mut());
            if rc != 0 {
                return Err(init_error("filter graph configuration", rc));
            }
        }
        Ok(())
    }
}

impl Drop for FilterGraphCtx {
    fn drop(&mut self) {
        unsafe {
            avfilter_graph_free(&mut self.graph);
        }
    }
}

struct CodecCtx {
    inner: *mut AVCodecContext,
}

unsafe impl Send for CodecCtx {}

impl CodecCtx {
    fn open(
        sink: *mut AVFilterContext,
        width: u32,
        height: u32,
        time_base: AVRational,
        sample_aspect_ratio: AVRational,
    ) -> Result<Self, EncoderError> {
        let codec = unsafe { avcodec_find_encoder_by_name(c"h264_vaapi".as_ptr()) };
        if codec.is_null() {
            return Err(EncoderError::Init {
                stage: "find h264_vaapi encoder",
                reason: "encoder not available in this FFmpeg build".into(),
            });
        }

        let inner = unsafe { avcodec_alloc_context3(codec) };
        if inner.is_null() {
            return Err(EncoderError::Init {
                stage: "codec context",
                reason: "allocation failed".into(),
            });
        }
        let this = Self { inner };

        unsafe {
            let c = this.inner;
            (*c).width = width as c_int;
            (*c).height = height as c_int;
            (*c).time_base = time_base;
            (*c).sample_aspect_ratio = sample_aspect_ratio;
            (*c).pix_fmt = AVPixelFormat::AV_PIX_FMT_VAAPI;
            (*c).gop_size = c_int::MAX; // key frames are selected by the caller
            (*c).max_b_frames = 0; // B-frames are bad for latency
            (*c).profile = PROFILE_H264_CONSTRAINED_BASELINE;

            // Encode from the frames the conversion graph produces.
            (*c).hw_frames_ctx = av_buffer_ref(av_buffersink_get_hw_frames_ctx(sink));
            if (*c).hw_frames_ctx.is_null() {
                return Err(EncoderError::Init {
                    stage: "codec context",
                    reason: "hardware frames context reference failed".into(),
                });
            }

            let rc = avcodec_open2(c, codec, null_mut());
            if rc != 0 {
                return Err(init_error("open codec", rc));
            }
        }
        Ok(this)
    }

    fn as_mut_ptr(&self) -> *mut AVCodecContext {
        self.inner
    }
}

impl Drop for CodecCtx {
    fn drop(&mut self) {
        unsafe {
            avcodec_free_context(&mut self.inner);
        }
    }
}

/// The production conversion + encode backend.
///
/// Field order is the teardown order: codec session before filter graph
/// before frames context before device context.
pub struct VaapiPipeline {
    codec: CodecCtx,
    filter: FilterGraphCtx,
    hw_frames: HwFramesCtx,
    // Kept alive for every context derived from it; dropped last.
    _hw_device: HwDeviceCtx,
    sample_aspect_ratio: AVRational,
    time_base: AVRational,
}

// The scheduler moves the pipeline into at most one background task at a
// time; the raw FFmpeg pointers are never aliased across threads.
unsafe impl Send for VaapiPipeline {}

impl VaapiPipeline {
    pub fn new(config: &EncoderConfig) -> Result<Self, EncoderError> {
        ffmpeg_next::init().map_err(|err| EncoderError::Init {
            stage: "ffmpeg init",
            reason: err.to_string(),
        })?;

        let sw_format = drm_to_av_pixel_format(config.fourcc)
            .ok_or(EncoderError::UnsupportedPixelFormat(config.fourcc))?;
        let node = device::find_render_node().ok_or(EncoderError::NoDeviceFound)?;
        let time_base = AVRational {
            num: config.time_base.0,
            den: config.time_base.1,
        };
        let sample_aspect_ratio = AVRational {
            num: config.sample_aspect_ratio.0,
            den: config.sample_aspect_ratio.1,
        };

        let hw_device = HwDeviceCtx::create(&node)?;
        let hw_frames = HwFramesCtx::create(&hw_device, sw_format, config.width, config.height)?;
        let filter = FilterGraphCtx::build(
            &hw_device,
            &hw_frames,
            config.width,
            config.height,
            time_base,
            sample_aspect_ratio,
        )?;
        let codec = CodecCtx::open(
            filter.sink,
            config.width,
            config.height,
            time_base,
            sample_aspect_ratio,
        )?;

        debug!(
            node = %node.display(),
            width = config.width,
            height = config.height,
            "vaapi pipeline ready"
        );

        Ok(Self {
            codec,
            filter,
            hw_frames,
            _hw_device: hw_device,
            sample_aspect_ratio,
            time_base,
        })
    }
}

impl EncodePipeline for VaapiPipeline {
    fn process(&mut self, request: &FrameRequest) -> Result<ProcessOutcome, PipelineError> {
        let frame = drm_frame::export_frame(
            &request.buffer,
            self.hw_frames.as_mut_ptr(),
            self.sample_aspect_ratio,
            self.time_base,
            request.keyframe,
        )?;

        unsafe {
            let rc = av_buffersrc_add_frame_flags(
                self.filter.src,
                frame.as_ptr() as *mut AVFrame,
                AV_BUFFERSRC_FLAG_KEEP_REF as c_int,
            );
            if rc < 0 {
                return Err(PipelineError::Filter(format!(
                    "buffersrc rejected frame: {}",
                    av_err2str(rc)
                )));
            }

            let mut filtered = ffmpeg_next::Frame::empty();
            if filtered.as_ptr().is_null() {
                return Err(PipelineError::Filter("frame allocation failed".into()));
            }

            let rc = av_buffersink_get_frame(self.filter.sink, filtered.as_mut_ptr());
            if rc < 0 {
                return Err(PipelineError::Filter(format!(
                    "buffersink produced no frame: {}",
                    av_err2str(rc)
                )));
            }

            let rc = avcodec_send_frame(self.codec.as_mut_ptr(), filtered.as_ptr());
            if rc < 0 {
                return Err(PipelineError::Encode(format!(
                    "send_frame: {}",
                    av_err2str(rc)
                )));
            }

            let mut packet = ffmpeg_next::Packet::empty();
            let rc = avcodec_receive_packet(self.codec.as_mut_ptr(), packet.as_mut_ptr());
            if rc == AVERROR(EAGAIN) {
                return Ok(ProcessOutcome::NeedMore);
            }
            if rc < 0 {
                return Err(PipelineError::Encode(format!(
                    "receive_packet: {}",
                    av_err2str(rc)
                )));
            }

            let data = Bytes::copy_from_slice(packet.data().unwrap_or_default());
            Ok(ProcessOutcome::Packet(EncodedPacket {
                data,
                keyframe: packet.is_key(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_every_negotiable_fourcc() {
        let mapped = [
            (DRM_FORMAT_XRGB8888, AVPixelFormat::AV_PIX_FMT_BGR0),
            (DRM_FORMAT_ARGB8888, AVPixelFormat::AV_PIX_FMT_BGR0),
            (DRM_FORMAT_XBGR8888, AVPixelFormat::AV_PIX_FMT_RGB0),
            (DRM_FORMAT_ABGR8888, AVPixelFormat::AV_PIX_FMT_RGB0),
            (DRM_FORMAT_RGBX8888, AVPixelFormat::AV_PIX_FMT_0BGR),
            (DRM_FORMAT_RGBA8888, AVPixelFormat::AV_PIX_FMT_0BGR),
            (DRM_FORMAT_BGRX8888, AVPixelFormat::AV_PIX_FMT_0RGB),
            (DRM_FORMAT_BGRA8888, AVPixelFormat::AV_PIX_FMT_0RGB),
            (DRM_FORMAT_XRGB2101010, AVPixelFormat::AV_PIX_FMT_X2RGB10LE),
            (DRM_FORMAT_ARGB2101010, AVPixelFormat::AV_PIX_FMT_X2RGB10LE),
            (DRM_FORMAT_BGRX1010102, AVPixelFormat::AV_PIX_FMT_X2RGB10BE),
            (DRM_FORMAT_BGRA1010102, AVPixelFormat::AV_PIX_FMT_X2RGB10BE),
        ];
        for (fourcc, format) in mapped {
            assert_eq!(drm_to_av_pixel_format(fourcc), Some(format));
        }
    }

    #[test]
    fn rejects_unknown_fourcc() {
        // NV12 has no RGB mapping here; producers hand us RGB scanout buffers.
        let nv12 = u32::from_le_bytes(*b"NV12");
        assert_eq!(drm_to_av_pixel_format(nv12), None);
    }
}
