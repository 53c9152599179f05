//! Zero-copy export of a [`GpuBuffer`] into an FFmpeg DRM PRIME frame.
//!
//! No pixel data is copied: the frame carries an `AVDRMFrameDescriptor`
//! referencing duplicated DMA-BUF fds. The descriptor's free callback,
//! registered at export time, closes every duplicated fd exactly once when
//! the frame's reference count reaches zero.

use crate::buffer::GpuBuffer;
use crate::error::PipelineError;
use ffmpeg_sys_next::{
    AV_FRAME_FLAG_KEY, AVBufferRef, AVDRMFrameDescriptor, AVPictureType, AVPixelFormat,
    AVRational, av_buffer_create, av_buffer_ref,
};
use libc::{c_int, c_void};
use std::mem;
use std::ptr::null_mut;

/// Free callback for the DRM frame descriptor buffer.
///
/// Owns the descriptor allocation and the duplicated plane fds.
unsafe extern "C" fn drm_frame_desc_free(_opaque: *mut c_void, data: *mut u8) {
    unsafe {
        let desc = Box::from_raw(data as *mut AVDRMFrameDescriptor);
        for object in desc.objects.iter().take(desc.nb_objects as usize) {
            libc::close(object.fd);
        }
    }
}

/// Build an `AV_PIX_FMT_DRM_PRIME` frame over the buffer's planes.
///
/// `hw_frames_ctx` is the session's frame-pool context; the exported frame
/// takes its own reference to it.
pub(super) fn export_frame(
    buffer: &GpuBuffer,
    hw_frames_ctx: *mut AVBufferRef,
    sample_aspect_ratio: AVRational,
    time_base: AVRational,
    keyframe: bool,
) -> Result<ffmpeg_next::Frame, PipelineError> {
    let planes = buffer.planes();
    let mut desc: Box<AVDRMFrameDescriptor> = Box::new(unsafe { mem::zeroed() });

    desc.nb_objects = planes.len() as c_int;
    desc.nb_layers = 1;
    desc.layers[0].format = buffer.fourcc();
    desc.layers[0].nb_planes = planes.len() as c_int;

    for (i, plane) in planes.iter().enumerate() {
        let fd = unsafe { libc::dup(plane.fd) };
        if fd < 0 {
            for object in desc.objects.iter().take(i) {
                unsafe { libc::close(object.fd) };
            }
            return Err(PipelineError::ExportFailed(format!(
                "dup of plane {i} fd {} failed",
                plane.fd
            )));
        }

        desc.objects[i].fd = fd;
        desc.objects[i].size = plane.stride as usize * buffer.height() as usize;
        desc.objects[i].format_modifier = plane.modifier;

        desc.layers[0].planes[i].object_index = i as c_int;
        desc.layers[0].planes[i].offset = plane.offset as isize;
        desc.layers[0].planes[i].pitch = plane.stride as isize;
    }

    let mut frame = unsafe { ffmpeg_next::Frame::empty() };
    if frame.as_ptr().is_null() {
        unsafe { drm_frame_desc_free(null_mut(), Box::into_raw(desc) as *mut u8) };
        return Err(PipelineError::ExportFailed("frame allocation failed".into()));
    }

    unsafe {
        let desc_ptr = Box::into_raw(desc) as *mut u8;
        let desc_ref = av_buffer_create(
            desc_ptr,
            mem::size_of::<AVDRMFrameDescriptor>(),
            Some(drm_frame_desc_free),
            null_mut(),
            0,
        );
        if desc_ref.is_null() {
            drm_frame_desc_free(null_mut(), desc_ptr);
            return Err(PipelineError::ExportFailed(
                "descriptor buffer allocation failed".into(),
            ));
        }

        let raw = frame.as_mut_ptr();
        (*raw).width = buffer.width() as c_int;
        (*raw).height = buffer.height() as c_int;
        (*raw).format = AVPixelFormat::AV_PIX_FMT_DRM_PRIME as c_int;
        (*raw).sample_aspect_ratio = sample_aspect_ratio;
        (*raw).time_base = time_base;
        (*raw).buf[0] = desc_ref;
        (*raw).data[0] = (*desc_ref).data;

        (*raw).hw_frames_ctx = av_buffer_ref(hw_frames_ctx);
        if (*raw).hw_frames_ctx.is_null() {
            // frame drop unrefs desc_ref and closes the fds
            return Err(PipelineError::ExportFailed(
                "hw frames context reference failed".into(),
            ));
        }

        if keyframe {
            (*raw).flags |= AV_FRAME_FLAG_KEY as c_int;
            (*raw).pict_type = AVPictureType::AV_PICTURE_TYPE_I;
        } else {
            (*raw).flags &= !(AV_FRAME_FLAG_KEY as c_int);
            (*raw).pict_type = AVPictureType::AV_PICTURE_TYPE_P;
        }
    }

    Ok(frame)
}
