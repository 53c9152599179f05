//! Scheduler behavior tests driven through a scripted pipeline double.
//!
//! The FFmpeg/VAAPI backend needs real hardware, so these tests plug a
//! mock backend into `H264Encoder::with_pipeline` and observe ordering,
//! the single-slot invariant, keyframe latching, buffer holds and the
//! deferred-destroy protocol from the outside.

use bytes::Bytes;
use h264_streamer::{
    DmaBufPlane, EncodePipeline, EncodedPacket, EncoderConfig, EncoderError, FrameRequest,
    FrameTransform, GpuBuffer, H264Encoder, PipelineError, ProcessOutcome, fourcc,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy)]
enum Step {
    Packet,
    NeedMore,
    Fail,
}

/// Observable state shared between a `MockPipeline` and its test.
#[derive(Clone, Default)]
struct MockState {
    /// Reentrancy guard: true while a process call is running.
    active: Arc<AtomicBool>,
    /// Set if two process calls ever overlapped.
    overlapped: Arc<AtomicBool>,
    /// Number of process calls that have started.
    started: Arc<AtomicUsize>,
    /// (width tag, keyframe intent) per processed frame, in call order.
    processed: Arc<Mutex<Vec<(u32, bool)>>>,
    /// Set when the pipeline is dropped, i.e. session resources released.
    dropped: Arc<AtomicBool>,
}

struct MockPipeline {
    state: MockState,
    /// Outcome per call; calls beyond the script produce a packet.
    script: VecDeque<Step>,
    /// When present, every process call blocks until the test sends.
    gate: Option<mpsc::Receiver<()>>,
    delay: Option<Duration>,
}

impl MockPipeline {
    fn new(state: MockState) -> Self {
        Self {
            state,
            script: VecDeque::new(),
            gate: None,
            delay: None,
        }
    }

    fn scripted(state: MockState, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: steps.into_iter().collect(),
            ..Self::new(state)
        }
    }

    fn gated(state: MockState) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        let mut mock = Self::new(state);
        mock.gate = Some(rx);
        (mock, tx)
    }

    fn with_delay(state: MockState, delay: Duration) -> Self {
        let mut mock = Self::new(state);
        mock.delay = Some(delay);
        mock
    }
}

impl EncodePipeline for MockPipeline {
    fn process(&mut self, request: &FrameRequest) -> Result<ProcessOutcome, PipelineError> {
        if self.state.active.swap(true, Ordering::SeqCst) {
            self.state.overlapped.store(true, Ordering::SeqCst);
        }
        self.state.started.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.recv().ok();
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        self.state
            .processed
            .lock()
            .unwrap()
            .push((request.buffer.width(), request.keyframe));

        let step = self.script.pop_front().unwrap_or(Step::Packet);
        self.state.active.store(false, Ordering::SeqCst);
        match step {
            Step::Packet => Ok(ProcessOutcome::Packet(EncodedPacket {
                data: Bytes::from(vec![request.buffer.width() as u8]),
                keyframe: request.keyframe,
            })),
            Step::NeedMore => Ok(ProcessOutcome::NeedMore),
            Step::Fail => Err(PipelineError::Encode("scripted failure".into())),
        }
    }
}

impl Drop for MockPipeline {
    fn drop(&mut self) {
        self.state.dropped.store(true, Ordering::SeqCst);
    }
}

fn config() -> EncoderConfig {
    EncoderConfig::new(1920, 1080, fourcc::DRM_FORMAT_XRGB8888)
}

fn frame(width: u32) -> Arc<GpuBuffer> {
    Arc::new(GpuBuffer::new(
        width,
        1080,
        fourcc::DRM_FORMAT_XRGB8888,
        FrameTransform::Normal,
        vec![DmaBufPlane {
            fd: -1,
            stride: 4096,
            offset: 0,
            modifier: 0,
        }],
    ))
}

fn collecting_sink() -> (Arc<Mutex<Vec<EncodedPacket>>>, impl FnMut(EncodedPacket) + Send) {
    // Every test goes through here, so piggyback the log init.
    let _ = tracing_subscriber::fmt::try_init();
    let packets = Arc::new(Mutex::new(Vec::new()));
    let sink = packets.clone();
    (packets, move |packet| sink.lock().unwrap().push(packet))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn packets_delivered_in_admission_order() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let encoder = H264Encoder::with_pipeline(config(), MockPipeline::new(state.clone()), sink);

    let frames: Vec<_> = (1..=5).map(frame).collect();
    for buffer in &frames {
        encoder.feed(buffer.clone()).unwrap();
    }

    wait_until("all packets delivered", || packets.lock().unwrap().len() == 5).await;

    let tags: Vec<u8> = packets
        .lock()
        .unwrap()
        .iter()
        .map(|packet| packet.data[0])
        .collect();
    assert_eq!(tags, vec![1, 2, 3, 4, 5]);

    for buffer in &frames {
        assert!(!buffer.is_held(), "hold released after completion");
    }
}

#[tokio::test]
async fn at_most_one_encode_in_flight() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let mock = MockPipeline::with_delay(state.clone(), Duration::from_millis(5));
    let encoder = H264Encoder::with_pipeline(config(), mock, sink);

    // Burst feeds pile up in the queue while the slot is busy.
    for width in 1..=10 {
        encoder.feed(frame(width)).unwrap();
    }

    wait_until("burst drained", || packets.lock().unwrap().len() == 10).await;
    assert!(
        !state.overlapped.load(Ordering::SeqCst),
        "two encode cycles overlapped"
    );
}

#[tokio::test]
async fn keyframe_latch_governs_next_dequeued_frame_only() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let encoder = H264Encoder::with_pipeline(config(), MockPipeline::new(state.clone()), sink);

    // Drain between feeds: a request latches for the next frame *dequeued*,
    // so an in-flight or queued frame would absorb it instead.
    // The first frame of the stream is keyframed implicitly.
    encoder.feed(frame(1)).unwrap();
    wait_until("first packet", || packets.lock().unwrap().len() == 1).await;
    encoder.feed(frame(2)).unwrap();
    wait_until("second packet", || packets.lock().unwrap().len() == 2).await;

    encoder.request_keyframe();
    encoder.feed(frame(3)).unwrap();
    wait_until("third packet", || packets.lock().unwrap().len() == 3).await;
    encoder.feed(frame(4)).unwrap();
    wait_until("fourth packet", || packets.lock().unwrap().len() == 4).await;

    let intents: Vec<(u32, bool)> = state.processed.lock().unwrap().clone();
    assert_eq!(
        intents,
        vec![(1, true), (2, false), (3, true), (4, false)],
        "keyframe latch consumed by exactly the next dequeued frame"
    );

    let flags: Vec<bool> = packets.lock().unwrap().iter().map(|p| p.keyframe).collect();
    assert_eq!(flags, vec![true, false, true, false]);
}

#[tokio::test]
async fn destroy_while_in_flight_defers_release_and_muzzles_callback() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let (mock, gate) = MockPipeline::gated(state.clone());
    let encoder = H264Encoder::with_pipeline(config(), mock, sink);

    let buffer = frame(1);
    encoder.feed(buffer.clone()).unwrap();
    wait_until("encode started", || state.started.load(Ordering::SeqCst) == 1).await;

    encoder.destroy();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !state.dropped.load(Ordering::SeqCst),
        "resources must not be released while the frame is in flight"
    );
    assert!(buffer.is_held(), "hold kept until completion");

    // Let the in-flight encode finish; it would have produced a packet.
    gate.send(()).unwrap();
    wait_until("deferred teardown ran", || {
        state.dropped.load(Ordering::SeqCst)
    })
    .await;

    assert!(!buffer.is_held(), "hold released by the completion handler");
    assert!(
        packets.lock().unwrap().is_empty(),
        "no callback fires after destroy"
    );
}

#[tokio::test]
async fn destroy_while_idle_releases_immediately() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let encoder = H264Encoder::with_pipeline(config(), MockPipeline::new(state.clone()), sink);

    encoder.feed(frame(1)).unwrap();
    wait_until("one packet", || packets.lock().unwrap().len() == 1).await;

    encoder.destroy();
    wait_until("teardown ran", || state.dropped.load(Ordering::SeqCst)).await;
    assert_eq!(packets.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn mismatched_frames_are_rejected_without_queueing() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let encoder = H264Encoder::with_pipeline(config(), MockPipeline::new(state.clone()), sink);

    let rotated = Arc::new(GpuBuffer::new(
        1920,
        1080,
        fourcc::DRM_FORMAT_XRGB8888,
        FrameTransform::Rotated90,
        vec![DmaBufPlane {
            fd: -1,
            stride: 4096,
            offset: 0,
            modifier: 0,
        }],
    ));
    let err = encoder.feed(rotated.clone()).unwrap_err();
    assert!(matches!(err, EncoderError::UnsupportedFrame(_)));
    assert!(!rotated.is_held(), "rejected frames take no hold");

    let wrong_format = Arc::new(GpuBuffer::new(
        1920,
        1080,
        fourcc::DRM_FORMAT_ABGR8888,
        FrameTransform::Normal,
        vec![DmaBufPlane {
            fd: -1,
            stride: 4096,
            offset: 0,
            modifier: 0,
        }],
    ));
    let err = encoder.feed(wrong_format.clone()).unwrap_err();
    assert!(matches!(err, EncoderError::UnsupportedFrame(_)));
    assert!(!wrong_format.is_held());

    // The queue is unaffected: a valid frame still encodes as frame one.
    encoder.feed(frame(7)).unwrap();
    wait_until("valid frame encoded", || packets.lock().unwrap().len() == 1).await;
    assert_eq!(state.processed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn need_more_buffers_frame_without_delivery() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let mock = MockPipeline::scripted(
        state.clone(),
        [Step::NeedMore, Step::Packet, Step::Packet],
    );
    let encoder = H264Encoder::with_pipeline(config(), mock, sink);

    let frames: Vec<_> = (1..=3).map(frame).collect();
    for buffer in &frames {
        encoder.feed(buffer.clone()).unwrap();
    }

    wait_until("all frames processed", || {
        state.processed.lock().unwrap().len() == 3
    })
    .await;
    wait_until("later packets delivered", || packets.lock().unwrap().len() == 2).await;

    let tags: Vec<u8> = packets
        .lock()
        .unwrap()
        .iter()
        .map(|packet| packet.data[0])
        .collect();
    assert_eq!(tags, vec![2, 3], "buffered frame yields no packet, order kept");

    for buffer in &frames {
        assert!(!buffer.is_held(), "buffered frames still release their hold");
    }
}

#[tokio::test]
async fn pipeline_failure_drops_frame_and_continues() {
    let state = MockState::default();
    let (packets, sink) = collecting_sink();
    let mock = MockPipeline::scripted(state.clone(), [Step::Fail]);
    let encoder = H264Encoder::with_pipeline(config(), mock, sink);

    let first = frame(1);
    encoder.feed(first.clone()).unwrap();
    encoder.feed(frame(2)).unwrap();

    wait_until("second frame encoded", || packets.lock().unwrap().len() == 1).await;
    assert_eq!(packets.lock().unwrap()[0].data[0], 2);
    assert!(!first.is_held(), "dropped frame is still released");
}

#[tokio::test]
async fn feed_after_destroy_fails() {
    let state = MockState::default();
    let (_packets, sink) = collecting_sink();
    let encoder = H264Encoder::with_pipeline(config(), MockPipeline::new(state.clone()), sink);

    encoder.destroy();
    wait_until("teardown ran", || state.dropped.load(Ordering::SeqCst)).await;

    let buffer = frame(1);
    let err = encoder.feed(buffer.clone()).unwrap_err();
    assert!(matches!(err, EncoderError::Destroyed));
    assert!(!buffer.is_held());
}

#[tokio::test]
async fn dropping_the_handle_destroys_the_session() {
    let state = MockState::default();
    let (_packets, sink) = collecting_sink();
    let encoder = H264Encoder::with_pipeline(config(), MockPipeline::new(state.clone()), sink);

    drop(encoder);
    wait_until("teardown ran", || state.dropped.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn unsupported_pixel_format_fails_construction() {
    // NV12 scanout buffers have no RGB mapping; construction must refuse
    // them before acquiring any hardware resource.
    let nv12 = u32::from_le_bytes(*b"NV12");
    let result = H264Encoder::new(EncoderConfig::new(1920, 1080, nv12), |_packet| {});
    assert!(matches!(
        result,
        Err(EncoderError::UnsupportedPixelFormat(fourcc)) if fourcc == nv12
    ));
}
