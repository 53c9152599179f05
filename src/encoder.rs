//! The single-slot work scheduler and its public handle.
//!
//! [`H264Encoder`] is a cheap handle; all session state lives in a
//! scheduler task spawned at construction. The handle validates frames
//! synchronously and pushes commands over an unbounded channel, so `feed`,
//! `request_keyframe` and `destroy` never block the caller.
//!
//! The scheduler serializes everything that touches session state: command
//! handling, completion of the background encode, packet delivery and
//! teardown all run on the one task. The blocking conversion/encode cycle
//! runs under `spawn_blocking` and owns the pipeline backend by move for
//! its duration, which is what makes "at most one encode in flight" a
//! structural property rather than a lock discipline.

use crate::buffer::{FrameTransform, GpuBuffer};
use crate::config::EncoderConfig;
use crate::error::{EncoderError, Result, UnsupportedFrameError};
use crate::pipeline::vaapi::VaapiPipeline;
use crate::pipeline::{EncodePipeline, EncodedPacket, FrameRequest, ProcessOutcome};
use crate::queue::FrameQueue;
use async_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

type PacketHandler = Box<dyn FnMut(EncodedPacket) + Send>;

enum Command {
    Feed(Arc<GpuBuffer>),
    RequestKeyframe,
    Destroy,
}

/// Handle to one encoder session.
///
/// Dropping the handle requests destruction; if a frame is in flight at
/// that point, resource release is deferred until its completion.
pub struct H264Encoder {
    commands: Sender<Command>,
    fourcc: u32,
}

impl H264Encoder {
    /// Construct an encoder over the FFmpeg/VAAPI backend.
    ///
    /// Synchronous and all-or-nothing: device discovery, pixel format
    /// negotiation and the whole pipeline are set up before this returns,
    /// and a failure at any stage unwinds everything already acquired.
    /// Must be called within a tokio runtime.
    pub fn new(
        config: EncoderConfig,
        on_packet: impl FnMut(EncodedPacket) + Send + 'static,
    ) -> Result<Self> {
        let pipeline = VaapiPipeline::new(&config)?;
        Ok(Self::with_pipeline(config, pipeline, on_packet))
    }

    /// Run the scheduler over a caller-supplied pipeline backend.
    ///
    /// This is the seam the hardware-free tests drive; it is also the way
    /// to plug in an alternative backend.
    pub fn with_pipeline<P: EncodePipeline>(
        config: EncoderConfig,
        pipeline: P,
        on_packet: impl FnMut(EncodedPacket) + Send + 'static,
    ) -> Self {
        let (commands, receiver) = async_channel::unbounded();
        let scheduler = Scheduler::new(receiver, pipeline, Box::new(on_packet));
        tokio::spawn(scheduler.run());
        Self {
            commands,
            fourcc: config.fourcc,
        }
    }

    /// Admit one frame for encoding.
    ///
    /// The buffer must match the format and orientation negotiated at
    /// construction. On success the encoder takes a reference and a hold on
    /// the buffer; both are given back once the hardware pipeline has
    /// consumed (or failed to consume) the frame.
    pub fn feed(&self, buffer: Arc<GpuBuffer>) -> Result<()> {
        if buffer.transform() != FrameTransform::Normal {
            return Err(UnsupportedFrameError::Transform(buffer.transform()).into());
        }
        if buffer.fourcc() != self.fourcc {
            return Err(UnsupportedFrameError::PixelFormat {
                got: buffer.fourcc(),
                negotiated: self.fourcc,
            }
            .into());
        }
        if buffer.planes().is_empty() {
            return Err(UnsupportedFrameError::NoPlanes.into());
        }

        buffer.hold();
        if let Err(err) = self.commands.try_send(Command::Feed(buffer)) {
            if let TrySendError::Closed(Command::Feed(buffer)) = err {
                buffer.release();
            }
            return Err(EncoderError::Destroyed);
        }
        Ok(())
    }

    /// Request that the next admitted-but-not-yet-dispatched frame be
    /// encoded as a keyframe.
    pub fn request_keyframe(&self) {
        let _ = self.commands.try_send(Command::RequestKeyframe);
    }

    /// Tear the session down.
    ///
    /// Returns immediately. If a frame is in flight, resource release is
    /// deferred until its completion handler runs; no packet callback fires
    /// after this call has been made.
    pub fn destroy(&self) {
        let _ = self.commands.try_send(Command::Destroy);
    }
}

impl Drop for H264Encoder {
    fn drop(&mut self) {
        let _ = self.commands.try_send(Command::Destroy);
    }
}

/// One dispatched frame: the current-frame slot.
struct InFlight<P> {
    task: JoinHandle<(P, Option<EncodedPacket>)>,
    buffer: Arc<GpuBuffer>,
}

struct Scheduler<P: EncodePipeline> {
    commands: Receiver<Command>,
    queue: FrameQueue,
    /// `None` exactly while a background task owns the pipeline.
    pipeline: Option<P>,
    in_flight: Option<InFlight<P>>,
    next_keyframe: bool,
    pending_destroy: bool,
    on_packet: PacketHandler,
}

impl<P: EncodePipeline> Scheduler<P> {
    fn new(commands: Receiver<Command>, pipeline: P, on_packet: PacketHandler) -> Self {
        Self {
            commands,
            queue: FrameQueue::new(),
            pipeline: Some(pipeline),
            in_flight: None,
            // The first frame of a stream is always a keyframe.
            next_keyframe: true,
            pending_destroy: false,
            on_packet,
        }
    }

    async fn run(mut self) {
        loop {
            let Some(mut in_flight) = self.in_flight.take() else {
                match self.commands.recv().await {
                    Ok(cmd) => {
                        if self.handle_command(cmd, false) {
                            return;
                        }
                        continue;
                    }
                    Err(_) => {
                        // every handle is gone; same as an explicit destroy
                        self.teardown();
                        return;
                    }
                }
            };

            // One frame in flight: stay responsive to commands while the
            // background task runs.
            let done = loop {
                tokio::select! {
                    done = &mut in_flight.task => break done,
                    cmd = self.commands.recv() => match cmd {
                        Ok(cmd) => {
                            self.handle_command(cmd, true);
                        }
                        Err(_) => {
                            self.pending_destroy = true;
                            break (&mut in_flight.task).await;
                        }
                    },
                }
            };

            if self.complete(in_flight.buffer, done) {
                return;
            }
        }
    }

    /// Returns true when the session reached its terminal state.
    fn handle_command(&mut self, cmd: Command, busy: bool) -> bool {
        match cmd {
            Command::Feed(buffer) => {
                self.queue.push(buffer);
                if !busy {
                    self.dispatch_next();
                }
                false
            }
            Command::RequestKeyframe => {
                self.next_keyframe = true;
                false
            }
            Command::Destroy => {
                if busy {
                    self.pending_destroy = true;
                    false
                } else {
                    self.teardown();
                    true
                }
            }
        }
    }

    /// Completion handler: runs once per dispatched frame, serialized with
    /// command handling. Returns true when the session is destroyed.
    fn complete(
        &mut self,
        buffer: Arc<GpuBuffer>,
        done: std::result::Result<(P, Option<EncodedPacket>), JoinError>,
    ) -> bool {
        buffer.release();
        drop(buffer);

        match done {
            Ok((pipeline, packet)) => {
                self.pipeline = Some(pipeline);
                if self.pending_destroy {
                    self.teardown();
                    return true;
                }
                if let Some(packet) = packet {
                    (self.on_packet)(packet);
                }
            }
            Err(err) => {
                // The encode task panicked and took the pipeline with it;
                // nothing further can be encoded on this session.
                error!(%err, "encode task did not complete, shutting encoder down");
                self.teardown();
                return true;
            }
        }

        self.dispatch_next();
        false
    }

    fn dispatch_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(buffer) = self.queue.pop() else {
            return;
        };

        let keyframe = std::mem::replace(&mut self.next_keyframe, false);
        let mut pipeline = self
            .pipeline
            .take()
            .expect("pipeline present whenever no frame is in flight");

        let request = FrameRequest {
            buffer: buffer.clone(),
            keyframe,
        };
        debug!(
            queued = self.queue.len(),
            keyframe,
            width = request.buffer.width(),
            height = request.buffer.height(),
            "dispatching frame"
        );

        let task = tokio::task::spawn_blocking(move || {
            let packet = match pipeline.process(&request) {
                Ok(ProcessOutcome::Packet(packet)) => Some(packet),
                Ok(ProcessOutcome::NeedMore) => {
                    debug!("encoder buffered frame, no packet yet");
                    None
                }
                Err(err) => {
                    warn!(
                        %err,
                        width = request.buffer.width(),
                        height = request.buffer.height(),
                        "dropping frame after pipeline failure"
                    );
                    None
                }
            };
            (pipeline, packet)
        });

        self.in_flight = Some(InFlight { task, buffer });
    }

    fn teardown(&mut self) {
        self.commands.close();
        // Commands raced in behind the destroy still own holds.
        while let Ok(cmd) = self.commands.try_recv() {
            if let Command::Feed(buffer) = cmd {
                buffer.release();
            }
        }
        while let Some(buffer) = self.queue.pop() {
            buffer.release();
        }
        // codec session → filter graph → frames context → device context
        self.pipeline = None;
        debug!("encoder session destroyed");
    }
}
