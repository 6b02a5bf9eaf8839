use std::time::Duration;

use spinelhost_frame::{FrameQueue, ShiftScratch, MAX_QUEUED_FRAME_LEN};
use spinelhost_mainloop::{Context, Source};
use spinelhost_transport::{Result, SpinelInterface, TransportError};
use tracing::{debug, warn};

/// Mainloop source that owns the process's one radio transport.
///
/// Frames the transport refuses with `Busy` are parked in a FIFO backlog and
/// retried after every mainloop iteration, in order, until the transport refuses
/// again. While anything is parked the mainloop does not sleep.
pub struct RadioSource {
    interface: Box<dyn SpinelInterface>,
    backlog: FrameQueue,
    stalled: Option<Vec<u8>>,
}

impl RadioSource {
    pub fn new(interface: Box<dyn SpinelInterface>) -> Self {
        Self {
            interface,
            backlog: FrameQueue::new(),
            stalled: None,
        }
    }

    pub fn interface(&self) -> &dyn SpinelInterface {
        self.interface.as_ref()
    }

    pub fn interface_mut(&mut self) -> &mut dyn SpinelInterface {
        self.interface.as_mut()
    }

    /// Whether frames are waiting for the transport.
    pub fn has_backlog(&self) -> bool {
        self.stalled.is_some() || !self.backlog.is_empty()
    }

    /// Send `frame`, or park it if the transport is busy.
    ///
    /// Frames never overtake parked ones. Parking fails with `NoBufs` when the
    /// backlog is full or the frame is too long to park.
    pub fn send(&mut self, frame: &[u8]) -> Result<()> {
        if !self.has_backlog() {
            match self.interface.send_frame(frame) {
                Err(TransportError::Busy) => {}
                other => return other,
            }
        }
        if frame.len() > MAX_QUEUED_FRAME_LEN {
            return Err(TransportError::NoBufs);
        }
        self.backlog.push(frame)?;
        debug!(len = frame.len(), "transport busy, frame parked");
        Ok(())
    }

    /// Retry parked frames in order until the transport is busy again.
    pub fn drain(&mut self) {
        let mut scratch: ShiftScratch = [0; MAX_QUEUED_FRAME_LEN];
        loop {
            let frame = match self.stalled.take() {
                Some(frame) => frame,
                None => match self.backlog.shift(&mut scratch) {
                    Some(frame) => frame.to_vec(),
                    None => return,
                },
            };

            match self.interface.send_frame(&frame) {
                Ok(()) => {}
                Err(TransportError::Busy) => {
                    self.stalled = Some(frame);
                    return;
                }
                Err(err) => warn!(len = frame.len(), error = %err, "dropping parked frame"),
            }
        }
    }
}

impl Source for RadioSource {
    fn update(&mut self, ctx: &mut Context) {
        self.interface.update_fd_set(ctx);
        if self.has_backlog() {
            ctx.set_timeout_if_earlier(Duration::ZERO);
        }
    }

    fn process(&mut self, ctx: &Context) {
        self.interface.process(ctx);
        self.drain();
    }
}

impl Drop for RadioSource {
    fn drop(&mut self) {
        self.interface.deinit();
    }
}
