use std::fmt;
use std::time::Duration;

use spinelhost_frame::RxFrameBuffer;
use spinelhost_mainloop::Context;

use crate::error::Result;
use crate::url::RadioUrl;

/// Called once per received frame.
///
/// The frame is the current frame of the buffer. The callback must either
/// `save_frame()` it to keep it or `discard_frame()` it.
pub type ReceiveFrameCallback = Box<dyn FnMut(&mut RxFrameBuffer)>;

/// Which kind of link a transport drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Hdlc,
    Spi,
    Vendor,
    Cpc,
}

impl InterfaceType {
    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceType::Hdlc => "hdlc",
            InterfaceType::Spi => "spi",
            InterfaceType::Vendor => "vendor",
            InterfaceType::Cpc => "cpc",
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link-level counters kept by transports that frame the byte stream themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcpInterfaceMetrics {
    pub interface_type: InterfaceType,
    pub transferred_frame_count: u64,
    pub transferred_valid_frame_count: u64,
    pub transferred_garbage_frame_count: u64,
    pub rx_frame_count: u64,
    pub rx_frame_byte_count: u64,
    pub tx_frame_count: u64,
    pub tx_frame_byte_count: u64,
}

impl RcpInterfaceMetrics {
    pub fn new(interface_type: InterfaceType) -> Self {
        Self {
            interface_type,
            transferred_frame_count: 0,
            transferred_valid_frame_count: 0,
            transferred_garbage_frame_count: 0,
            rx_frame_count: 0,
            rx_frame_byte_count: 0,
            tx_frame_count: 0,
            tx_frame_byte_count: 0,
        }
    }
}

/// A link between the host and the RCP that moves whole spinel frames.
///
/// Life cycle: construct, [`init`](Self::init) once, then any mix of sends, waits and
/// mainloop iterations, then [`deinit`](Self::deinit). `deinit` may be called any
/// number of times.
///
/// Received frames are appended to the transport's [`RxFrameBuffer`] and announced
/// through the [`ReceiveFrameCallback`] given at construction.
pub trait SpinelInterface {
    /// Open and configure the channel described by `url`.
    ///
    /// Returns [`TransportError::Already`](crate::TransportError::Already) if the
    /// channel is already open.
    fn init(&mut self, url: &RadioUrl) -> Result<()>;

    /// Close the channel. A no-op when already closed.
    fn deinit(&mut self);

    /// Transmit one spinel frame.
    ///
    /// An empty frame is `InvalidArgs`, a frame above `MAX_FRAME_SIZE` is `NoBufs`.
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Block until bytes of a frame arrive or `timeout` elapses (`ResponseTimeout`).
    ///
    /// Unexpected channel errors terminate the process.
    fn wait_for_frame(&mut self, timeout: Duration) -> Result<()>;

    /// Register fds and deadlines for the next mainloop iteration.
    fn update_fd_set(&mut self, ctx: &mut Context);

    /// Handle readiness after the mainloop's `select()` returned.
    fn process(&mut self, ctx: &Context);

    /// Nominal link speed in bits per second.
    fn bus_speed(&self) -> u32;

    fn interface_type(&self) -> InterfaceType;

    /// The RCP reported a reset; drop any link sequencing state.
    fn on_rcp_reset(&mut self) {}

    /// Recreate the connection after the RCP reset, for transports that need it.
    fn reset_connection(&mut self) -> Result<()> {
        Ok(())
    }

    fn rcp_interface_metrics(&self) -> Option<&RcpInterfaceMetrics> {
        None
    }
}

/// Shared argument checks for `send_frame`.
pub(crate) fn check_tx_frame(frame: &[u8]) -> Result<()> {
    if frame.is_empty() {
        return Err(crate::TransportError::InvalidArgs("empty frame".into()));
    }
    if frame.len() > spinelhost_frame::MAX_FRAME_SIZE {
        return Err(crate::TransportError::NoBufs);
    }
    Ok(())
}
